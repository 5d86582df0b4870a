pub mod prediction;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, warn};

use crate::error::{AppError, AppResult};
use crate::models::session::SessionIdentity;
use crate::models::settings::AppSettings;
use crate::services::orchestrator::PredictionOrchestrator;
use crate::services::prediction_service::HttpPredictionClient;
use crate::services::result_feed::PollingResultFeed;

/// Services bound to one signed-in user.
#[derive(Clone)]
pub struct AppState {
    settings: AppSettings,
    orchestrator: Arc<PredictionOrchestrator>,
}

impl AppState {
    /// Wires the HTTP client, polling feed and orchestrator, then starts the session.
    pub async fn start_session(settings: AppSettings, session: SessionIdentity) -> AppResult<Self> {
        let client = Arc::new(HttpPredictionClient::try_new(&settings, session.clone())?);
        let feed = Arc::new(PollingResultFeed::new(
            Arc::clone(&client),
            settings.feed_poll_interval,
        ));

        let orchestrator = Arc::new(PredictionOrchestrator::new(
            session,
            client.clone(),
            client,
            feed,
            settings.reconcile_policy,
        ));
        orchestrator.start().await;

        Ok(Self::from_parts(settings, orchestrator))
    }

    pub fn from_parts(settings: AppSettings, orchestrator: Arc<PredictionOrchestrator>) -> Self {
        Self {
            settings,
            orchestrator,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn prediction(&self) -> Arc<PredictionOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub async fn end_session(&self) {
        self.orchestrator.shutdown().await;
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl CommandError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<JsonValue>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details,
        }
    }
}

impl From<AppError> for CommandError {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Validation { message } => CommandError::new("VALIDATION_ERROR", message, None),
            AppError::Service {
                message,
                correlation_id,
            } => CommandError::new(
                "SERVICE_ERROR",
                message,
                correlation_id.map(|id| json!({ "correlationId": id })),
            ),
            AppError::DirectoryFetch { message } => {
                warn!(target: "app::command", %message, "directory error in command");
                CommandError::new("DIRECTORY_ERROR", message, None)
            }
            AppError::Feed { message } => {
                warn!(target: "app::command", %message, "feed error in command");
                CommandError::new("FEED_ERROR", message, None)
            }
            AppError::Config { message } => {
                error!(target: "app::command", %message, "configuration error in command");
                CommandError::new("CONFIG_ERROR", message, None)
            }
            AppError::Serialization(error) => {
                error!(target: "app::command", error = %error, "serialization error in command");
                CommandError::new("UNKNOWN", "serialization failed", None)
            }
            AppError::Io(error) => {
                error!(target: "app::command", error = %error, "io error in command");
                CommandError::new("UNKNOWN", "file system access failed", None)
            }
            AppError::Other(message) => {
                error!(target: "app::command", %message, "unexpected error in command");
                CommandError::new("UNKNOWN", message, None)
            }
        }
    }
}
