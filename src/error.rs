use thiserror::Error;
use tracing::{error, warn};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    Service {
        message: String,
        correlation_id: Option<String>,
    },

    #[error("document directory unavailable: {message}")]
    DirectoryFetch { message: String },

    #[error("result feed error: {message}")]
    Feed { message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::validation", %message, "validation error");
        AppError::Validation { message }
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::service_with_correlation(message, None)
    }

    pub fn service_with_correlation(
        message: impl Into<String>,
        correlation_id: Option<&str>,
    ) -> Self {
        let message = message.into();
        let correlation_id = correlation_id.map(|value| value.to_string());
        match &correlation_id {
            Some(id) => {
                warn!(target: "app::prediction::error", correlation_id = %id, %message, "service error")
            }
            None => warn!(target: "app::prediction::error", %message, "service error"),
        }
        AppError::Service {
            message,
            correlation_id,
        }
    }

    pub fn directory_fetch(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::directory", %message, "document directory fetch failed");
        AppError::DirectoryFetch { message }
    }

    pub fn feed(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::feed", %message, "result feed error");
        AppError::Feed { message }
    }

    pub fn config(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::config", %message, "configuration error");
        AppError::Config { message }
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::other", %message, "other error");
        AppError::Other(message)
    }

    /// Relabels an already logged call failure as a directory error.
    pub fn into_directory_fetch(self) -> Self {
        AppError::DirectoryFetch {
            message: self.with_correlation_suffix(),
        }
    }

    /// Relabels an already logged call failure as a feed error.
    pub fn into_feed(self) -> Self {
        AppError::Feed {
            message: self.with_correlation_suffix(),
        }
    }

    fn with_correlation_suffix(&self) -> String {
        match self.correlation_id() {
            Some(id) => format!("{self} (correlation id {id})"),
            None => self.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::Validation { .. })
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            AppError::Service { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }
}
