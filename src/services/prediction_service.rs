use std::time::{Duration as StdDuration, Instant};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::document::DocumentListResponse;
use crate::models::prediction::{FeedRecord, LatestPredictionResponse, PredictionResponse};
use crate::models::session::SessionIdentity;
use crate::models::settings::AppSettings;
use crate::services::document_directory::DocumentDirectory;
use crate::services::result_feed::LatestPredictionSource;

/// Remote procedure that computes and persists a prediction.
#[async_trait::async_trait]
pub trait PredictionService: Send + Sync {
    async fn predict_grades(&self) -> AppResult<PredictionResponse>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallableFunction {
    UserDocuments,
    PredictGrades,
    LatestPredictions,
}

impl CallableFunction {
    fn as_str(self) -> &'static str {
        match self {
            CallableFunction::UserDocuments => "get_user_documents",
            CallableFunction::PredictGrades => "predict_grades",
            CallableFunction::LatestPredictions => "get_latest_predictions",
        }
    }

    /// Reads may be retried; a prediction run is issued exactly once.
    fn retries_allowed(self) -> bool {
        !matches!(self, CallableFunction::PredictGrades)
    }
}

const DEFAULT_BACKOFF: [StdDuration; 3] = [
    StdDuration::from_secs(0),
    StdDuration::from_secs(1),
    StdDuration::from_secs(2),
];

/// Client for the HTTPS callable functions behind the prediction feature.
pub struct HttpPredictionClient {
    client: reqwest::Client,
    base_url: String,
    session: SessionIdentity,
    backoff: Vec<StdDuration>,
}

impl HttpPredictionClient {
    pub fn try_new(settings: &AppSettings, session: SessionIdentity) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Some(StdDuration::from_secs(90)))
            .build()
            .map_err(|err| AppError::config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            session,
            backoff: DEFAULT_BACKOFF.to_vec(),
        })
    }

    pub fn with_backoff(mut self, backoff: Vec<StdDuration>) -> Self {
        if !backoff.is_empty() {
            self.backoff = backoff;
        }
        self
    }

    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    fn endpoint(&self, function: CallableFunction) -> String {
        format!("{}/{}", self.base_url, function.as_str())
    }

    async fn invoke<T: DeserializeOwned>(&self, function: CallableFunction) -> AppResult<T> {
        let correlation_id = Uuid::new_v4().to_string();
        let endpoint = self.endpoint(function);
        let schedule = if function.retries_allowed() {
            &self.backoff[..]
        } else {
            &self.backoff[..1]
        };

        let mut last_error: Option<AppError> = None;

        for (attempt, delay) in schedule.iter().enumerate() {
            if !delay.is_zero() {
                sleep(*delay).await;
            }

            debug!(
                target: "app::http",
                function = function.as_str(),
                attempt = attempt + 1,
                correlation_id = %correlation_id,
                user_id = %self.session.user_id,
                "invoking callable"
            );

            let start = Instant::now();
            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(&self.session.id_token)
                .json(&json!({ "data": {} }))
                .send()
                .await;

            let is_last = attempt == schedule.len() - 1;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(
                            target: "app::http",
                            function = function.as_str(),
                            correlation_id = %correlation_id,
                            latency_ms = start.elapsed().as_millis() as u64,
                            "callable responded"
                        );
                        let body: JsonValue = resp.json().await.map_err(|err| {
                            AppError::service_with_correlation(
                                format!("failed to decode response: {err}"),
                                Some(correlation_id.as_str()),
                            )
                        })?;
                        return Self::unwrap_result(body, &correlation_id);
                    }

                    let server_message = resp
                        .json::<JsonValue>()
                        .await
                        .ok()
                        .and_then(|body| {
                            body.pointer("/error/message")
                                .and_then(|value| value.as_str())
                                .map(str::to_string)
                        });
                    let (error, retryable) =
                        Self::map_http_error(status, server_message, &correlation_id);
                    warn!(
                        target: "app::http",
                        function = function.as_str(),
                        correlation_id = %correlation_id,
                        status = status.as_u16(),
                        retryable,
                        "callable returned non-success status"
                    );

                    if !retryable || is_last {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(err) => {
                    let (error, retryable) = Self::error_from_reqwest(err, &correlation_id);
                    warn!(
                        target: "app::http",
                        function = function.as_str(),
                        correlation_id = %correlation_id,
                        retryable,
                        "callable transport error"
                    );

                    if !retryable || is_last {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::service_with_correlation("prediction service request failed", Some(correlation_id.as_str()))
        }))
    }

    fn unwrap_result<T: DeserializeOwned>(mut body: JsonValue, correlation_id: &str) -> AppResult<T> {
        let result = body
            .get_mut("result")
            .map(JsonValue::take)
            .ok_or_else(|| {
                AppError::service_with_correlation(
                    "response is missing the result field",
                    Some(correlation_id),
                )
            })?;

        serde_json::from_value(result).map_err(|err| {
            AppError::service_with_correlation(
                format!("unexpected response shape: {err}"),
                Some(correlation_id),
            )
        })
    }

    fn map_http_error(
        status: StatusCode,
        server_message: Option<String>,
        correlation_id: &str,
    ) -> (AppError, bool) {
        let (fallback, retryable) = match status {
            StatusCode::UNAUTHORIZED => ("session is not authenticated".to_string(), false),
            StatusCode::FORBIDDEN => ("not permitted to request predictions".to_string(), false),
            StatusCode::TOO_MANY_REQUESTS => (
                "too many prediction requests, try again later".to_string(),
                true,
            ),
            status if status.is_server_error() => (
                format!("prediction service unavailable (status {})", status.as_u16()),
                true,
            ),
            StatusCode::BAD_REQUEST => ("invalid prediction request".to_string(), false),
            StatusCode::NOT_FOUND => ("prediction endpoint not found".to_string(), false),
            status => (
                format!("prediction service returned status {}", status.as_u16()),
                false,
            ),
        };

        let message = server_message
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(fallback);

        (
            AppError::service_with_correlation(message, Some(correlation_id)),
            retryable,
        )
    }

    fn error_from_reqwest(err: reqwest::Error, correlation_id: &str) -> (AppError, bool) {
        if err.is_timeout() {
            (
                AppError::service_with_correlation(
                    "prediction service timed out",
                    Some(correlation_id),
                ),
                true,
            )
        } else if err.is_connect() {
            (
                AppError::service_with_correlation(
                    "could not reach prediction service",
                    Some(correlation_id),
                ),
                true,
            )
        } else if let Some(status) = err.status() {
            Self::map_http_error(status, None, correlation_id)
        } else {
            (
                AppError::service_with_correlation(
                    format!("prediction request failed: {err}"),
                    Some(correlation_id),
                ),
                false,
            )
        }
    }
}

#[async_trait::async_trait]
impl PredictionService for HttpPredictionClient {
    async fn predict_grades(&self) -> AppResult<PredictionResponse> {
        self.invoke(CallableFunction::PredictGrades).await
    }
}

#[async_trait::async_trait]
impl DocumentDirectory for HttpPredictionClient {
    async fn get_user_documents(&self) -> AppResult<DocumentListResponse> {
        self.invoke(CallableFunction::UserDocuments)
            .await
            .map_err(AppError::into_directory_fetch)
    }
}

#[async_trait::async_trait]
impl LatestPredictionSource for HttpPredictionClient {
    async fn latest_prediction(&self) -> AppResult<Option<FeedRecord>> {
        let response: LatestPredictionResponse = self
            .invoke(CallableFunction::LatestPredictions)
            .await
            .map_err(AppError::into_feed)?;

        if response.success {
            Ok(response.prediction)
        } else {
            Err(AppError::feed(
                response
                    .message
                    .unwrap_or_else(|| "latest prediction lookup failed".to_string()),
            ))
        }
    }
}

pub mod testing {
    use super::*;

    /// Status mapping with a fixed correlation id, for integration tests.
    pub fn map_http_error(status: StatusCode, server_message: Option<&str>) -> (AppError, bool) {
        HttpPredictionClient::map_http_error(
            status,
            server_message.map(str::to_string),
            "test-correlation-id",
        )
    }

    /// Client against `base_url` that retries without sleeping.
    pub fn client_for(base_url: &str, timeout: StdDuration) -> AppResult<HttpPredictionClient> {
        let settings = AppSettings {
            api_base_url: base_url.trim_end_matches('/').to_string(),
            http_timeout: timeout,
            ..AppSettings::default()
        };
        let client = HttpPredictionClient::try_new(&settings, SessionIdentity::new("user-1", "test-token"))?;
        Ok(client.with_backoff(vec![StdDuration::ZERO; 3]))
    }
}
