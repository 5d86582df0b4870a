use crate::error::AppError;
use crate::services::orchestrator::{PredictionView, RequestOutcome};

use super::{AppState, CommandError, CommandResult};

/// Triggers a prediction and returns the state once it settles.
///
/// Validation failures are reported as errors; service failures are part of
/// the returned view, with the previous result still in place.
pub async fn prediction_request(state: &AppState) -> CommandResult<PredictionView> {
    let orchestrator = state.prediction();
    match orchestrator.request().await {
        RequestOutcome::Rejected(message) => {
            Err(CommandError::from(AppError::Validation { message }))
        }
        RequestOutcome::Discarded => Err(CommandError::new(
            "SESSION_CLOSED",
            "session ended before the prediction completed",
            None,
        )),
        RequestOutcome::Succeeded
        | RequestOutcome::Failed(_)
        | RequestOutcome::AlreadyRequesting => Ok(orchestrator.snapshot()),
    }
}

pub fn prediction_state(state: &AppState) -> CommandResult<PredictionView> {
    Ok(state.prediction().snapshot())
}

pub fn prediction_acknowledge(state: &AppState) -> CommandResult<PredictionView> {
    Ok(state.prediction().acknowledge())
}

pub async fn documents_refresh(state: &AppState) -> CommandResult<PredictionView> {
    let orchestrator = state.prediction();
    orchestrator.refresh_documents().await;
    Ok(orchestrator.snapshot())
}
