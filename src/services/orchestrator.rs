//! Request lifecycle and result reconciliation for one user session.
//!
//! The orchestrator owns a single "current result" cell fed by two sources:
//! the direct `predict_grades` response and the result feed. Both overwrite
//! the cell wholesale. The document set is pulled once in [`start`] and only
//! re-pulled when the host calls [`refresh_documents`]; it is not live.
//!
//! [`start`]: PredictionOrchestrator::start
//! [`refresh_documents`]: PredictionOrchestrator::refresh_documents

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::document::DocumentRef;
use crate::models::prediction::{FeedRecord, Prediction, PredictionResponse};
use crate::models::session::SessionIdentity;
use crate::models::settings::ReconcilePolicy;
use crate::services::document_directory::{self, DocumentDirectory};
use crate::services::prediction_service::PredictionService;
use crate::services::readiness::{Readiness, NOT_READY_MESSAGE};
use crate::services::result_feed::{FeedEvent, FeedSubscription, ResultFeed};

const EMPTY_PREDICTION_MESSAGE: &str = "prediction service returned no prediction";
const UNSPECIFIED_FAILURE_MESSAGE: &str = "prediction failed";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RequestPhase {
    #[default]
    Idle,
    Requesting,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ResultSource {
    Direct,
    Feed,
}

/// Read-only state handed to presentation.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PredictionView {
    pub phase: RequestPhase,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResultSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub readiness: Readiness,
    pub document_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Succeeded,
    Failed(String),
    /// Readiness gate refused the request; no remote call was made.
    Rejected(String),
    /// Another request was already in flight; dropped, not queued.
    AlreadyRequesting,
    /// Session ended before the response arrived; the response was ignored.
    Discarded,
}

#[derive(Debug, Default)]
struct OrchestratorState {
    phase: RequestPhase,
    current: Option<Prediction>,
    source: Option<ResultSource>,
    error: Option<String>,
    documents: Vec<DocumentRef>,
    newest_feed_at: Option<DateTime<Utc>>,
    closed: bool,
}

impl OrchestratorState {
    fn view(&self) -> PredictionView {
        PredictionView {
            phase: self.phase,
            busy: self.phase == RequestPhase::Requesting,
            result: self.current.clone(),
            source: self.source,
            error: self.error.clone(),
            readiness: Readiness::evaluate(&self.documents),
            document_count: self.documents.len(),
        }
    }

    fn store(&mut self, prediction: Prediction, source: ResultSource) {
        for issue in prediction.quality_issues() {
            warn!(target: "app::prediction", issue = ?issue, "prediction data quality issue");
        }
        self.current = Some(prediction);
        self.source = Some(source);
    }
}

struct Shared {
    state: Mutex<OrchestratorState>,
    updates: watch::Sender<PredictionView>,
    policy: ReconcilePolicy,
    user_id: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &OrchestratorState) {
        self.updates.send_replace(state.view());
    }

    fn apply_feed_event(&self, event: FeedEvent) {
        let mut state = self.lock();
        if state.closed {
            debug!(target: "app::feed", user_id = %self.user_id, "feed event after teardown ignored");
            return;
        }

        match event {
            FeedEvent::Snapshot(None) => {
                debug!(target: "app::feed", user_id = %self.user_id, "empty feed snapshot");
            }
            FeedEvent::Snapshot(Some(FeedRecord {
                prediction,
                created_at,
            })) => {
                if self.policy == ReconcilePolicy::NewestFeedRecord
                    && state.newest_feed_at.is_some_and(|newest| created_at < newest)
                {
                    debug!(
                        target: "app::feed",
                        user_id = %self.user_id,
                        %created_at,
                        "stale feed record dropped"
                    );
                    return;
                }

                state.newest_feed_at = Some(
                    state
                        .newest_feed_at
                        .map_or(created_at, |newest| newest.max(created_at)),
                );
                state.store(prediction, ResultSource::Feed);
                debug!(target: "app::feed", user_id = %self.user_id, %created_at, "feed record applied");
                self.publish(&state);
            }
            FeedEvent::Error(message) => {
                warn!(
                    target: "app::feed",
                    user_id = %self.user_id,
                    %message,
                    "feed error; keeping current result"
                );
            }
        }
    }
}

struct FeedTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PredictionOrchestrator {
    session: SessionIdentity,
    service: Arc<dyn PredictionService>,
    directory: Arc<dyn DocumentDirectory>,
    feed: Arc<dyn ResultFeed>,
    shared: Arc<Shared>,
    feed_task: Mutex<Option<FeedTask>>,
}

impl PredictionOrchestrator {
    pub fn new(
        session: SessionIdentity,
        service: Arc<dyn PredictionService>,
        directory: Arc<dyn DocumentDirectory>,
        feed: Arc<dyn ResultFeed>,
        policy: ReconcilePolicy,
    ) -> Self {
        let initial = OrchestratorState::default();
        let (updates, _) = watch::channel(initial.view());
        let shared = Arc::new(Shared {
            state: Mutex::new(initial),
            updates,
            policy,
            user_id: session.user_id.clone(),
        });

        Self {
            session,
            service,
            directory,
            feed,
            shared,
            feed_task: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    /// Session start: pulls the document set once and opens the feed.
    ///
    /// Feed subscription failures are logged and the session continues
    /// without push updates.
    pub async fn start(&self) {
        self.refresh_documents().await;

        if self.shared.lock().closed {
            return;
        }

        match self.feed.subscribe(&self.session).await {
            Ok(subscription) => {
                if !self.attach_feed(subscription) {
                    debug!(
                        target: "app::feed",
                        user_id = %self.session.user_id,
                        "session closed during subscribe; subscription released"
                    );
                }
            }
            Err(error) => {
                warn!(
                    target: "app::feed",
                    user_id = %self.session.user_id,
                    error = %error,
                    "result feed subscription failed"
                );
            }
        }
    }

    /// Replaces the document snapshot with a fresh pull.
    pub async fn refresh_documents(&self) -> Readiness {
        let documents = document_directory::refresh(self.directory.as_ref()).await;
        let mut state = self.shared.lock();
        if state.closed {
            return Readiness::evaluate(&state.documents);
        }
        state.documents = documents;
        let readiness = Readiness::evaluate(&state.documents);
        debug!(
            target: "app::prediction",
            user_id = %self.session.user_id,
            readiness = ?readiness,
            "document snapshot updated"
        );
        self.shared.publish(&state);
        readiness
    }

    /// Spawns the feed task unless the session already closed.
    ///
    /// The task slot stays locked across the `closed` check so a concurrent
    /// `shutdown` either sees the new task or this call sees `closed`.
    fn attach_feed(&self, mut subscription: FeedSubscription) -> bool {
        let mut slot = self
            .feed_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.lock().closed {
            drop(subscription);
            return false;
        }

        let shared = Arc::clone(&self.shared);
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    event = subscription.next() => match event {
                        Some(event) => shared.apply_feed_event(event),
                        None => {
                            debug!(target: "app::feed", user_id = %shared.user_id, "feed source ended");
                            break;
                        }
                    },
                }
            }
            drop(subscription);
        });

        let previous = slot.replace(FeedTask { shutdown, handle });
        drop(slot);
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(());
            previous.handle.abort();
        }
        true
    }

    /// Issues a prediction request if the gate allows and nothing is in flight.
    pub async fn request(&self) -> RequestOutcome {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return RequestOutcome::Discarded;
            }
            if state.phase == RequestPhase::Requesting {
                debug!(target: "app::prediction", user_id = %self.session.user_id, "request dropped while busy");
                return RequestOutcome::AlreadyRequesting;
            }
            if !Readiness::evaluate(&state.documents).can_request() {
                let error = AppError::validation(NOT_READY_MESSAGE);
                let message = error.to_string();
                state.error = Some(message.clone());
                self.shared.publish(&state);
                return RequestOutcome::Rejected(message);
            }

            state.phase = RequestPhase::Requesting;
            self.shared.publish(&state);
        }

        info!(target: "app::prediction", user_id = %self.session.user_id, "prediction requested");
        let response = self.service.predict_grades().await;

        let mut state = self.shared.lock();
        if state.closed {
            debug!(target: "app::prediction", user_id = %self.session.user_id, "response after teardown discarded");
            return RequestOutcome::Discarded;
        }

        let outcome = match response {
            Ok(PredictionResponse {
                success: true,
                prediction: Some(prediction),
                ..
            }) => {
                state.store(prediction, ResultSource::Direct);
                state.error = None;
                state.phase = RequestPhase::Succeeded;
                info!(target: "app::prediction", user_id = %self.session.user_id, "prediction stored");
                RequestOutcome::Succeeded
            }
            Ok(PredictionResponse {
                success: true,
                prediction: None,
                ..
            }) => Self::fail(&mut state, EMPTY_PREDICTION_MESSAGE.to_string()),
            Ok(PredictionResponse { message, .. }) => Self::fail(
                &mut state,
                message.unwrap_or_else(|| UNSPECIFIED_FAILURE_MESSAGE.to_string()),
            ),
            Err(error) => Self::fail(&mut state, error.to_string()),
        };

        self.shared.publish(&state);
        outcome
    }

    fn fail(state: &mut OrchestratorState, message: String) -> RequestOutcome {
        warn!(target: "app::prediction", %message, "prediction request failed");
        state.error = Some(message.clone());
        state.phase = RequestPhase::Failed;
        RequestOutcome::Failed(message)
    }

    /// Moves a finished request back to `Idle` and clears the visible error.
    pub fn acknowledge(&self) -> PredictionView {
        let mut state = self.shared.lock();
        if matches!(state.phase, RequestPhase::Succeeded | RequestPhase::Failed) {
            state.phase = RequestPhase::Idle;
        }
        if state.phase != RequestPhase::Requesting {
            state.error = None;
        }
        self.shared.publish(&state);
        state.view()
    }

    pub fn snapshot(&self) -> PredictionView {
        self.shared.lock().view()
    }

    pub fn watch(&self) -> watch::Receiver<PredictionView> {
        self.shared.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Ends the session: stops state mutation and releases the feed.
    ///
    /// When this returns the feed subscription has been dropped.
    pub async fn shutdown(&self) {
        self.shared.lock().closed = true;

        let task = self
            .feed_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(FeedTask { shutdown, handle }) = task {
            let _ = shutdown.send(());
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    warn!(target: "app::feed", error = %error, "feed task ended abnormally");
                }
            }
        }

        info!(target: "app::prediction", user_id = %self.session.user_id, "prediction session closed");
    }
}

impl Drop for PredictionOrchestrator {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        let task = self
            .feed_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(FeedTask { shutdown, handle }) = task {
            let _ = shutdown.send(());
            handle.abort();
        }
    }
}
