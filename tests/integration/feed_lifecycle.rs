use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};
use gradewise_app_lib::error::{AppError, AppResult};
use gradewise_app_lib::models::document::{
    DocumentListResponse, DocumentRef, DocumentStatus, DocumentType,
};
use gradewise_app_lib::models::prediction::{FeedRecord, GradeValue, Prediction, PredictionResponse};
use gradewise_app_lib::models::session::SessionIdentity;
use gradewise_app_lib::models::settings::ReconcilePolicy;
use gradewise_app_lib::services::document_directory::DocumentDirectory;
use gradewise_app_lib::services::orchestrator::{
    PredictionOrchestrator, PredictionView, RequestOutcome, ResultSource,
};
use gradewise_app_lib::services::prediction_service::PredictionService;
use gradewise_app_lib::services::result_feed::{
    FeedEvent, FeedStream, FeedSubscription, LocalResultFeed, ResultFeed,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

const USER: &str = "student-7";

fn prediction(percentage: f64) -> Prediction {
    Prediction {
        grade: GradeValue::Label(format!("{percentage:.0}%")),
        current_percentage: percentage,
        letter_grade: "B".into(),
        min_possible_grade: 0.0,
        max_possible_grade: 100.0,
        reasoning: "feed".into(),
        ai_prediction: None,
        categorized_grades: BTreeMap::new(),
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

fn record(percentage: f64, secs: i64) -> FeedRecord {
    FeedRecord {
        prediction: prediction(percentage),
        created_at: at(secs),
    }
}

struct ProcessedDirectory;

#[async_trait::async_trait]
impl DocumentDirectory for ProcessedDirectory {
    async fn get_user_documents(&self) -> AppResult<DocumentListResponse> {
        Ok(DocumentListResponse {
            success: true,
            documents: Some(vec![DocumentRef {
                id: "transcript-1".into(),
                document_type: DocumentType::Transcript,
                status: DocumentStatus::Processed,
            }]),
            message: None,
        })
    }
}

struct FixedService {
    response: Mutex<Option<AppResult<PredictionResponse>>>,
    calls: AtomicUsize,
}

impl FixedService {
    fn new(response: AppResult<PredictionResponse>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Some(response)),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl PredictionService for FixedService {
    async fn predict_grades(&self) -> AppResult<PredictionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.response.lock().unwrap().take();
        response.unwrap_or_else(|| Err(AppError::service("exhausted")))
    }
}

/// Feed whose events are pushed by the test verbatim, without newest-first filtering.
struct ManualFeed {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
}

struct ManualStream(mpsc::UnboundedReceiver<FeedEvent>);

#[async_trait::async_trait]
impl FeedStream for ManualStream {
    async fn next(&mut self) -> Option<FeedEvent> {
        self.0.recv().await
    }
}

#[async_trait::async_trait]
impl ResultFeed for ManualFeed {
    async fn subscribe(&self, session: &SessionIdentity) -> AppResult<FeedSubscription> {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::feed("already subscribed"))?;
        Ok(FeedSubscription::new(
            session.user_id.clone(),
            Box::new(ManualStream(receiver)),
        ))
    }
}

fn manual_feed() -> (Arc<ManualFeed>, mpsc::UnboundedSender<FeedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ManualFeed {
            receiver: Mutex::new(Some(rx)),
        }),
        tx,
    )
}

struct FailingFeed;

#[async_trait::async_trait]
impl ResultFeed for FailingFeed {
    async fn subscribe(&self, _session: &SessionIdentity) -> AppResult<FeedSubscription> {
        Err(AppError::feed("permission denied"))
    }
}

/// Local feed whose `subscribe` waits until the test opens the gate.
struct GatedFeed {
    inner: LocalResultFeed,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait::async_trait]
impl ResultFeed for GatedFeed {
    async fn subscribe(&self, session: &SessionIdentity) -> AppResult<FeedSubscription> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.inner.subscribe(session).await
    }
}

async fn started(
    service: Arc<FixedService>,
    feed: Arc<dyn ResultFeed>,
    policy: ReconcilePolicy,
) -> PredictionOrchestrator {
    let orchestrator = PredictionOrchestrator::new(
        SessionIdentity::new(USER, "token"),
        service,
        Arc::new(ProcessedDirectory),
        feed,
        policy,
    );
    orchestrator.start().await;
    orchestrator
}

fn unused_service() -> Arc<FixedService> {
    FixedService::new(Err(AppError::service("not expected")))
}

async fn wait_for_view<F>(orchestrator: &PredictionOrchestrator, predicate: F) -> PredictionView
where
    F: FnMut(&PredictionView) -> bool,
{
    let mut updates = orchestrator.watch();
    let view = timeout(StdDuration::from_secs(2), updates.wait_for(predicate))
        .await
        .expect("state change within timeout")
        .expect("orchestrator alive");
    view.clone()
}

/// Lets the feed task drain whatever is already queued.
async fn settle() {
    sleep(StdDuration::from_millis(20)).await;
}

#[tokio::test]
async fn later_feed_record_wins() {
    let feed = LocalResultFeed::new();
    let orchestrator = started(
        unused_service(),
        Arc::new(feed.clone()),
        ReconcilePolicy::LastWriterWins,
    )
    .await;

    feed.publish(USER, record(72.0, 1));
    feed.publish(USER, record(79.0, 2));

    let view = wait_for_view(&orchestrator, |view| {
        view.result.as_ref().map(|p| p.current_percentage) == Some(79.0)
    })
    .await;
    assert_eq!(view.result, Some(prediction(79.0)));
    assert_eq!(view.source, Some(ResultSource::Feed));
}

#[tokio::test]
async fn initial_snapshot_is_applied_on_start() {
    let feed = LocalResultFeed::new();
    feed.publish(USER, record(65.0, 1));

    let orchestrator = started(
        unused_service(),
        Arc::new(feed),
        ReconcilePolicy::LastWriterWins,
    )
    .await;

    let view = wait_for_view(&orchestrator, |view| view.result.is_some()).await;
    assert_eq!(view.result, Some(prediction(65.0)));
}

#[tokio::test]
async fn empty_snapshot_keeps_current_result() {
    let p1 = prediction(90.0);
    let feed = LocalResultFeed::new();
    let orchestrator = started(
        FixedService::new(Ok(PredictionResponse {
            success: true,
            prediction: Some(p1.clone()),
            message: None,
        })),
        Arc::new(feed.clone()),
        ReconcilePolicy::LastWriterWins,
    )
    .await;

    assert_eq!(orchestrator.request().await, RequestOutcome::Succeeded);

    feed.publish(USER, record(90.0, 1));
    wait_for_view(&orchestrator, |view| view.source == Some(ResultSource::Feed)).await;

    feed.clear(USER);
    settle().await;

    assert_eq!(orchestrator.snapshot().result, Some(p1));
}

#[tokio::test]
async fn feed_record_replaces_result_after_failed_request() {
    let feed = LocalResultFeed::new();
    let orchestrator = started(
        FixedService::new(Ok(PredictionResponse {
            success: false,
            prediction: None,
            message: Some("model busy".into()),
        })),
        Arc::new(feed.clone()),
        ReconcilePolicy::LastWriterWins,
    )
    .await;

    assert!(matches!(orchestrator.request().await, RequestOutcome::Failed(_)));

    feed.publish(USER, record(81.0, 3));
    let view = wait_for_view(&orchestrator, |view| view.result.is_some()).await;
    assert_eq!(view.result, Some(prediction(81.0)));
    assert_eq!(view.error.as_deref(), Some("model busy"));
}

#[tokio::test]
async fn feed_error_leaves_result_and_session_intact() {
    let (feed, events) = manual_feed();
    let orchestrator = started(unused_service(), feed, ReconcilePolicy::LastWriterWins).await;

    events.send(FeedEvent::Snapshot(Some(record(77.0, 1)))).unwrap();
    wait_for_view(&orchestrator, |view| view.result.is_some()).await;

    events.send(FeedEvent::Error("listener reset".into())).unwrap();
    settle().await;
    assert_eq!(orchestrator.snapshot().result, Some(prediction(77.0)));

    events.send(FeedEvent::Snapshot(Some(record(83.0, 2)))).unwrap();
    let view = wait_for_view(&orchestrator, |view| {
        view.result.as_ref().map(|p| p.current_percentage) == Some(83.0)
    })
    .await;
    assert_eq!(view.result, Some(prediction(83.0)));
}

#[tokio::test]
async fn last_writer_wins_accepts_out_of_order_records() {
    let (feed, events) = manual_feed();
    let orchestrator = started(unused_service(), feed, ReconcilePolicy::LastWriterWins).await;

    events.send(FeedEvent::Snapshot(Some(record(88.0, 10)))).unwrap();
    events.send(FeedEvent::Snapshot(Some(record(61.0, 5)))).unwrap();

    let view = wait_for_view(&orchestrator, |view| {
        view.result.as_ref().map(|p| p.current_percentage) == Some(61.0)
    })
    .await;
    assert_eq!(view.result, Some(prediction(61.0)));
}

#[tokio::test]
async fn newest_feed_record_policy_drops_older_records() {
    let (feed, events) = manual_feed();
    let orchestrator = started(unused_service(), feed, ReconcilePolicy::NewestFeedRecord).await;

    events.send(FeedEvent::Snapshot(Some(record(88.0, 10)))).unwrap();
    events.send(FeedEvent::Snapshot(Some(record(61.0, 5)))).unwrap();
    events.send(FeedEvent::Snapshot(Some(record(92.0, 10)))).unwrap();

    let view = wait_for_view(&orchestrator, |view| {
        view.result.as_ref().map(|p| p.current_percentage) == Some(92.0)
    })
    .await;
    assert_eq!(view.result, Some(prediction(92.0)));
}

#[tokio::test]
async fn buffered_events_after_shutdown_do_not_mutate_state() {
    let (feed, events) = manual_feed();
    let orchestrator = started(unused_service(), feed, ReconcilePolicy::LastWriterWins).await;

    events.send(FeedEvent::Snapshot(Some(record(55.0, 1)))).unwrap();
    events.send(FeedEvent::Snapshot(Some(record(56.0, 2)))).unwrap();
    orchestrator.shutdown().await;
    let _ = events.send(FeedEvent::Snapshot(Some(record(57.0, 3))));
    settle().await;

    assert!(orchestrator.is_closed());
    assert_eq!(orchestrator.snapshot().result, None);
    assert!(events.is_closed());
}

#[tokio::test]
async fn shutdown_releases_local_subscription() {
    let feed = LocalResultFeed::new();
    let orchestrator = started(
        unused_service(),
        Arc::new(feed.clone()),
        ReconcilePolicy::LastWriterWins,
    )
    .await;
    assert_eq!(feed.subscriber_count(USER), 1);

    orchestrator.shutdown().await;
    assert_eq!(feed.subscriber_count(USER), 0);

    feed.publish(USER, record(99.0, 1));
    settle().await;
    assert_eq!(orchestrator.snapshot().result, None);
}

#[tokio::test]
async fn dropping_orchestrator_releases_subscription() {
    let feed = LocalResultFeed::new();
    let orchestrator = started(
        unused_service(),
        Arc::new(feed.clone()),
        ReconcilePolicy::LastWriterWins,
    )
    .await;
    assert_eq!(feed.subscriber_count(USER), 1);

    drop(orchestrator);
    settle().await;
    assert_eq!(feed.subscriber_count(USER), 0);
}

#[tokio::test]
async fn subscription_failure_does_not_block_requests() {
    let service = FixedService::new(Ok(PredictionResponse {
        success: true,
        prediction: Some(prediction(74.0)),
        message: None,
    }));
    let orchestrator = started(
        Arc::clone(&service),
        Arc::new(FailingFeed),
        ReconcilePolicy::LastWriterWins,
    )
    .await;

    assert_eq!(orchestrator.request().await, RequestOutcome::Succeeded);
    assert_eq!(orchestrator.snapshot().result, Some(prediction(74.0)));
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_during_subscribe_releases_late_subscription() {
    let local = LocalResultFeed::new();
    let (open_gate, gate) = oneshot::channel();
    let orchestrator = Arc::new(PredictionOrchestrator::new(
        SessionIdentity::new(USER, "token"),
        unused_service(),
        Arc::new(ProcessedDirectory),
        Arc::new(GatedFeed {
            inner: local.clone(),
            gate: Mutex::new(Some(gate)),
        }),
        ReconcilePolicy::LastWriterWins,
    ));

    let starting = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.start().await }
    });
    settle().await;

    orchestrator.shutdown().await;
    open_gate.send(()).unwrap();
    starting.await.unwrap();

    assert!(orchestrator.is_closed());
    assert_eq!(local.subscriber_count(USER), 0);

    local.publish(USER, record(64.0, 1));
    settle().await;
    assert_eq!(orchestrator.snapshot().result, None);
}
