//! Push-style delivery of the most recently persisted prediction.
//!
//! A [`FeedSubscription`] owns its underlying stream; dropping it releases the
//! subscription. Two adapters ship with the crate: [`LocalResultFeed`] for
//! hosts that receive records from their own listener, and
//! [`PollingResultFeed`] which turns the latest-prediction pull into a feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::models::prediction::FeedRecord;
use crate::models::session::SessionIdentity;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Top record of the feed; `None` when the user has no prediction yet.
    Snapshot(Option<FeedRecord>),
    Error(String),
}

#[async_trait::async_trait]
pub trait FeedStream: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next(&mut self) -> Option<FeedEvent>;
}

pub struct FeedSubscription {
    user_id: String,
    stream: Box<dyn FeedStream>,
}

impl FeedSubscription {
    pub fn new(user_id: impl Into<String>, stream: Box<dyn FeedStream>) -> Self {
        let user_id = user_id.into();
        debug!(target: "app::feed", user_id = %user_id, "feed subscription opened");
        Self { user_id, stream }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.stream.next().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        debug!(target: "app::feed", user_id = %self.user_id, "feed subscription released");
    }
}

#[async_trait::async_trait]
pub trait ResultFeed: Send + Sync {
    async fn subscribe(&self, session: &SessionIdentity) -> AppResult<FeedSubscription>;
}

struct ChannelStream {
    receiver: mpsc::UnboundedReceiver<FeedEvent>,
}

#[async_trait::async_trait]
impl FeedStream for ChannelStream {
    async fn next(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }
}

#[derive(Default)]
struct UserChannel {
    latest: Option<FeedRecord>,
    subscribers: Vec<mpsc::UnboundedSender<FeedEvent>>,
}

impl UserChannel {
    fn broadcast(&mut self, event: FeedEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-process feed keyed by user id.
///
/// Mirrors a "most recent first, limit 1" query: a published record only
/// reaches subscribers when it becomes the newest record for that user.
#[derive(Clone, Default)]
pub struct LocalResultFeed {
    channels: Arc<Mutex<HashMap<String, UserChannel>>>,
}

impl LocalResultFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the record became the user's latest.
    pub fn publish(&self, user_id: &str, record: FeedRecord) -> bool {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channels.entry(user_id.to_string()).or_default();

        let is_newest = channel
            .latest
            .as_ref()
            .map_or(true, |current| record.created_at >= current.created_at);
        if !is_newest {
            debug!(target: "app::feed", user_id, created_at = %record.created_at, "older record does not change the feed top");
            return false;
        }

        channel.latest = Some(record.clone());
        channel.broadcast(FeedEvent::Snapshot(Some(record)));
        true
    }

    /// Removes the stored record; subscribers see an empty snapshot.
    pub fn clear(&self, user_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get_mut(user_id) {
            channel.latest = None;
            channel.broadcast(FeedEvent::Snapshot(None));
        }
    }

    pub fn fail(&self, user_id: &str, message: impl Into<String>) {
        let message = message.into();
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get_mut(user_id) {
            channel.broadcast(FeedEvent::Error(message));
        }
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get_mut(user_id).map_or(0, |channel| {
            channel.subscribers.retain(|tx| !tx.is_closed());
            channel.subscribers.len()
        })
    }
}

#[async_trait::async_trait]
impl ResultFeed for LocalResultFeed {
    async fn subscribe(&self, session: &SessionIdentity) -> AppResult<FeedSubscription> {
        let (tx, receiver) = mpsc::unbounded_channel();
        {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            let channel = channels.entry(session.user_id.clone()).or_default();
            // A closed receiver is impossible here; the subscription owns it.
            let _ = tx.send(FeedEvent::Snapshot(channel.latest.clone()));
            channel.subscribers.push(tx);
        }

        Ok(FeedSubscription::new(
            session.user_id.clone(),
            Box::new(ChannelStream { receiver }),
        ))
    }
}

/// Pull access to the newest persisted prediction.
#[async_trait::async_trait]
pub trait LatestPredictionSource: Send + Sync {
    async fn latest_prediction(&self) -> AppResult<Option<FeedRecord>>;
}

/// Feed built by polling a [`LatestPredictionSource`].
pub struct PollingResultFeed<S> {
    source: Arc<S>,
    interval: StdDuration,
}

impl<S> PollingResultFeed<S>
where
    S: LatestPredictionSource + 'static,
{
    pub fn new(source: Arc<S>, interval: StdDuration) -> Self {
        Self { source, interval }
    }
}

#[async_trait::async_trait]
impl<S> ResultFeed for PollingResultFeed<S>
where
    S: LatestPredictionSource + 'static,
{
    async fn subscribe(&self, session: &SessionIdentity) -> AppResult<FeedSubscription> {
        let stream = PollingStream {
            source: Arc::clone(&self.source),
            interval: self.interval,
            delivered_initial: false,
            last_created_at: None,
        };
        Ok(FeedSubscription::new(session.user_id.clone(), Box::new(stream)))
    }
}

struct PollingStream<S> {
    source: Arc<S>,
    interval: StdDuration,
    delivered_initial: bool,
    last_created_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
impl<S> FeedStream for PollingStream<S>
where
    S: LatestPredictionSource + 'static,
{
    async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            if self.delivered_initial {
                tokio::time::sleep(self.interval).await;
            }

            match self.source.latest_prediction().await {
                Ok(record) => {
                    let created_at = record.as_ref().map(|r| r.created_at);
                    if !self.delivered_initial || created_at != self.last_created_at {
                        self.delivered_initial = true;
                        self.last_created_at = created_at;
                        return Some(FeedEvent::Snapshot(record));
                    }
                }
                Err(error) => {
                    warn!(target: "app::feed", error = %error, "latest prediction poll failed");
                    self.delivered_initial = true;
                    return Some(FeedEvent::Error(error.to_string()));
                }
            }
        }
    }
}
