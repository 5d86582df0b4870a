use std::str::FromStr;
use std::time::Duration as StdDuration;

use serde::Serialize;
use tracing::warn;

const ENV_API_BASE_URL: &str = "GRADEWISE_API_BASE_URL";
const ENV_HTTP_TIMEOUT_SECS: &str = "GRADEWISE_HTTP_TIMEOUT_SECS";
const ENV_FEED_POLL_SECS: &str = "GRADEWISE_FEED_POLL_SECS";
const ENV_RECONCILE_POLICY: &str = "GRADEWISE_RECONCILE_POLICY";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5001";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_FEED_POLL_SECS: u64 = 5;

/// How feed records interact with the current result.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// Every non-empty feed record and every direct response overwrites.
    #[default]
    LastWriterWins,
    /// Feed records older than the newest applied feed record are dropped.
    NewestFeedRecord,
}

impl ReconcilePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilePolicy::LastWriterWins => "last-writer-wins",
            ReconcilePolicy::NewestFeedRecord => "newest-feed-record",
        }
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "last-writer-wins" | "lww" => Ok(ReconcilePolicy::LastWriterWins),
            "newest-feed-record" | "newest" => Ok(ReconcilePolicy::NewestFeedRecord),
            other => Err(format!("unknown reconcile policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub api_base_url: String,
    pub http_timeout: StdDuration,
    pub feed_poll_interval: StdDuration,
    pub reconcile_policy: ReconcilePolicy,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            http_timeout: StdDuration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            feed_poll_interval: StdDuration::from_secs(DEFAULT_FEED_POLL_SECS),
            reconcile_policy: ReconcilePolicy::default(),
        }
    }
}

impl AppSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; bad values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_base_url = lookup(ENV_API_BASE_URL)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.api_base_url);

        let http_timeout = read_secs(&lookup, ENV_HTTP_TIMEOUT_SECS).unwrap_or(defaults.http_timeout);
        let feed_poll_interval =
            read_secs(&lookup, ENV_FEED_POLL_SECS).unwrap_or(defaults.feed_poll_interval);

        let reconcile_policy = match lookup(ENV_RECONCILE_POLICY) {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(target: "app::config", key = ENV_RECONCILE_POLICY, error = %err, "falling back to default");
                defaults.reconcile_policy
            }),
            None => defaults.reconcile_policy,
        };

        Self {
            api_base_url,
            http_timeout,
            feed_poll_interval,
            reconcile_policy,
        }
    }
}

fn read_secs<F>(lookup: &F, key: &str) -> Option<StdDuration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(StdDuration::from_secs(secs)),
        Ok(_) => {
            warn!(target: "app::config", key, "zero duration ignored");
            None
        }
        Err(err) => {
            warn!(target: "app::config", key, error = %err, "invalid duration ignored");
            None
        }
    }
}
