use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Delivery counters. Copies are handed out; the live value sits in [`StatsRecorder`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub total_sent: u64,
    pub total_failed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sent: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    pub last_error: String,
}

impl WebhookStats {
    /// True when the most recent outcome was a failure. A missing `last_sent` is the earliest.
    pub fn last_outcome_failed(&self) -> bool {
        match (self.last_sent, self.last_failure) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(sent), Some(failed)) => sent < failed,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<WebhookStats>,
}

impl StatsRecorder {
    pub fn record_success(&self) {
        self.record_success_at(OffsetDateTime::now_utc());
    }

    pub fn record_failure(&self, error: &str) {
        self.record_failure_at(OffsetDateTime::now_utc(), error);
    }

    pub fn record_success_at(&self, at: OffsetDateTime) {
        let mut stats = self.inner.lock();
        stats.total_sent = stats.total_sent.saturating_add(1);
        stats.last_sent = Some(at);
    }

    pub fn record_failure_at(&self, at: OffsetDateTime, error: &str) {
        let mut stats = self.inner.lock();
        stats.total_failed = stats.total_failed.saturating_add(1);
        stats.last_failure = Some(at);
        stats.last_error = error.to_string();
    }

    pub fn snapshot(&self) -> WebhookStats {
        self.inner.lock().clone()
    }
}
