//! Outbound half of the bridge: inbound chat messages are queued and POSTed to a webhook.

pub mod error;
pub mod manager;
pub mod service;
pub mod stats;
pub mod testmode;

pub use error::WebhookError;
pub use manager::{WebhookManager, WebhookStatus};
pub use service::{
    DEFAULT_BACKOFF_BASE, HEADER_SOURCE, HEADER_TEST_MODE, HEADER_TIMESTAMP, WebhookService,
};
pub use stats::{StatsRecorder, WebhookStats};
pub use testmode::{DEFAULT_SUFFIX, Routed, TEST_PREFIX, TestMode};
