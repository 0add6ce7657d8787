use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook service is already running")]
    AlreadyRunning,
    #[error("webhook service is not running")]
    NotRunning,
    #[error("webhook queue is full")]
    QueueFull,
    #[error("webhook URL is not configured")]
    NoUrlConfigured,
    #[error("failed to send HTTP request: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(u16),
    #[error("failed to marshal webhook payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("inbound message stream is unavailable")]
    StreamUnavailable,
}
