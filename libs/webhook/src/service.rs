use std::sync::Arc;
use std::time::Duration;

use jb_core::{Message, WEBHOOK_SOURCE, WebhookConfig, WebhookPayload};
use jb_telemetry::{DeliveryOutcome, record_queue_rejection, record_webhook_delivery};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WebhookError;
use crate::stats::{StatsRecorder, WebhookStats};
use crate::testmode::{Routed, TestMode};

pub const HEADER_SOURCE: &str = "X-Webhook-Source";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_TEST_MODE: &str = "Webhook-Test-Mode";
/// Unit of the quadratic retry backoff: attempt `n` waits `n² × base`.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const UNHEALTHY_FAILURES: u64 = 10;

struct Queue {
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
}

/// Bounded in-memory queue drained by a single delivery worker.
pub struct WebhookService {
    config: WebhookConfig,
    client: reqwest::Client,
    test_mode: TestMode,
    backoff_base: Duration,
    stats: Arc<StatsRecorder>,
    queue: Mutex<Option<Queue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookService {
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(WebhookError::Client)?;
        Ok(Self {
            test_mode: TestMode::new(&config.test_mode_suffix),
            config,
            client,
            backoff_base: DEFAULT_BACKOFF_BASE,
            stats: Arc::new(StatsRecorder::default()),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Opens the queue and spawns the delivery worker.
    pub fn start(&self) -> Result<(), WebhookError> {
        let (rx, token) = self.open_queue()?;
        let delivery = Arc::new(Delivery {
            url: self.config.url.clone(),
            retry_attempts: self.config.retry_attempts.max(1),
            client: self.client.clone(),
            test_mode: self.test_mode.clone(),
            backoff_base: self.backoff_base,
            stats: Arc::clone(&self.stats),
        });
        let handle = tokio::spawn(run_worker(delivery, rx, token));
        *self.worker.lock() = Some(handle);

        info!(
            url = %self.config.url,
            timeout = ?self.config.timeout,
            retry_attempts = self.config.retry_attempts,
            "Webhook service started"
        );
        Ok(())
    }

    /// Closes the intake. The worker delivers what is already buffered, then exits.
    pub fn stop(&self) {
        let Some(queue) = self.queue.lock().take() else {
            return;
        };
        queue.token.cancel();
        drop(queue.tx);
        info!("Webhook service stopped");
    }

    /// Waits up to `grace` for a stopped worker to finish draining. True if it finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(error = %err, "Webhook worker failed");
                true
            }
            Err(_) => {
                warn!(grace = ?grace, "Webhook worker still draining, giving up");
                false
            }
        }
    }

    pub fn send_message(&self, message: Message) -> Result<(), WebhookError> {
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Err(WebhookError::NotRunning);
        };
        let (from, to) = (message.from.clone(), message.to.clone());
        match queue.tx.try_send(message) {
            Ok(()) => {
                debug!(from = %from, to = %to, "Message queued for webhook");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    from = %from,
                    queue_length = queue.tx.max_capacity(),
                    "Webhook queue full, dropping message"
                );
                record_queue_rejection();
                Err(WebhookError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(WebhookError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.queue.lock().is_some()
    }

    pub fn stats(&self) -> WebhookStats {
        self.stats.snapshot()
    }

    pub fn queue_length(&self) -> usize {
        self.queue
            .lock()
            .as_ref()
            .map(|queue| queue.tx.max_capacity() - queue.tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_healthy(&self) -> bool {
        if !self.is_running() || self.config.url.is_empty() {
            return false;
        }
        let stats = self.stats();
        !(stats.total_failed > UNHEALTHY_FAILURES && stats.last_outcome_failed())
    }

    /// Installs a fresh queue without spawning a worker.
    fn open_queue(&self) -> Result<(mpsc::Receiver<Message>, CancellationToken), WebhookError> {
        let mut queue = self.queue.lock();
        let draining = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if queue.is_some() || draining {
            return Err(WebhookError::AlreadyRunning);
        }
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let token = CancellationToken::new();
        *queue = Some(Queue {
            tx,
            token: token.clone(),
        });
        Ok((rx, token))
    }
}

struct Delivery {
    url: String,
    retry_attempts: u32,
    client: reqwest::Client,
    test_mode: TestMode,
    backoff_base: Duration,
    stats: Arc<StatsRecorder>,
}

async fn run_worker(
    delivery: Arc<Delivery>,
    mut rx: mpsc::Receiver<Message>,
    token: CancellationToken,
) {
    info!("Starting webhook processor");
    while let Some(message) = rx.recv().await {
        delivery.deliver(message, &token).await;
    }
    info!("Webhook processor stopped");
}

impl Delivery {
    /// Delivers one message with retries. Once `token` is cancelled no further retries are
    /// made, so a draining worker tries each buffered message once.
    async fn deliver(&self, message: Message, token: &CancellationToken) {
        let payload = WebhookPayload::new(message);
        let from = payload.message.from.as_str();
        let to = payload.message.to.as_str();
        let routed = self.test_mode.route(&payload.message.body, &self.url);
        let mut last_error: Option<WebhookError> = None;
        let mut attempts = 0;

        for attempt in 1..=self.retry_attempts {
            attempts = attempt;
            match self.send_attempt(&payload, &routed).await {
                Ok(()) => {
                    self.stats.record_success();
                    record_webhook_delivery(DeliveryOutcome::Success, routed.test_mode);
                    info!(attempt, from, to, url = %routed.url, "Webhook sent successfully");
                    return;
                }
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = self.retry_attempts,
                        error = %err,
                        from,
                        url = %routed.url,
                        "Webhook attempt failed"
                    );
                    last_error = Some(err);
                }
            }

            if attempt < self.retry_attempts {
                let backoff = self.backoff_base * (attempt * attempt);
                let stopping = tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = tokio::time::sleep(backoff) => false,
                };
                if stopping {
                    debug!(attempt, from, "Webhook service stopping, no further retries");
                    break;
                }
            }
        }

        let error = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        self.stats.record_failure(&error);
        record_webhook_delivery(DeliveryOutcome::Failure, routed.test_mode);
        error!(
            attempts,
            error = %error,
            from,
            to,
            url = %routed.url,
            "Webhook failed after all attempts"
        );
    }

    /// One POST. Test mode serializes a copy carrying the stripped body; `payload` stays as queued.
    async fn send_attempt(
        &self,
        payload: &WebhookPayload,
        routed: &Routed,
    ) -> Result<(), WebhookError> {
        if self.url.is_empty() {
            return Err(WebhookError::NoUrlConfigured);
        }

        let body = if routed.test_mode {
            debug!(
                original_url = %self.url,
                test_url = %routed.url,
                "Test mode detected, using modified webhook URL"
            );
            serde_json::to_vec(&WebhookPayload {
                message: payload.message.with_body(routed.body.as_str()),
                timestamp: payload.timestamp.clone(),
                source: payload.source.clone(),
            })
        } else {
            serde_json::to_vec(payload)
        }
        .map_err(WebhookError::Serialize)?;

        let mut request = self
            .client
            .post(&routed.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, jb_core::USER_AGENT)
            .header(HEADER_SOURCE, WEBHOOK_SOURCE)
            .header(HEADER_TIMESTAMP, payload.timestamp.as_str())
            .body(body);
        if routed.test_mode {
            request = request.header(HEADER_TEST_MODE, "true");
        }

        let response = request.send().await.map_err(WebhookError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn config(url: &str, capacity: usize) -> WebhookConfig {
        WebhookConfig {
            url: url.to_string(),
            queue_capacity: capacity,
            ..WebhookConfig::default()
        }
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let service = WebhookService::new(config("http://127.0.0.1:9/webhook", 4)).unwrap();
        assert!(!service.is_running());
        let err = service.send_message(Message::default()).unwrap_err();
        assert!(matches!(err, WebhookError::NotRunning));
        assert_eq!(err.to_string(), "webhook service is not running");
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let service = WebhookService::new(config("http://127.0.0.1:9/webhook", 3)).unwrap();
        let (_rx, _token) = service.open_queue().unwrap();

        for i in 0..3 {
            service
                .send_message(Message::chat("a@x", "b@x", format!("m{i}")))
                .unwrap();
        }
        assert_eq!(service.queue_length(), 3);
        let err = service
            .send_message(Message::chat("a@x", "b@x", "overflow"))
            .unwrap_err();
        assert!(matches!(err, WebhookError::QueueFull));
        assert_eq!(err.to_string(), "webhook queue is full");
        assert_eq!(service.queue_length(), 3);
    }

    #[tokio::test]
    async fn start_twice_is_an_error_and_stop_is_idempotent() {
        let service = WebhookService::new(config("http://127.0.0.1:9/webhook", 4)).unwrap();
        service.stop();
        service.start().unwrap();
        assert!(matches!(service.start(), Err(WebhookError::AlreadyRunning)));
        service.stop();
        service.stop();
        assert!(!service.is_running());
        assert_eq!(service.queue_length(), 0);
        assert!(service.drain(Duration::from_secs(1)).await);
        service.start().unwrap();
        service.stop();
    }

    #[tokio::test]
    async fn health_rules() {
        let service = WebhookService::new(config("http://127.0.0.1:9/webhook", 4)).unwrap();
        assert!(!service.is_healthy());
        let (_rx, _token) = service.open_queue().unwrap();
        assert!(service.is_healthy());

        let base = OffsetDateTime::now_utc();
        for _ in 0..11 {
            service.stats.record_failure_at(base, "webhook returned status 500");
        }
        assert!(!service.is_healthy());

        service
            .stats
            .record_success_at(base + time::Duration::seconds(1));
        assert!(service.is_healthy());

        let no_url = WebhookService::new(config("", 4)).unwrap();
        let (_rx2, _token2) = no_url.open_queue().unwrap();
        assert!(!no_url.is_healthy());
    }

    #[tokio::test]
    async fn ten_failures_do_not_make_unhealthy() {
        let service = WebhookService::new(config("http://127.0.0.1:9/webhook", 4)).unwrap();
        let (_rx, _token) = service.open_queue().unwrap();
        for _ in 0..10 {
            service.stats.record_failure("boom");
        }
        assert!(service.is_healthy());
    }
}
