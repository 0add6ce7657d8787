use std::sync::Arc;
use std::time::Duration;

use jb_core::{InboundSource, Message};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::WebhookError;
use crate::service::WebhookService;

/// Snapshot served by the webhook status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookStatus {
    pub running: bool,
    pub healthy: bool,
    pub queue_length: usize,
    pub total_sent: u64,
    pub total_failed: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sent: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    pub last_error: String,
    pub webhook_url: String,
}

struct Forwarder {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pumps the merged inbound stream into the delivery queue.
pub struct WebhookManager {
    service: Arc<WebhookService>,
    source: Arc<dyn InboundSource>,
    forwarder: Mutex<Option<Forwarder>>,
}

impl WebhookManager {
    pub fn new(service: Arc<WebhookService>, source: Arc<dyn InboundSource>) -> Self {
        Self {
            service,
            source,
            forwarder: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Arc<WebhookService> {
        &self.service
    }

    pub fn start(&self, parent: &CancellationToken) -> Result<(), WebhookError> {
        self.service.start()?;
        let Some(stream) = self.source.take_inbound_stream() else {
            self.service.stop();
            return Err(WebhookError::StreamUnavailable);
        };

        let token = parent.child_token();
        let handle = tokio::spawn(forward(
            Arc::clone(&self.service),
            stream,
            token.clone(),
        ));
        *self.forwarder.lock() = Some(Forwarder { token, handle });
        info!(url = %self.service.url(), "Webhook manager started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.token.cancel();
            forwarder.handle.abort();
        }
        self.service.stop();
        info!("Webhook manager stopped");
    }

    /// See [`WebhookService::drain`].
    pub async fn drain(&self, grace: Duration) -> bool {
        self.service.drain(grace).await
    }

    pub fn status(&self) -> WebhookStatus {
        let stats = self.service.stats();
        WebhookStatus {
            running: self.service.is_running(),
            healthy: self.service.is_healthy(),
            queue_length: self.service.queue_length(),
            total_sent: stats.total_sent,
            total_failed: stats.total_failed,
            last_sent: stats.last_sent,
            last_failure: stats.last_failure,
            last_error: stats.last_error,
            webhook_url: self.service.url().to_string(),
        }
    }
}

async fn forward(
    service: Arc<WebhookService>,
    mut stream: mpsc::Receiver<Message>,
    token: CancellationToken,
) {
    info!("Starting XMPP to webhook forwarder");
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = stream.recv() => message,
        };
        let Some(message) = message else {
            info!("XMPP message stream closed");
            break;
        };
        // A full queue is already logged and counted by the service.
        let from = message.from.clone();
        match service.send_message(message) {
            Ok(()) | Err(WebhookError::QueueFull) => {}
            Err(WebhookError::NotRunning) => {
                warn!(from = %from, "Webhook service is not running, dropping message");
            }
            Err(err) => error!(error = %err, from = %from, "Failed to queue message for webhook"),
        }
    }
}
