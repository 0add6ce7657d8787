use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::serve;
use jb_core::{BotConfig, InboundSource};
use jb_webhook::{WebhookManager, WebhookService};
use jb_xmpp::{ConnectionManager, XmppConnector};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http::{AppState, build_router};

/// How long queued webhook deliveries may keep running after the API stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Starts the XMPP registry, the webhook forwarder and the REST API, then blocks until
/// Ctrl-C or SIGTERM and shuts the three down in reverse order.
pub async fn run(config: BotConfig) -> Result<()> {
    let config = Arc::new(config);
    let root = CancellationToken::new();

    let registry = Arc::new(ConnectionManager::new(
        Arc::clone(&config),
        build_connector(&config),
    ));
    registry
        .start(&root)
        .await
        .context("failed to start XMPP manager")?;

    let service = Arc::new(
        WebhookService::new(config.webhook.clone()).context("failed to build webhook client")?,
    );
    let source: Arc<dyn InboundSource> = registry.clone();
    let webhook = Arc::new(WebhookManager::new(service, source));
    webhook
        .start(&root)
        .context("failed to start webhook manager")?;

    let state = AppState::new(Arc::clone(&config), registry.clone(), Arc::clone(&webhook));
    let router = build_router(state);
    let listener = TcpListener::bind(config.api.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind_addr()))?;
    info!(
        addr = %listener.local_addr()?,
        auth_enabled = config.api.auth_enabled(),
        "Jabber bot started"
    );

    let served = serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(root.clone()))
        .await;
    info!("Shutting down");

    webhook.stop();
    if !webhook.drain(SHUTDOWN_GRACE).await {
        warn!("Pending webhook deliveries abandoned");
    }
    registry.stop().await;
    root.cancel();
    info!("Application stopped");

    served.context("API server failed")
}

#[cfg(feature = "xmpp-wire")]
fn build_connector(_config: &BotConfig) -> Arc<dyn XmppConnector> {
    Arc::new(jb_xmpp::TokioXmppConnector::new(Duration::from_secs(30)))
}

#[cfg(not(feature = "xmpp-wire"))]
fn build_connector(config: &BotConfig) -> Arc<dyn XmppConnector> {
    warn!(
        jid = %config.xmpp.jid,
        "Built without the xmpp-wire feature; using the in-memory loopback connector"
    );
    Arc::new(jb_xmpp::InMemoryConnector::new())
}

async fn shutdown_signal(root: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = root.cancelled() => {}
    }
}
