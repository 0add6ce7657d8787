use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use jb_core::{BOT_VERSION, BotConfig};
use jb_telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "jabber-bot", version, about = "XMPP to HTTP bridge")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "configs/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BotConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let telemetry = init_telemetry(TelemetryConfig::from_env(
        &config.logging,
        "jabber-bot",
        BOT_VERSION,
    ))?;
    info!(
        xmpp_jid = %config.xmpp.jid,
        api_port = config.api.port,
        webhook_url = %config.webhook.url,
        "Configuration loaded"
    );

    let result = jabber_bot::run(config).await;
    telemetry.shutdown();
    result
}
