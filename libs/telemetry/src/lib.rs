//! Logging and telemetry bootstrap for the jabber bot.
//! Installs the `tracing` subscriber (stdout, stderr or file, JSON or text), optionally
//! wires an OTLP exporter, and names the counters recorded through the `metrics` facade.

pub mod config;
pub mod metrics;
mod tracing_init;

pub use config::{LogOutput, TelemetryConfig, TelemetryProtocol};
pub use metrics::{
    DeliveryOutcome, record_inbound_dropped, record_queue_rejection, record_reconnect_attempt,
    record_webhook_delivery,
};
pub use tracing_init::{
    TelemetryGuard, build_filter, build_writer, init_telemetry, telemetry_enabled,
};
