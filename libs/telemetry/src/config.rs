use std::env;
use std::path::PathBuf;

use jb_core::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryProtocol {
    Grpc,
    HttpProtobuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub protocol: TelemetryProtocol,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
    pub enabled: bool,
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub output: LogOutput,
}

impl TelemetryConfig {
    pub fn from_env(
        logging: &LoggingConfig,
        default_service_name: &str,
        default_service_version: &str,
    ) -> Self {
        Self::from_vars(
            logging,
            default_service_name,
            default_service_version,
            env::vars(),
        )
    }

    /// Same as [`TelemetryConfig::from_env`] but reading the given variables.
    pub fn from_vars<I>(
        logging: &LoggingConfig,
        default_service_name: &str,
        default_service_version: &str,
        vars: I,
    ) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let get = |key: &str| {
            vars.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        let endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_default();
        let protocol = get("OTEL_EXPORTER_OTLP_PROTOCOL")
            .map(|v| match v.to_lowercase().as_str() {
                "http" | "http/protobuf" => TelemetryProtocol::HttpProtobuf,
                _ => TelemetryProtocol::Grpc,
            })
            .unwrap_or(TelemetryProtocol::Grpc);
        let service_name =
            get("OTEL_SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_version =
            get("OTEL_SERVICE_VERSION").unwrap_or_else(|| default_service_version.to_string());
        let environment = get("OTEL_RESOURCE_ATTRIBUTES")
            .and_then(parse_environment_from_resource)
            .or_else(|| get("DEPLOYMENT_ENV"))
            .unwrap_or_else(|| "dev".into());
        let format = get("LOG_FORMAT").unwrap_or_else(|| logging.format.clone());
        let json_logs = !matches!(format.to_lowercase().as_str(), "text" | "pretty" | "plain");
        let enabled_flag = get("ENABLE_OTEL")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let enabled = enabled_flag && !endpoint.trim().is_empty();

        let output = match logging.output.as_str() {
            "stderr" => LogOutput::Stderr,
            "file" => LogOutput::File(PathBuf::from(&logging.file_path)),
            _ => LogOutput::Stdout,
        };

        Self {
            endpoint,
            protocol,
            service_name,
            service_version,
            environment,
            json_logs,
            enabled,
            level: logging.level.clone(),
            output,
        }
    }

    pub fn exporter_enabled(&self) -> bool {
        self.enabled && !self.endpoint.trim().is_empty()
    }
}

fn parse_environment_from_resource(value: String) -> Option<String> {
    value.split(',').find_map(|kv| {
        let (key, val) = kv.split_once('=')?;
        (key.trim() == "deployment.environment").then(|| val.trim().to_string())
    })
}
