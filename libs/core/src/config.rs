//! Bot configuration loaded from YAML with `JABBER_BOT_*` environment overrides.
//!
//! Loading order: file, then environment, then defaults for every zero or empty value,
//! then validation. A missing or empty file yields the defaults.

use serde::{Deserialize, Deserializer};
use std::{fmt, fs, path::Path, time::Duration};
use thiserror::Error;

pub const ENV_PREFIX: &str = "JABBER_BOT_";

pub const DEFAULT_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_TEST_MODE_SUFFIX: &str = "-test";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_OUTPUT: &str = "stdout";
pub const DEFAULT_LOG_FORMAT: &str = "json";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    pub jid: String,
    pub password: String,
    pub server: String,
    pub resource: String,
}

impl fmt::Debug for XmppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmppConfig")
            .field("jid", &self.jid)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("resource", &self.resource)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
}

impl ApiConfig {
    /// Authentication is on whenever a key is configured.
    pub fn auth_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_API_HOST.into(),
            port: DEFAULT_API_PORT,
            api_key: String::new(),
        }
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth_enabled", &self.auth_enabled())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub test_mode_suffix: String,
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            test_mode_suffix: DEFAULT_TEST_MODE_SUFFIX.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
    pub file_path: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.into(),
            output: DEFAULT_LOG_OUTPUT.into(),
            file_path: String::new(),
            format: DEFAULT_LOG_FORMAT.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(deserialize_with = "de_duration")]
    pub backoff: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub check_interval: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_RECONNECT_BACKOFF,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub xmpp: XmppConfig,
    pub api: ApiConfig,
    pub webhook: WebhookConfig,
    pub logging: LoggingConfig,
    pub reconnection: ReconnectionConfig,
}

impl BotConfig {
    /// Loads `path` and applies overrides from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, std::env::vars())
    }

    /// Loads `path` and applies overrides from `vars` instead of the process environment.
    pub fn load_with_env<I>(path: impl AsRef<Path>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env(vars)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn from_yaml(raw: &str) -> Result<Self, serde_yaml_bw::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_bw::from_str(raw)
    }

    /// Applies every `JABBER_BOT_<SECTION>_<FIELD>` variable; unknown keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "XMPP_JID" => self.xmpp.jid = value,
                "XMPP_PASSWORD" => self.xmpp.password = value,
                "XMPP_SERVER" => self.xmpp.server = value,
                "XMPP_RESOURCE" => self.xmpp.resource = value,
                "API_HOST" => self.api.host = value,
                "API_PORT" => self.api.port = parse_env(&key, &value)?,
                "API_API_KEY" => self.api.api_key = value,
                "WEBHOOK_URL" => self.webhook.url = value,
                "WEBHOOK_TIMEOUT" => self.webhook.timeout = env_duration(&key, &value)?,
                "WEBHOOK_RETRY_ATTEMPTS" => {
                    self.webhook.retry_attempts = parse_env(&key, &value)?
                }
                "WEBHOOK_TEST_MODE_SUFFIX" => self.webhook.test_mode_suffix = value,
                "WEBHOOK_QUEUE_CAPACITY" => {
                    self.webhook.queue_capacity = parse_env(&key, &value)?
                }
                "LOGGING_LEVEL" => self.logging.level = value,
                "LOGGING_OUTPUT" => self.logging.output = value,
                "LOGGING_FILE_PATH" => self.logging.file_path = value,
                "LOGGING_FORMAT" => self.logging.format = value,
                "RECONNECTION_ENABLED" => self.reconnection.enabled = parse_bool(&key, &value)?,
                "RECONNECTION_MAX_ATTEMPTS" => {
                    self.reconnection.max_attempts = parse_env(&key, &value)?
                }
                "RECONNECTION_BACKOFF" => {
                    self.reconnection.backoff = env_duration(&key, &value)?
                }
                "RECONNECTION_CHECK_INTERVAL" => {
                    self.reconnection.check_interval = env_duration(&key, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replaces zero or empty values with the defaults.
    pub fn apply_defaults(&mut self) {
        fn or_default(value: &mut String, default: &str) {
            if value.trim().is_empty() {
                *value = default.to_string();
            }
        }

        or_default(&mut self.api.host, DEFAULT_API_HOST);
        if self.api.port == 0 {
            self.api.port = DEFAULT_API_PORT;
        }
        if self.webhook.timeout.is_zero() {
            self.webhook.timeout = DEFAULT_WEBHOOK_TIMEOUT;
        }
        if self.webhook.retry_attempts == 0 {
            self.webhook.retry_attempts = DEFAULT_RETRY_ATTEMPTS;
        }
        or_default(&mut self.webhook.test_mode_suffix, DEFAULT_TEST_MODE_SUFFIX);
        if self.webhook.queue_capacity == 0 {
            self.webhook.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        or_default(&mut self.logging.level, DEFAULT_LOG_LEVEL);
        or_default(&mut self.logging.output, DEFAULT_LOG_OUTPUT);
        or_default(&mut self.logging.format, DEFAULT_LOG_FORMAT);
        if self.reconnection.max_attempts == 0 {
            self.reconnection.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        if self.reconnection.backoff.is_zero() {
            self.reconnection.backoff = DEFAULT_RECONNECT_BACKOFF;
        }
        if self.reconnection.check_interval.is_zero() {
            self.reconnection.check_interval = DEFAULT_CHECK_INTERVAL;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.xmpp.jid.is_empty() && !self.xmpp.jid.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "xmpp.jid {:?} must contain '@'",
                self.xmpp.jid
            )));
        }
        if self.webhook.retry_attempts < 1 {
            return Err(ConfigError::Invalid(
                "webhook.retry_attempts must be at least 1".into(),
            ));
        }
        if self.webhook.queue_capacity < 1 {
            return Err(ConfigError::Invalid(
                "webhook.queue_capacity must be at least 1".into(),
            ));
        }
        match self.logging.output.as_str() {
            "stdout" | "stderr" => {}
            "file" if self.logging.file_path.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "logging.file_path is required when logging.output is file".into(),
                ));
            }
            "file" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "logging.output {other:?} must be one of stdout, stderr, file"
                )));
            }
        }
        Ok(())
    }
}

/// Parses `"500ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
///
/// ```
/// use std::time::Duration;
///
/// assert_eq!(jb_core::parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(jb_core::parse_duration("2m").unwrap(), Duration::from_secs(120));
/// assert_eq!(jb_core::parse_duration("7").unwrap(), Duration::from_secs(7));
/// assert!(jb_core::parse_duration("soon").is_err());
/// ```
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn env_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn full_file_is_parsed() {
        let (_dir, path) = write_config(
            r#"
xmpp:
  jid: "bot@localhost"
  password: "secret"
  server: "localhost:5222"
  resource: "bot"
api:
  port: 9090
  host: "127.0.0.1"
  api_key: "k1"
webhook:
  url: "https://hooks.example.com/webhook/abc"
  timeout: 45s
  retry_attempts: 4
logging:
  level: "warn"
  output: "stdout"
reconnection:
  enabled: true
  max_attempts: 8
  backoff: "15s"
"#,
        );
        let cfg = BotConfig::load_with_env(&path, no_env()).expect("load config");
        assert_eq!(cfg.xmpp.jid, "bot@localhost");
        assert_eq!(cfg.xmpp.resource, "bot");
        assert_eq!(cfg.api.port, 9090);
        assert_eq!(cfg.api.host, "127.0.0.1");
        assert!(cfg.api.auth_enabled());
        assert_eq!(cfg.webhook.timeout, Duration::from_secs(45));
        assert_eq!(cfg.webhook.retry_attempts, 4);
        assert_eq!(cfg.logging.level, "warn");
        assert!(cfg.reconnection.enabled);
        assert_eq!(cfg.reconnection.max_attempts, 8);
        assert_eq!(cfg.reconnection.backoff, Duration::from_secs(15));
        assert_eq!(cfg.reconnection.check_interval, DEFAULT_CHECK_INTERVAL);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let (_dir, path) = write_config("   \n");
        let cfg = BotConfig::load_with_env(&path, no_env()).expect("load config");
        assert_eq!(cfg.api.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.webhook.timeout, DEFAULT_WEBHOOK_TIMEOUT);
        assert_eq!(cfg.webhook.retry_attempts, 3);
        assert_eq!(cfg.webhook.test_mode_suffix, "-test");
        assert_eq!(cfg.webhook.queue_capacity, 1000);
        assert_eq!(cfg.logging.output, "stdout");
        assert!(!cfg.reconnection.enabled);
        assert_eq!(cfg.reconnection.max_attempts, 5);
        assert!(!cfg.api.auth_enabled());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BotConfig::load_with_env(dir.path().join("absent.yaml"), no_env())
            .expect("load config");
        assert_eq!(cfg.api.port, DEFAULT_API_PORT);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let (_dir, path) = write_config(
            r#"
api:
  port: 0
webhook:
  retry_attempts: 0
  timeout: 0
reconnection:
  backoff: 0
"#,
        );
        let cfg = BotConfig::load_with_env(&path, no_env()).expect("load config");
        assert_eq!(cfg.api.port, DEFAULT_API_PORT);
        assert_eq!(cfg.webhook.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(cfg.webhook.timeout, DEFAULT_WEBHOOK_TIMEOUT);
        assert_eq!(cfg.reconnection.backoff, DEFAULT_RECONNECT_BACKOFF);
    }

    #[test]
    fn env_overrides_file_values() {
        let (_dir, path) = write_config(
            r#"
xmpp:
  jid: "file-bot@localhost"
  password: "password123"
  server: "localhost:5222"
api:
  port: 8080
reconnection:
  enabled: true
"#,
        );
        let env = vec![
            ("JABBER_BOT_XMPP_JID".to_string(), "env-bot@localhost".to_string()),
            ("JABBER_BOT_API_PORT".to_string(), "9999".to_string()),
            ("JABBER_BOT_WEBHOOK_RETRY_ATTEMPTS".to_string(), "10".to_string()),
            ("JABBER_BOT_LOGGING_LEVEL".to_string(), "error".to_string()),
            ("JABBER_BOT_RECONNECTION_ENABLED".to_string(), "false".to_string()),
            ("JABBER_BOT_WEBHOOK_TIMEOUT".to_string(), "2m".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let cfg = BotConfig::load_with_env(&path, env).expect("load config");
        assert_eq!(cfg.xmpp.jid, "env-bot@localhost");
        assert_eq!(cfg.api.port, 9999);
        assert_eq!(cfg.webhook.retry_attempts, 10);
        assert_eq!(cfg.webhook.timeout, Duration::from_secs(120));
        assert_eq!(cfg.logging.level, "error");
        assert!(!cfg.reconnection.enabled);
        assert_eq!(cfg.xmpp.password, "password123");
        assert_eq!(cfg.api.host, "0.0.0.0");
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let (_dir, path) = write_config("");
        let env = vec![("JABBER_BOT_API_PORT".to_string(), "eighty".to_string())];
        let err = BotConfig::load_with_env(&path, env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "JABBER_BOT_API_PORT"));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let (_dir, path) = write_config("xmpp:\n  jid: \"a@b\"\n  invalid: [unclosed\n");
        let err = BotConfig::load_with_env(&path, no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn validation_rejects_bad_jid_and_output() {
        let (_dir, path) = write_config("xmpp:\n  jid: \"no-at-sign\"\n");
        assert!(matches!(
            BotConfig::load_with_env(&path, no_env()),
            Err(ConfigError::Invalid(_))
        ));

        let (_dir, path) = write_config("logging:\n  output: \"syslog\"\n");
        assert!(matches!(
            BotConfig::load_with_env(&path, no_env()),
            Err(ConfigError::Invalid(_))
        ));

        let (_dir, path) = write_config("logging:\n  output: \"file\"\n");
        assert!(matches!(
            BotConfig::load_with_env(&path, no_env()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let cfg = BotConfig {
            xmpp: XmppConfig {
                password: "hunter2".into(),
                ..Default::default()
            },
            api: ApiConfig {
                api_key: "topsecret".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("topsecret"));
    }

    #[test]
    fn duration_parsing_handles_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 250ms ").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn shipped_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/config.yaml");
        let cfg = BotConfig::load_with_env(&path, no_env()).expect("sample config");
        assert_eq!(cfg.xmpp.jid, "bot@example.com");
        assert_eq!(cfg.webhook.timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconnection.check_interval, Duration::from_secs(10));
        assert!(!cfg.api.auth_enabled());
    }
}
