use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Value of the `source` field and the `X-Webhook-Source` header.
pub const WEBHOOK_SOURCE: &str = "jabber-bot";
/// Version reported by the API and the webhook user agent.
pub const BOT_VERSION: &str = env!("CARGO_PKG_VERSION");
/// User agent sent with every webhook delivery.
pub const USER_AGENT: &str = concat!("Jabber-Bot/", env!("CARGO_PKG_VERSION"));
/// Stanza type used when the caller does not pick one.
pub const DEFAULT_MESSAGE_TYPE: &str = "chat";
/// Stanza type for multi-user chat rooms.
pub const GROUPCHAT_MESSAGE_TYPE: &str = "groupchat";

/// One chat stanza, inbound or outbound.
///
/// ```
/// use jb_core::Message;
///
/// let msg = Message::chat("alice@example.com", "bot@example.com", "hello");
/// assert_eq!(msg.r#type, "chat");
/// let json = serde_json::to_value(&msg).unwrap();
/// assert_eq!(json["type"], "chat");
/// assert_eq!(json["from"], "alice@example.com");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub thread: String,
    #[serde(default)]
    pub stamp: String,
}

impl Message {
    /// Builds a one-to-one chat message.
    pub fn chat(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            r#type: DEFAULT_MESSAGE_TYPE.to_string(),
            ..Default::default()
        }
    }

    /// Returns a copy of the message carrying a different body.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }
}

/// Body POSTed to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookPayload {
    pub message: Message,
    pub timestamp: String,
    pub source: String,
}

impl WebhookPayload {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: rfc3339_now(),
            source: WEBHOOK_SOURCE.to_string(),
        }
    }
}

/// Request body of `POST /api/v1/send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub r#type: String,
}

/// Request body of `POST /api/v1/send-muc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMucMessageRequest {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub xmpp_connected: bool,
    pub api_running: bool,
    #[serde(rename = "webhook_url")]
    pub webhook_config: String,
    pub version: String,
}

/// Standard success envelope of the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(code: u16, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code,
        }
    }
}

/// Current UTC time as RFC 3339 with whole-second precision.
pub fn rfc3339_now() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

/// Formats a timestamp as RFC 3339 in UTC, dropping sub-second precision.
///
/// ```
/// use time::macros::datetime;
///
/// let ts = datetime!(2024-01-01 12:30:45.123 UTC);
/// assert_eq!(jb_core::format_rfc3339(ts), "2024-01-01T12:30:45Z");
/// ```
pub fn format_rfc3339(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(time::UtcOffset::UTC);
    let ts = ts.replace_nanosecond(0).unwrap_or(ts);
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serializes_every_field_as_string() {
        let msg = Message {
            id: "m1".into(),
            from: "alice@example.com/phone".into(),
            to: "bot@example.com".into(),
            body: "ping".into(),
            r#type: "chat".into(),
            subject: String::new(),
            thread: "t-1".into(),
            stamp: String::new(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        for key in [
            "id", "from", "to", "body", "type", "subject", "thread", "stamp",
        ] {
            assert!(json[key].is_string(), "{key} should be a string");
        }
        assert_eq!(json["thread"], "t-1");
    }

    #[test]
    fn with_body_leaves_original_untouched() {
        let original = Message::chat("a@x", "b@x", "[test] hi");
        let copy = original.with_body("hi");
        assert_eq!(original.body, "[test] hi");
        assert_eq!(copy.body, "hi");
        assert_eq!(copy.from, "a@x");
    }

    #[test]
    fn payload_carries_source_and_timestamp() {
        let payload = WebhookPayload::new(Message::chat("a@x", "b@x", "hi"));
        assert_eq!(payload.source, WEBHOOK_SOURCE);
        assert!(payload.timestamp.ends_with('Z'));
        assert!(OffsetDateTime::parse(&payload.timestamp, &Rfc3339).is_ok());
    }

    #[test]
    fn api_response_skips_empty_fields() {
        let resp = ApiResponse {
            success: true,
            message: "ok".into(),
            data: None,
            error: String::new(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "message": "ok"}));
    }

    #[test]
    fn user_agent_matches_version() {
        assert_eq!(USER_AGENT, format!("Jabber-Bot/{BOT_VERSION}"));
    }
}
