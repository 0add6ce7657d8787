use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use jb_core::{
    ApiResponse, BOT_VERSION, BotConfig, DEFAULT_MESSAGE_TYPE, ErrorResponse,
    SendMessageRequest, SendMucMessageRequest, StatusResponse, rfc3339_now,
};
use jb_webhook::{WebhookManager, WebhookStatus};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::require_api_key;
use crate::gateway::ChatGateway;

pub const MAX_BODY_CHARS: usize = 10_000;
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BotConfig>,
    pub gateway: Arc<dyn ChatGateway>,
    pub webhook: Arc<WebhookManager>,
}

impl AppState {
    pub fn new(
        config: Arc<BotConfig>,
        gateway: Arc<dyn ChatGateway>,
        webhook: Arc<WebhookManager>,
    ) -> Self {
        Self {
            config,
            gateway,
            webhook,
        }
    }
}

/// Error body shared by every failing route: `{success:false, error, code}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::new(self.status.as_u16(), self.message);
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/send", post(send_message))
        .route("/send-muc", post(send_muc_message))
        .route("/status", get(status))
        .route("/webhook/status", get(webhook_status));
    let protected = if state.config.api.auth_enabled() {
        protected.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
    } else {
        protected
    };

    let api = Router::new().route("/health", get(health)).merge(protected);

    Router::new()
        .route("/", get(root))
        .route("/docs", get(docs))
        .nest("/api/v1", api)
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn validate_send(req: &SendMessageRequest) -> Result<(), &'static str> {
    if req.to.trim().is_empty() {
        return Err("to field is required");
    }
    validate_body(&req.body)?;
    if !req.to.contains('@') {
        return Err("invalid JID format");
    }
    Ok(())
}

pub fn validate_send_muc(req: &SendMucMessageRequest) -> Result<(), &'static str> {
    if req.room.trim().is_empty() {
        return Err("room field is required");
    }
    validate_body(&req.body)?;
    if !req.room.contains('@') {
        return Err("invalid room JID format");
    }
    Ok(())
}

fn validate_body(body: &str) -> Result<(), &'static str> {
    if body.trim().is_empty() {
        return Err("body field is required");
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err("body field too long (max 10000 characters)");
    }
    Ok(())
}

#[debug_handler]
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let request_id = request_id(&headers);
    let Json(req) = payload.map_err(|err| {
        warn!(error = %err, request_id = %request_id, "Invalid request body");
        ApiError::bad_request("Invalid request body")
    })?;
    validate_send(&req).map_err(|reason| {
        warn!(error = reason, request_id = %request_id, "Request validation failed");
        ApiError::bad_request(reason)
    })?;

    let kind = if req.r#type.is_empty() {
        DEFAULT_MESSAGE_TYPE
    } else {
        req.r#type.as_str()
    };
    let body_length = req.body.chars().count();
    info!(to = %req.to, message_type = kind, body_length, request_id = %request_id, "Sending message");

    if let Err(err) = state.gateway.send_message(&req.to, &req.body, kind).await {
        error!(error = %err, to = %req.to, request_id = %request_id, "Failed to send XMPP message");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to send message: {err}"),
        ));
    }

    Ok(Json(ApiResponse {
        success: true,
        message: "Message sent successfully".into(),
        data: Some(json!({
            "to": req.to,
            "type": kind,
            "body_length": body_length,
            "sent_at": rfc3339_now(),
            "request_id": request_id,
        })),
        error: String::new(),
    }))
}

#[debug_handler]
async fn send_muc_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SendMucMessageRequest>, JsonRejection>,
) -> Result<Json<ApiResponse>, ApiError> {
    let request_id = request_id(&headers);
    let Json(req) = payload.map_err(|err| {
        warn!(error = %err, request_id = %request_id, "Invalid request body");
        ApiError::bad_request("Invalid request body")
    })?;
    validate_send_muc(&req).map_err(|reason| {
        warn!(error = reason, request_id = %request_id, "Request validation failed");
        ApiError::bad_request(reason)
    })?;

    let body_length = req.body.chars().count();
    info!(
        room = %req.room,
        subject = %req.subject,
        body_length,
        request_id = %request_id,
        "Sending MUC message"
    );

    if let Err(err) = state
        .gateway
        .send_muc_message(&req.room, &req.body, &req.subject)
        .await
    {
        error!(error = %err, room = %req.room, request_id = %request_id, "Failed to send MUC message");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to send MUC message: {err}"),
        ));
    }

    Ok(Json(ApiResponse {
        success: true,
        message: "MUC message sent successfully".into(),
        data: Some(json!({
            "room": req.room,
            "subject": req.subject,
            "body_length": body_length,
            "sent_at": rfc3339_now(),
            "request_id": request_id,
        })),
        error: String::new(),
    }))
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Json<StatusResponse> {
    debug!(request_id = %request_id(&headers), "Status requested");
    Json(StatusResponse {
        xmpp_connected: state.gateway.is_connected(),
        api_running: true,
        webhook_config: state.config.webhook.url.clone(),
        version: BOT_VERSION.to_string(),
    })
}

async fn webhook_status(State(state): State<AppState>) -> Json<WebhookStatus> {
    Json(state.webhook.status())
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let timestamp = rfc3339_now();
    if state.gateway.is_connected() {
        return (
            StatusCode::OK,
            Json(json!({ "status": "ok", "timestamp": timestamp })),
        );
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "error",
            "timestamp": timestamp,
            "error": "XMPP connection lost",
        })),
    )
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "Jabber Bot API",
        "version": BOT_VERSION,
        "description": "XMPP Jabber bot with RESTful API",
        "endpoints": {
            "send": "/api/v1/send - Send XMPP message",
            "send_muc": "/api/v1/send-muc - Send MUC message",
            "status": "/api/v1/status - Get bot status",
            "health": "/api/v1/health - Health check",
            "webhook": "/api/v1/webhook/status - Get webhook status",
            "docs": "/docs - API documentation",
        },
    }))
}

async fn docs() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        API_DOCS,
    )
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Not found")
}

const API_DOCS: &str = r#"# Jabber Bot API

Base URL: /api/v1

## Authentication
When an API key is configured, every endpoint except /api/v1/health requires
either `API-Key: <key>` or `Authorization: Bearer <key>`.

## POST /api/v1/send
Send a message to an XMPP user.
Request:  {"to": "user@example.com", "body": "Hello", "type": "chat"}
          "type" is optional and defaults to "chat".
Response: {"success": true, "message": "Message sent successfully",
           "data": {"to", "type", "body_length", "sent_at", "request_id"}}

## POST /api/v1/send-muc
Send a message to a Multi-User Chat room.
Request:  {"room": "room@conference.example.com", "body": "Hello", "subject": "optional"}
Response: {"success": true, "message": "MUC message sent successfully",
           "data": {"room", "subject", "body_length", "sent_at", "request_id"}}

## GET /api/v1/status
{"xmpp_connected": true, "api_running": true, "webhook_url": "...", "version": "..."}

## GET /api/v1/webhook/status
{"running", "healthy", "queue_length", "total_sent", "total_failed",
 "last_sent", "last_failure", "last_error", "webhook_url"}

## GET /api/v1/health
200 {"status": "ok", "timestamp": "..."}
503 {"status": "error", "timestamp": "...", "error": "XMPP connection lost"}

## Errors
{"success": false, "error": "<message>", "code": <status>}

## Headers
X-Request-ID is echoed on every response and generated when absent.

## Webhook
Inbound XMPP messages are POSTed as {"message": {...}, "timestamp", "source": "jabber-bot"}.
Bodies starting with [test] go to the -test endpoint with the prefix stripped.
"#;
