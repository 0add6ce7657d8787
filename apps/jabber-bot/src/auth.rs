use axum::{
    extract::{Request, State},
    http::{
        HeaderMap, StatusCode,
        header::{AUTHORIZATION, USER_AGENT},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::http::{ApiError, AppState};

pub const API_KEY_HEADER: &str = "api-key";
const UNAUTHORIZED: &str = "Unauthorized - valid API key required";

/// `API-Key: <key>` first, then `Authorization: Bearer <key>`.
pub fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    api_key.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    })
}

/// Rejects requests that do not carry the configured API key.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let expected = state.config.api.api_key.as_str();
    if expected.is_empty() {
        return next.run(req).await;
    }

    if presented_key(req.headers()) != Some(expected) {
        warn!(
            path = %req.uri().path(),
            method = %req.method(),
            user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
            "Unauthorized access attempt"
        );
        return ApiError::new(StatusCode::UNAUTHORIZED, UNAUTHORIZED).into_response();
    }

    debug!(path = %req.uri().path(), method = %req.method(), "API key authenticated");
    next.run(req).await
}
