//! Bearer token authentication for API and WebSocket routes.
//!
//! The token comes from `Authorization: Bearer <token>` or, for WebSocket
//! upgrades that cannot set headers, a `?token=` query parameter. The header
//! wins when both are present. Without a configured token every request
//! passes.
//!
//! Browser requests are additionally checked against the allowed origins,
//! token or not, so a web page cannot drive the API through the user's
//! browser.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::state::SharedState;

/// `Authorization: Bearer <token>`; None for a missing header or another scheme.
fn extract_bearer_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// `?token=<value>`, for WebSocket clients that cannot set headers.
///
/// - `/ws/events?token=abc123` -> Some("abc123")
/// - `/ws/events?foo=bar` -> None
fn extract_query_token<B>(req: &axum::http::Request<B>) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

/// Rejects browser requests from origins that are not explicitly allowed.
pub async fn origin_middleware(
    State(state): State<Arc<SharedState>>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default());

    if state.origin_allowed(origin) {
        next.run(req).await
    } else {
        log::warn!(
            "rejected request to {} from origin {}",
            req.uri().path(),
            origin.unwrap_or_default()
        );
        (StatusCode::FORBIDDEN, "Origin not allowed").into_response()
    }
}

/// Rejects requests without a valid token when one is configured.
pub async fn auth_middleware(
    State(state): State<Arc<SharedState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth_token.is_none() {
        return next.run(req).await;
    }

    let query_token = extract_query_token(&req);
    let token = extract_bearer_token(&req).or(query_token.as_deref());

    if state.validate_token(token) {
        next.run(req).await
    } else {
        log::warn!("rejected unauthenticated request to {}", req.uri().path());
        (StatusCode::UNAUTHORIZED, "Invalid or missing authentication token").into_response()
    }
}

// ============================================================================
// TESTS
// ============================================================================
