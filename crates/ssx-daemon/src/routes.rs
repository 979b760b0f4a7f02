//! Axum router and HTTP handlers for the webhook ingress.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! layers after the call so tests can drive the bare router. Handlers are
//! `pub(crate)` for the scenario tests in `tests/`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::HOST, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use ssx_engine::{process_signed_event, EventError};

use crate::state::AppState;

/// Provider signature header on every delivery.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(serde::Serialize)]
struct ReceivedResponse {
    received: bool,
}

#[derive(serde::Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the application router wired to the given shared state.
///
/// Middleware (trace) is **not** applied here; `main.rs` attaches it.
pub fn build_router(state: Arc<AppState>) -> Router {
    let webhook_path = state.webhook_path.clone();
    Router::new()
        .route("/health", get(health))
        .route(&webhook_path, post(receive_webhook))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// ---------------------------------------------------------------------------
// POST {webhook_path}
// ---------------------------------------------------------------------------

/// Accept one signed event delivery.
///
/// The tenant is resolved from the request `Host` header against the
/// merchant table; the body is the raw envelope bytes (the signature covers
/// them byte-for-byte, so no extractor may touch them first).
pub(crate) async fn receive_webhook(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(merchant) = st.merchants.resolve(host) else {
        info!(host, "delivery for unknown host");
        return error_response(StatusCode::NOT_FOUND, "unknown host");
    };

    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing signature header");
    };

    match process_signed_event(
        &st.upserter,
        &merchant.account_id,
        &body,
        signature,
        &merchant.webhook_secret,
    )
    .await
    {
        Ok(received) => {
            info!(host, event = %received.event_id, "delivery accepted");
            (StatusCode::OK, Json(ReceivedResponse { received: true })).into_response()
        }
        Err(e @ (EventError::Signature(_) | EventError::Decode(_))) => {
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e @ EventError::Downstream(_)) => {
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
