use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::Response,
    routing::post,
    Extension, Router,
};
use serde::de::IgnoredAny;

use crate::auth::{require_api_key, CallerKey};
use crate::error::GatewayError;
use crate::relay::CHAT_COMPLETIONS_PATH;
use crate::scheduler::Admission;
use crate::AppState;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// POST /v1/chat/completions - OpenAI-compatible chat endpoint
///
/// The body is only checked for JSON syntax and forwarded byte-for-byte.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerKey>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, GatewayError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge(MAX_BODY_BYTES)
        } else {
            GatewayError::InvalidBody(rejection.body_text())
        }
    })?;
    serde_json::from_slice::<IgnoredAny>(&body)
        .map_err(|e| GatewayError::InvalidBody(e.to_string()))?;

    let slot = match state.scheduler.admit() {
        Admission::Dispatch(slot) => slot,
        Admission::Queued(ticket) => ticket.wait().await?,
        Admission::Rejected(_) => {
            return Err(GatewayError::Busy(state.config.busy_message.clone()));
        }
    };

    tracing::info!(
        key = %caller.fingerprint,
        upstream = %slot.upstream_base(),
        "Dispatching chat completion"
    );
    Ok(state.relay.dispatch(slot, body).await)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
