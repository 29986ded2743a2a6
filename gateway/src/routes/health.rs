use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use llm_gateway_common::HealthResponse;

use crate::AppState;

/// GET /health - upstream load and key count
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.scheduler.snapshot();
    Json(HealthResponse {
        ok: true,
        upstreams: snapshot.upstreams,
        keys_configured: state.api_keys.len(),
        active: snapshot.active,
        queued: snapshot.queued,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
