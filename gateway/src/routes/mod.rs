pub mod chat;
pub mod health;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::cors::apply_cors;
use crate::error::GatewayError;
use crate::logging::request_logger;
use crate::AppState;

/// Build the full HTTP surface.
///
/// CORS wraps everything, including the fallback and error responses.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router(state.clone()))
        .merge(chat::router(state.clone()))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state, apply_cors))
        .layer(middleware::from_fn(request_logger))
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> GatewayError {
    GatewayError::NotFound
}
