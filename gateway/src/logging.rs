use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Middleware that runs each request in its own span and logs it at INFO level.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!(
        "request",
        id = %Uuid::new_v4(),
        method = %method,
        path = %path,
    );

    let response = next.run(request).instrument(span.clone()).await;

    let status = response.status();
    let duration = start.elapsed();

    span.in_scope(|| {
        tracing::info!(
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "HTTP request"
        )
    });

    response
}
