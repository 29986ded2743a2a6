//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llm_gateway_common::{ErrorBody, ErrorKind};

/// Errors resolved at the HTTP boundary and reported to the client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing Authorization header. Use: Authorization: Bearer sk-xxxx")]
    MissingAuthorization,

    #[error("Invalid Authorization header format. Expected: Bearer sk-xxxx")]
    MalformedAuthorization,

    #[error("Incorrect API key provided.")]
    InvalidApiKey,

    /// Over the global ceiling or the pending queue is full.
    #[error("{0}")]
    Busy(String),

    #[error("Gateway failed to reach the inference server.")]
    UpstreamUnreachable,

    /// A queued request lost its place without being dispatched.
    #[error("Request was dropped before it could be dispatched.")]
    Abandoned,

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Request body exceeds the {0} byte limit.")]
    PayloadTooLarge(usize),

    #[error("Not found")]
    NotFound,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingAuthorization
            | GatewayError::MalformedAuthorization
            | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            GatewayError::Abandoned => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::MissingAuthorization
            | GatewayError::MalformedAuthorization
            | GatewayError::InvalidApiKey => ErrorKind::InvalidApiKey,
            GatewayError::Busy(_) => ErrorKind::RateLimitExceeded,
            GatewayError::UpstreamUnreachable | GatewayError::Abandoned => ErrorKind::GatewayError,
            GatewayError::InvalidBody(_) | GatewayError::PayloadTooLarge(_) => {
                ErrorKind::InvalidRequestError
            }
            GatewayError::NotFound => ErrorKind::NotFoundError,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody::new(self.kind(), self.to_string()));
        (self.status(), body).into_response()
    }
}
