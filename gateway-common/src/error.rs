//! OpenAI-style error envelope returned by the gateway.

use serde::{Deserialize, Serialize};

/// Error categories surfaced to clients in the `error.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, malformed, or unrecognized bearer token.
    InvalidApiKey,
    /// Gateway is over its global ceiling or the queue is full.
    RateLimitExceeded,
    /// Upstream unreachable or failed before any response bytes were sent.
    GatewayError,
    /// Request body could not be accepted.
    InvalidRequestError,
    /// No route matched.
    NotFoundError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidApiKey => write!(f, "invalid_api_key"),
            ErrorKind::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            ErrorKind::GatewayError => write!(f, "gateway_error"),
            ErrorKind::InvalidRequestError => write!(f, "invalid_request_error"),
            ErrorKind::NotFoundError => write!(f, "not_found_error"),
        }
    }
}

/// Body of an error response: `{ "error": { "message", "type" } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind,
            },
        }
    }
}
