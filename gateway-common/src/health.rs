//! `/health` document.

use serde::{Deserialize, Serialize};

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub upstreams: Vec<UpstreamHealth>,
    pub keys_configured: usize,
    /// Requests currently being proxied across all upstreams.
    #[serde(default)]
    pub active: usize,
    /// Requests waiting in the pending queue.
    #[serde(default)]
    pub queued: usize,
}

/// Load of a single upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamHealth {
    pub base: String,
    pub active: usize,
    /// `null` when the upstream has no concurrency ceiling.
    pub limit: Option<usize>,
}
