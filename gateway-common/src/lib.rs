//! LLM Gateway Common Types
//!
//! Wire types shared by the gateway server and its clients/tests.

pub mod error;
pub mod health;

pub use error::{ErrorBody, ErrorDetail, ErrorKind};
pub use health::{HealthResponse, UpstreamHealth};
