pub mod auth;
pub mod config;
pub mod cors;
pub mod error;
pub mod logging;
pub mod relay;
pub mod routes;
pub mod scheduler;
pub mod test_util;

pub use auth::ApiKeys;
pub use config::{Config, ConfigError};
pub use cors::CorsPolicy;
pub use error::GatewayError;
pub use relay::Relay;
pub use scheduler::{Admission, Scheduler};

use std::sync::Arc;

use axum::http::header::InvalidHeaderValue;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    pub config: Config,
    /// Admission, queue and upstream counters.
    pub scheduler: Arc<Scheduler>,
    /// Outbound client and heartbeat settings.
    pub relay: Relay,
    pub api_keys: ApiKeys,
    pub cors: CorsPolicy,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, InvalidHeaderValue> {
        let cors = CorsPolicy::new(&config.cors_allow_origin)?;
        Ok(Self {
            scheduler: Scheduler::from_config(&config),
            relay: Relay::new(config.heartbeat),
            api_keys: ApiKeys::new(config.api_keys.iter().cloned()),
            cors,
            config,
        })
    }
}
