//! Builders shared by unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::AppState;

pub const TEST_API_KEY: &str = "sk-test";

/// Config with one key, per-upstream limit 1, no global ceiling and heartbeat off.
pub fn test_config(upstreams: Vec<String>) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 8787,
        upstreams,
        upstream_max_concurrent: Some(1),
        max_concurrent: None,
        max_queue: Some(25),
        heartbeat: None,
        busy_message: "Gateway is fully occupied. Please try again later.".to_string(),
        api_keys: vec![TEST_API_KEY.to_string()],
        cors_allow_origin: "*".to_string(),
        log_level: "debug".to_string(),
    }
}

pub fn test_state(upstreams: Vec<String>) -> Arc<AppState> {
    state_from_config(test_config(upstreams))
}

pub fn state_from_config(config: Config) -> Arc<AppState> {
    Arc::new(AppState::new(config).unwrap())
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
