//! Configuration for the gateway.

use std::time::Duration;

use config::{Config as ConfigLoader, Environment, File, Map};
use serde::Deserialize;

/// Environment variables the gateway reads. Everything else in the process
/// environment is ignored.
const ENV_KEYS: &[&str] = &[
    "GATEWAY_HOST",
    "GATEWAY_PORT",
    "LLM_UPSTREAM",
    "LLM_UPSTREAMS",
    "LLM_SERVER_MAX_CONCURRENT",
    "GATEWAY_MAX_CONCURRENT",
    "GATEWAY_MAX_QUEUE",
    "GATEWAY_HEARTBEAT_MS",
    "GATEWAY_BUSY_MESSAGE",
    "LLM_API_KEYS",
    "CORS_ALLOW_ORIGIN",
    "LOG_LEVEL",
];

/// Settings as they appear in `gateway.toml` or the environment, before
/// interpretation.
#[derive(Debug, Clone, Deserialize)]
struct Settings {
    #[serde(default = "default_host")]
    gateway_host: String,
    #[serde(default = "default_port")]
    gateway_port: u16,
    #[serde(default = "default_upstream")]
    llm_upstream: String,
    #[serde(default)]
    llm_upstreams: Option<String>,
    #[serde(default)]
    llm_server_max_concurrent: Option<i64>,
    #[serde(default)]
    gateway_max_concurrent: Option<i64>,
    #[serde(default)]
    gateway_max_queue: Option<i64>,
    #[serde(default)]
    gateway_heartbeat_ms: Option<i64>,
    #[serde(default)]
    gateway_busy_message: Option<String>,
    #[serde(default)]
    llm_api_keys: Option<String>,
    #[serde(default = "default_cors_origin")]
    cors_allow_origin: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

/// Interpreted gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub host: String,
    /// Listen port (default: 8787)
    pub port: u16,
    /// Upstream base URLs, without trailing slash. Never empty.
    pub upstreams: Vec<String>,
    /// Per-upstream concurrency ceiling (default and minimum: 1). `None`, only
    /// reachable when built in code, means unbounded.
    pub upstream_max_concurrent: Option<usize>,
    /// Global ceiling on active + queued requests. `None` means unbounded.
    pub max_concurrent: Option<usize>,
    /// Pending queue capacity. `Some(0)` disables queueing, `None` is unbounded.
    pub max_queue: Option<usize>,
    /// Heartbeat interval while waiting for upstream bytes. `None` disables it.
    pub heartbeat: Option<Duration>,
    /// Message returned with 429 responses.
    pub busy_message: String,
    /// Accepted API keys.
    pub api_keys: Vec<String>,
    /// `Access-Control-Allow-Origin` value.
    pub cors_allow_origin: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("No upstream configured (set LLM_UPSTREAM or LLM_UPSTREAMS)")]
    NoUpstreams,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_upstream() -> String {
    "http://127.0.0.1:5857".to_string()
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
const DEFAULT_MAX_QUEUE: usize = 25;
const DEFAULT_HEARTBEAT_MS: u64 = 15_000;

impl Config {
    /// Load configuration from `gateway.toml` (optional) and the process environment.
    ///
    /// Environment variables take precedence over the file.
    pub fn load() -> Result<Self, ConfigError> {
        let env: Map<String, String> = std::env::vars()
            .filter(|(key, _)| ENV_KEYS.contains(&key.as_str()))
            .collect();
        Self::load_with_env(env)
    }

    /// Load configuration using `env` in place of the process environment.
    pub fn load_with_env(env: Map<String, String>) -> Result<Self, ConfigError> {
        let settings: Settings = ConfigLoader::builder()
            .add_source(File::with_name("gateway").required(false))
            .add_source(
                Environment::default()
                    .source(Some(env))
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()?
            .try_deserialize()?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let mut upstreams: Vec<String> = parse_list(settings.llm_upstreams.as_deref())
            .into_iter()
            .map(|base| base.trim_end_matches('/').to_string())
            .collect();
        if upstreams.is_empty() {
            let base = settings.llm_upstream.trim().trim_end_matches('/');
            if base.is_empty() {
                return Err(ConfigError::NoUpstreams);
            }
            upstreams.push(base.to_string());
        }

        // Values below 1 are clamped rather than lifting the ceiling.
        let upstream_max_concurrent = match settings.llm_server_max_concurrent {
            Some(n) if n > 0 => Some(n as usize),
            _ => Some(1),
        };

        let max_concurrent = settings
            .gateway_max_concurrent
            .filter(|n| *n > 0)
            .map(|n| n as usize);

        let max_queue = match settings.gateway_max_queue {
            None => Some(DEFAULT_MAX_QUEUE),
            Some(n) if n < 0 => None,
            Some(n) => Some(n as usize),
        };

        let heartbeat = match settings.gateway_heartbeat_ms {
            None => Some(Duration::from_millis(DEFAULT_HEARTBEAT_MS)),
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            Some(_) => None,
        };

        let busy_message = settings
            .gateway_busy_message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_busy_message(max_concurrent));

        Ok(Config {
            host: settings.gateway_host,
            port: settings.gateway_port,
            upstreams,
            upstream_max_concurrent,
            max_concurrent,
            max_queue,
            heartbeat,
            busy_message,
            api_keys: parse_list(settings.llm_api_keys.as_deref()),
            cors_allow_origin: settings.cors_allow_origin,
            log_level: settings.log_level,
        })
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        tracing::info!("Port: {}", self.port);
        let limit = self
            .upstream_max_concurrent
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string());
        for base in &self.upstreams {
            tracing::info!("Upstream: {} (max {})", base, limit);
        }
        tracing::info!("Valid API keys: {}", self.api_keys.len());
        tracing::info!("CORS allow origin: {}", self.cors_allow_origin);
        match self.max_concurrent {
            Some(n) => tracing::info!("Max concurrent chat completions: {}", n),
            None => tracing::info!("Max concurrent chat completions: unlimited"),
        }
        match self.max_queue {
            Some(n) => tracing::info!("Max queued requests: {}", n),
            None => tracing::info!("Max queued requests: unlimited"),
        }
        match self.heartbeat {
            Some(interval) => tracing::info!("Heartbeat interval: {}ms", interval.as_millis()),
            None => tracing::info!("Heartbeat: disabled"),
        }
    }
}

fn default_busy_message(max_concurrent: Option<usize>) -> String {
    match max_concurrent {
        Some(n) => format!(
            "Currently more than {} users are active. Please try again later.",
            n
        ),
        None => "Gateway is fully occupied. Please try again later.".to_string(),
    }
}

/// Split a comma-separated list, trimming items and dropping empty ones.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
