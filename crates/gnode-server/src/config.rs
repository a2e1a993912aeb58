//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use gnode_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT, DEFAULT_MAX_RESULTS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None`, meaning `gnode.db` in the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"G-Node"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Page size used when a list request gives no `max_results`.
    /// Env: `DEFAULT_MAX_RESULTS`
    /// Default: `1000`
    pub default_max_results: usize,

    /// Sustained requests per second allowed per client IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst capacity of each client's token bucket.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            instance_name: APP_NAME.to_string(),
            admin_token: None,
            default_max_results: DEFAULT_MAX_RESULTS,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(name) = var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = var("DEFAULT_MAX_RESULTS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.default_max_results = n,
                _ => tracing::warn!(value = %val, "Invalid DEFAULT_MAX_RESULTS, using default"),
            }
        }

        if let Some(val) = var("RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = positive_f64("RATE_LIMIT_PER_SEC", &val)
                .unwrap_or(config.rate_limit_per_sec);
        }

        if let Some(val) = var("RATE_LIMIT_BURST") {
            config.rate_limit_burst = positive_f64("RATE_LIMIT_BURST", &val)
                .unwrap_or(config.rate_limit_burst);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn positive_f64(key: &str, value: &str) -> Option<f64> {
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => Some(n),
        _ => {
            tracing::warn!(key, value, "Invalid rate limit setting, using default");
            None
        }
    }
}
