//! # gnode-server
//!
//! HTTP front end for the G-Node metadata store.
//!
//! This binary provides:
//! - **REST API** (axum) over versioned, access-controlled objects under
//!   `/api/<type>/`, with history, point-in-time reads and ACL management
//! - **ETag / Last-Modified** validators on single-object reads
//! - **Admin endpoints** for provisioning users and friendships
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod config;
mod error;
mod objects;
mod rate_limit;

use gnode_rest::Registry;
use gnode_store::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gnode_server=debug")),
        )
        .init();

    info!("Starting G-Node server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = open_database(&config)?;

    let registry = Registry::builtin();
    registry.validate().map_err(anyhow::Error::msg)?;
    info!(types = registry.names().count(), "Entity registry ready");

    let http_addr = config.http_addr;
    let app_state = AppState::new(db, registry, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// `DATABASE_PATH` when set, otherwise the platform data directory.
fn open_database(config: &ServerConfig) -> anyhow::Result<Database> {
    let db = match &config.database_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            info!(path = %path.display(), "opening database");
            Database::open_at(path)?
        }
        None => Database::new()?,
    };
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_database_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gnode.db");
        let config = ServerConfig {
            database_path: Some(path.clone()),
            ..ServerConfig::default()
        };

        let db = open_database(&config).unwrap();
        db.create_user("ada").unwrap();
        assert!(path.exists());
    }
}
