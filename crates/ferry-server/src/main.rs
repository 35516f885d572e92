//! # ferry-server
//!
//! Real-time relay in front of a polled chat source.
//!
//! This binary provides:
//! - **Ingestion**: a sequential poller that pulls new records from the
//!   upstream endpoint, deduplicates them in SQLite and fans them out
//! - **Push connections**: WebSocket clients with acknowledged, retried
//!   delivery of important events and backpressure-aware queuing
//! - **Presence**: foreground/background tracking with an offline grace
//!   period and a deduplicated online count
//! - **Internal API** (axum) for collaborators to publish events and manage
//!   the author block list
//! - **Per-IP rate limiting** on every HTTP request

mod api;
mod config;
mod db;
mod error;
mod hub;
mod ingest;
mod rate_limit;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use ferry_store::Database;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::db::SharedDatabase;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ferry_server=debug")),
        )
        .init();

    info!("Starting Ferry relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        ingestion = config.source_url.is_some(),
        admin_enabled = config.admin_token.is_some(),
        max_connections = config.max_connections,
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = SharedDatabase::new(Database::open_at(&config.database_path)?);
    let hub = Hub::spawn(config.hub.clone());
    let rate_limiter = RateLimiter::from_config(&config);

    let app_state = AppState {
        hub: hub.clone(),
        db: db.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict rate-limit buckets idle for ten minutes, every five minutes.
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // A broken upstream configuration should not take the push side down.
    if let Err(e) = ingest::start(&config, db, hub).await {
        warn!(error = %e, "Ingestion failed to start");
    }

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
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
