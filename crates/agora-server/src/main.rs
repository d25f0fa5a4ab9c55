//! # agora-server
//!
//! Direct-messaging service for the Agora debate platform.
//!
//! This binary provides:
//! - **REST API** (axum) for conversations, messages, blocks, user search
//!   and unread counts
//! - **Realtime gateway** over WebSocket with conversation rooms, typing
//!   indicators and presence
//! - **Admin API** for directory sync and summary repair
//! - **Per-IP and per-user rate limiting** to protect against abuse

mod api;
mod auth;
mod config;
mod error;
mod gateway;
mod presence;
mod rate_limit;
mod service;

#[cfg(test)]
mod testing;

use std::time::Duration;

use agora_store::{Database, SharedDatabase};
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
                .unwrap_or_else(|_| EnvFilter::new("info,agora_server=debug,agora_store=info")),
        )
        .init();

    info!("Starting Agora messaging server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        auth_configured = config.auth_key_configured(),
        admin_enabled = config.admin_token.is_some(),
        max_ws_connections = config.max_ws_connections,
        "Instance settings"
    );
    if !config.auth_key_configured() {
        tracing::warn!("AUTH_SERVICE_PUBKEY not set, every session will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Open the database (runs migrations)
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let db = SharedDatabase::new(db);

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, db);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let ip_limiter = app_state.rate_limiter.clone();
    let send_limiter = app_state.messenger.send_limiter().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            ip_limiter.purge_stale(600.0).await;
            send_limiter.purge_stale(600.0).await;
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
