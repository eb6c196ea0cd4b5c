//! # launchpad-server
//!
//! Messaging backend for the Launchpad portal.
//!
//! This binary provides:
//! - **User directory** (`GET`/`PATCH /users`), optionally seeded from a JSON
//!   file at startup
//! - **Message log** (`POST /messages`, per-participant and per-pair queries)
//!   stored in SQLite
//! - **Realtime feed** (`GET /messages/stream`) pushing every insert to the
//!   participants involved as server-sent events

mod api;
mod config;
mod error;
mod seed;

use tracing::info;
use tracing_subscriber::EnvFilter;

use launchpad_store::Database;

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
                .unwrap_or_else(|_| EnvFilter::new("info,launchpad_server=debug")),
        )
        .init();

    info!("Starting Launchpad messaging server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database and seed the directory
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };

    if let Some(path) = &config.seed_users_path {
        seed::seed_users(&db, path)?;
    }

    let http_addr = config.http_addr;
    let state = AppState::new(db, config);

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
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
