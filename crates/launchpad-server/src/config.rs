//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server starts with zero configuration
//! for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use launchpad_shared::constants::{DEFAULT_FEED_CAPACITY, DEFAULT_HTTP_PORT};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: the platform data directory.
    pub database_path: Option<PathBuf>,

    /// JSON file of user rows loaded into the directory at startup.
    /// Env: `SEED_USERS_PATH`
    pub seed_users_path: Option<PathBuf>,

    /// Bearer token required on every route except `/health`.
    /// Env: `API_TOKEN`
    /// Default: unset (no authentication).
    pub api_token: Option<String>,

    /// Capacity of the realtime insert feed.
    /// Env: `FEED_CAPACITY`
    /// Default: `256`
    pub feed_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            seed_users_path: None,
            api_token: None,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

// Keeps the token out of logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("seed_users_path", &self.seed_users_path)
            .field("auth_enabled", &self.api_token.is_some())
            .field("feed_capacity", &self.feed_capacity)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(path) = lookup("SEED_USERS_PATH") {
            if !path.is_empty() {
                config.seed_users_path = Some(PathBuf::from(path));
            }
        }

        if let Some(token) = lookup("API_TOKEN") {
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }

        if let Some(val) = lookup("FEED_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.feed_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid FEED_CAPACITY, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}
