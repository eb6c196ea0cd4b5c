//! Client configuration loaded from environment variables.

use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the messaging API.
    /// Env: `LAUNCHPAD_API_URL`
    /// Default: `http://127.0.0.1:8080`
    pub api_url: String,

    /// Bearer token sent with every request.
    /// Env: `LAUNCHPAD_API_TOKEN`
    pub api_token: Option<String>,

    /// Capacity of the session event queue.
    /// Env: `LAUNCHPAD_THREAD_EVENT_CAPACITY`
    /// Default: `64`
    pub event_capacity: usize,

    /// Delay before reopening a dropped realtime stream.
    /// Env: `LAUNCHPAD_RECONNECT_DELAY_MS`
    /// Default: `2000`
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            event_capacity: 64,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("LAUNCHPAD_API_URL") {
            let url = url.trim().trim_end_matches('/');
            if url.is_empty() {
                tracing::warn!("Empty LAUNCHPAD_API_URL, using default");
            } else {
                config.api_url = url.to_string();
            }
        }

        if let Some(token) = lookup("LAUNCHPAD_API_TOKEN") {
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }

        if let Some(val) = lookup("LAUNCHPAD_THREAD_EVENT_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid LAUNCHPAD_THREAD_EVENT_CAPACITY, using default"
                ),
            }
        }

        if let Some(val) = lookup("LAUNCHPAD_RECONNECT_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.reconnect_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid LAUNCHPAD_RECONNECT_DELAY_MS, using default"
                ),
            }
        }

        config
    }
}
