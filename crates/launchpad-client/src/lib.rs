//! # launchpad-client
//!
//! Direct-messaging core of the Launchpad portal: reconciles the persistent
//! message log and the realtime insert feed into per-counterpart
//! conversations and an ordered active thread.

pub mod auth;
pub mod channel;
pub mod config;
pub mod conversations;
pub mod directory;
pub mod error;
pub mod events;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod services;
pub mod session;

pub use auth::{AuthContext, AuthState};
pub use channel::{BroadcastChannel, MessageChannel, SubscriptionHandle};
pub use config::ClientConfig;
pub use conversations::ConversationStore;
pub use directory::Directory;
pub use error::{MessagingError, ServiceError};
pub use events::SessionEvent;
pub use http::{HttpBackend, SseChannel};
pub use session::{spawn_session, spawn_signed_in_session, SessionConfig, SessionHandle};

use tracing_subscriber::{fmt, EnvFilter};

/// Install a `tracing` subscriber for applications embedding the client.
///
/// Respects `RUST_LOG`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("launchpad_client=debug,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
