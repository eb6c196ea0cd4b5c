use thiserror::Error;

use launchpad_shared::error::RowError;

/// Failure reported by one of the external services (message store, user
/// directory, auth provider, realtime feed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}

impl From<RowError> for ServiceError {
    fn from(e: RowError) -> Self {
        ServiceError::Decode(e.to_string())
    }
}

/// Error signal produced at the messaging boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("No conversation selected")]
    NoCounterpart,

    #[error("Cannot send a message to yourself")]
    SelfMessage,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Messaging session closed")]
    SessionClosed,
}

impl From<RowError> for MessagingError {
    fn from(e: RowError) -> Self {
        match e {
            RowError::EmptyBody => MessagingError::EmptyMessage,
            RowError::BodyTooLarge { max } => MessagingError::MessageTooLarge { max },
            RowError::SelfAddressed(_) => MessagingError::SelfMessage,
            other => MessagingError::Service(other.into()),
        }
    }
}
