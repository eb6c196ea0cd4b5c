use thiserror::Error;

/// Errors raised while normalizing backend rows into the canonical model.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RowError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Message body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("Sender and receiver are the same participant: {0}")]
    SelfAddressed(String),
}
