use launchpad_shared::error::RowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// Rejected by the shared message/user rules before touching SQLite.
    #[error("Invalid record: {0}")]
    Invalid(#[from] RowError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
