use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Input rejected before touching the database.
    #[error("{0}")]
    Validation(#[from] agora_shared::ValidationError),

    /// The requester may not perform this mutation.
    #[error("{0}")]
    Forbidden(&'static str),

    #[error("Cannot block yourself")]
    SelfBlock,

    #[error("User is already blocked")]
    AlreadyBlocked,

    #[error("User is not blocked")]
    NotBlocked,

    #[error("Message was already deleted")]
    AlreadyDeleted,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The blocking worker running a database call panicked or was cancelled.
    #[error("Database task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(agora_shared::ValidationError::new(message))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
