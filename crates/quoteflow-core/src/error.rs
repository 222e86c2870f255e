//! Error types for quoteflow-core

use thiserror::Error;

/// Result type alias using quoteflow-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in quoteflow-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored entity body could not be decoded
    #[error("Payload error: {0}")]
    Payload(String),

    /// Remote gateway error surfaced to a caller that needs it
    #[error("Remote error: {0}")]
    Remote(String),

    /// Local data failed an integrity check
    #[error("Local data is corrupt: {0}")]
    Corruption(String),
}

impl Error {
    /// Whether this error means the SQLite file itself is unusable.
    pub fn is_corrupted_database(&self) -> bool {
        let message = self.to_string().to_ascii_lowercase();
        message.contains("file is not a database")
            || message.contains("database disk image is malformed")
    }
}
