use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] quoteflow_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Name cannot be empty")]
    EmptyName,
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    AmbiguousRecordId(String),
    #[error("Invalid line item '{0}': expected \"description|quantity|unit_cents\"")]
    InvalidLineItem(String),
    #[error("{0} sync pass(es) failed")]
    SyncFailed(usize),
    #[error(
        "Sync is not configured. Set QUOTEFLOW_SUPABASE_URL, QUOTEFLOW_SUPABASE_ANON_KEY, QUOTEFLOW_USER_ID, and QUOTEFLOW_ACCESS_TOKEN to enable `quoteflow sync`."
    )]
    SyncNotConfigured,
}
