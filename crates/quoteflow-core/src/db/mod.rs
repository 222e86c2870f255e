//! Database layer for QuoteFlow

mod connection;
mod migrations;
mod repository;
mod state_repository;

pub use connection::Database;
pub use migrations::CURRENT_VERSION;
pub use repository::{ListFilter, RecordRepository, SqliteRecordRepository};
pub use state_repository::{SqliteSyncStateRepository, SyncStateRepository};
