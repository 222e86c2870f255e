//! Per-entity sync bookkeeping

use serde::{Deserialize, Serialize};

use crate::util::timestamp_millis;

/// Reconciliation state for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Cursor of the last completed pass (RFC 3339); `None` means never synced
    pub last_sync_at: Option<String>,
    /// Pre-existing local data has been bulk uploaded once
    pub has_migrated: bool,
    /// Kill switch
    pub sync_enabled: bool,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            last_sync_at: None,
            has_migrated: false,
            sync_enabled: true,
        }
    }
}

impl SyncMetadata {
    pub fn last_sync_millis(&self) -> Option<i64> {
        self.last_sync_at
            .as_deref()
            .map(|cursor| timestamp_millis(Some(cursor)))
    }
}

/// Persisted lock record for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLockState {
    pub in_progress: bool,
    /// Unix milliseconds when the lock was taken
    pub started_at: Option<i64>,
}
