//! Sync metadata, sync lock, and app state repository

use crate::error::Result;
use crate::models::{EntityType, SyncLockState, SyncMetadata};
use crate::util::timestamp_millis;
use rusqlite::{params, Connection, OptionalExtension};

const LAST_SYNC_AT: &str = "last_sync_at";
const HAS_MIGRATED: &str = "has_migrated";
const SYNC_ENABLED: &str = "sync_enabled";

/// Trait for sync bookkeeping storage operations
pub trait SyncStateRepository {
    /// Load metadata for an entity type, defaulting missing keys
    fn load_metadata(&self, entity: EntityType) -> Result<SyncMetadata>;

    /// Save metadata for an entity type
    fn save_metadata(&self, entity: EntityType, metadata: &SyncMetadata) -> Result<()>;

    /// Load the persisted lock for an entity type
    fn load_lock(&self, entity: EntityType) -> Result<SyncLockState>;

    /// Save the persisted lock for an entity type
    fn save_lock(&self, entity: EntityType, lock: &SyncLockState) -> Result<()>;

    /// Take the lock at `now_ms` unless a holder started after
    /// `stale_before_ms`; returns whether this call took it
    fn claim_lock(&self, entity: EntityType, now_ms: i64, stale_before_ms: i64) -> Result<bool>;

    /// Read a device-local app state value
    fn get_state(&self, key: &str) -> Result<Option<String>>;

    /// Write a device-local app state value
    fn set_state(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a device-local app state value
    fn remove_state(&self, key: &str) -> Result<()>;
}

/// `SQLite` implementation of `SyncStateRepository`
pub struct SqliteSyncStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn metadata_key(entity: EntityType, field: &str) -> String {
        format!("{}.{field}", entity.as_str())
    }

    fn get_metadata(&self, entity: EntityType, field: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?",
                params![Self::metadata_key(entity, field)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_metadata(&self, entity: EntityType, field: &str, value: Option<&str>) -> Result<()> {
        let key = Self::metadata_key(entity, field);
        match value {
            Some(value) => self.conn.execute(
                "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?, ?)",
                params![key, value],
            )?,
            None => self
                .conn
                .execute("DELETE FROM sync_metadata WHERE key = ?", params![key])?,
        };
        Ok(())
    }

    /// Describe every sync metadata row that does not parse
    pub fn integrity_issues(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM sync_metadata")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut issues = Vec::new();
        for (key, value) in rows {
            let Some((entity, field)) = key.split_once('.') else {
                issues.push(format!("sync_metadata/{key}: malformed key"));
                continue;
            };
            if entity.parse::<EntityType>().is_err() {
                issues.push(format!("sync_metadata/{key}: unknown entity type"));
                continue;
            }
            let valid = match field {
                LAST_SYNC_AT => timestamp_millis(Some(&value)) > 0,
                HAS_MIGRATED | SYNC_ENABLED => parse_flag(&value).is_some(),
                _ => false,
            };
            if !valid {
                issues.push(format!("sync_metadata/{key}: unexpected value '{value}'"));
            }
        }
        Ok(issues)
    }

    /// Remove all sync bookkeeping and app state
    pub fn wipe(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM sync_metadata", [])?;
        tx.execute("DELETE FROM sync_lock", [])?;
        tx.execute("DELETE FROM app_state", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

const fn render_flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl SyncStateRepository for SqliteSyncStateRepository<'_> {
    fn load_metadata(&self, entity: EntityType) -> Result<SyncMetadata> {
        let mut metadata = SyncMetadata::default();

        // An unreadable cursor is dropped, which forces a safe initial sync
        if let Some(value) = self.get_metadata(entity, LAST_SYNC_AT)? {
            if timestamp_millis(Some(&value)) > 0 {
                metadata.last_sync_at = Some(value);
            }
        }
        if let Some(flag) = self
            .get_metadata(entity, HAS_MIGRATED)?
            .as_deref()
            .and_then(parse_flag)
        {
            metadata.has_migrated = flag;
        }
        if let Some(flag) = self
            .get_metadata(entity, SYNC_ENABLED)?
            .as_deref()
            .and_then(parse_flag)
        {
            metadata.sync_enabled = flag;
        }

        Ok(metadata)
    }

    fn save_metadata(&self, entity: EntityType, metadata: &SyncMetadata) -> Result<()> {
        self.set_metadata(entity, LAST_SYNC_AT, metadata.last_sync_at.as_deref())?;
        self.set_metadata(entity, HAS_MIGRATED, Some(render_flag(metadata.has_migrated)))?;
        self.set_metadata(entity, SYNC_ENABLED, Some(render_flag(metadata.sync_enabled)))?;
        Ok(())
    }

    fn load_lock(&self, entity: EntityType) -> Result<SyncLockState> {
        let lock = self
            .conn
            .query_row(
                "SELECT in_progress, started_at FROM sync_lock WHERE entity_type = ?",
                params![entity.as_str()],
                |row| {
                    Ok(SyncLockState {
                        in_progress: row.get::<_, i32>(0)? != 0,
                        started_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(lock.unwrap_or_default())
    }

    fn save_lock(&self, entity: EntityType, lock: &SyncLockState) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_lock (entity_type, in_progress, started_at)
             VALUES (?, ?, ?)",
            params![entity.as_str(), i32::from(lock.in_progress), lock.started_at],
        )?;
        Ok(())
    }

    fn claim_lock(&self, entity: EntityType, now_ms: i64, stale_before_ms: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT INTO sync_lock (entity_type, in_progress, started_at)
             VALUES (?1, 1, ?2)
             ON CONFLICT(entity_type) DO UPDATE
                SET in_progress = 1, started_at = excluded.started_at
                WHERE sync_lock.in_progress = 0
                   OR sync_lock.started_at IS NULL
                   OR sync_lock.started_at <= ?3",
            params![entity.as_str(), now_ms, stale_before_ms],
        )?;
        Ok(changed == 1)
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO app_state (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_state(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM app_state WHERE key = ?", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metadata_defaults_when_missing() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        let metadata = repo.load_metadata(EntityType::Quote).unwrap();
        assert_eq!(metadata, SyncMetadata::default());
        assert!(metadata.sync_enabled);
    }

    #[test]
    fn test_metadata_is_scoped_per_entity() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        let metadata = SyncMetadata {
            last_sync_at: Some("2024-05-01T10:00:00.000Z".to_string()),
            has_migrated: true,
            sync_enabled: false,
        };
        repo.save_metadata(EntityType::Quote, &metadata).unwrap();

        assert_eq!(repo.load_metadata(EntityType::Quote).unwrap(), metadata);
        assert_eq!(
            repo.load_metadata(EntityType::Invoice).unwrap(),
            SyncMetadata::default()
        );
    }

    #[test]
    fn test_clearing_cursor_removes_row() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        let mut metadata = SyncMetadata {
            last_sync_at: Some("2024-05-01T10:00:00.000Z".to_string()),
            ..SyncMetadata::default()
        };
        repo.save_metadata(EntityType::Client, &metadata).unwrap();
        metadata.last_sync_at = None;
        repo.save_metadata(EntityType::Client, &metadata).unwrap();

        assert_eq!(repo.load_metadata(EntityType::Client).unwrap().last_sync_at, None);
    }

    #[test]
    fn test_lock_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        assert_eq!(
            repo.load_lock(EntityType::Client).unwrap(),
            SyncLockState::default()
        );
        let held = SyncLockState {
            in_progress: true,
            started_at: Some(42),
        };
        repo.save_lock(EntityType::Client, &held).unwrap();
        assert_eq!(repo.load_lock(EntityType::Client).unwrap(), held);
    }

    #[test]
    fn test_claim_lock_only_succeeds_when_free_or_stale() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        assert!(repo.claim_lock(EntityType::Quote, 1_000, 0).unwrap());
        assert!(!repo.claim_lock(EntityType::Quote, 2_000, 500).unwrap());
        assert_eq!(
            repo.load_lock(EntityType::Quote).unwrap(),
            SyncLockState {
                in_progress: true,
                started_at: Some(1_000),
            }
        );

        // Holder started at or before the stale cutoff
        assert!(repo.claim_lock(EntityType::Quote, 70_000, 1_000).unwrap());
        assert_eq!(
            repo.load_lock(EntityType::Quote).unwrap().started_at,
            Some(70_000)
        );

        repo.save_lock(EntityType::Quote, &SyncLockState::default())
            .unwrap();
        assert!(repo.claim_lock(EntityType::Quote, 71_000, 0).unwrap());
    }

    #[test]
    fn test_integrity_issues_flag_garbage_values() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());
        repo.save_metadata(EntityType::Client, &SyncMetadata::default())
            .unwrap();
        assert!(repo.integrity_issues().unwrap().is_empty());

        db.connection()
            .execute(
                "INSERT INTO sync_metadata (key, value) VALUES
                 ('quote.last_sync_at', 'whenever'),
                 ('gadget.has_migrated', 'true'),
                 ('nonsense', 'x')",
                [],
            )
            .unwrap();

        assert_eq!(repo.integrity_issues().unwrap().len(), 3);
        // The unreadable cursor degrades to "never synced" instead of failing
        assert_eq!(repo.load_metadata(EntityType::Quote).unwrap().last_sync_at, None);
    }

    #[test]
    fn test_app_state_set_get_remove() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSyncStateRepository::new(db.connection());

        repo.set_state("integrity.last_scan_at", "1000").unwrap();
        assert_eq!(
            repo.get_state("integrity.last_scan_at").unwrap().as_deref(),
            Some("1000")
        );
        repo.remove_state("integrity.last_scan_at").unwrap();
        assert_eq!(repo.get_state("integrity.last_scan_at").unwrap(), None);
    }
}
