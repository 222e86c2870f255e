//! Shared local store service used by the sync engine and clients.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::{SharedClock, SystemClock};
use crate::db::{
    Database, ListFilter, RecordRepository, SqliteRecordRepository, SqliteSyncStateRepository,
    SyncStateRepository,
};
use crate::models::{EntityBody, EntityType, RecordId, SyncLockState, SyncMetadata, SyncRecord};
use crate::util::timestamp_millis;
use crate::{Error, Result};

/// Thread-safe handle to the on-device store.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    clock: SharedClock,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LocalStore")
            .field("db_path", &self.db_path)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open a store at the given filesystem path.
    ///
    /// A file SQLite refuses to read is moved aside and replaced by a fresh store.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path) {
            Ok(db) => db,
            Err(error) if error.is_corrupted_database() => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path)?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            clock: Arc::new(SystemClock),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` for every timestamp this store writes.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale store sidecar {}", path.display());
            }
        }

        Ok(())
    }

    /// Replace the store with an empty one.
    ///
    /// File-backed stores are moved aside and reopened, which also works when
    /// the file is too damaged to run `DELETE` against. In-memory stores are wiped.
    pub async fn rebuild(&self) -> Result<()> {
        let mut db = self.db.lock().await;
        let Some(db_path) = self.db_path.clone() else {
            let repo = SqliteRecordRepository::new(db.connection());
            repo.wipe_entities()?;
            return SqliteSyncStateRepository::new(db.connection()).wipe();
        };

        // Release the file handle before renaming it
        let placeholder = Database::open_in_memory()?;
        drop(std::mem::replace(&mut *db, placeholder));

        Self::quarantine_corrupted_db_files(&db_path)?;
        *db = Database::open(&db_path)?;
        Ok(())
    }

    // ----- records -----

    /// List one page of records.
    pub async fn list(&self, entity: EntityType, filter: &ListFilter) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).list(entity, filter)
    }

    /// Fetch a record by id (tombstoned records included).
    pub async fn get_by_id(&self, entity: EntityType, id: &RecordId) -> Result<Option<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).get(entity, id)
    }

    /// Create a record stamped with the store clock.
    pub async fn create(&self, body: EntityBody) -> Result<SyncRecord> {
        if body.name().trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} name cannot be empty",
                body.entity_type()
            )));
        }
        let record = SyncRecord::new(body, &self.clock.now_rfc3339());
        self.save(&record).await?;
        Ok(record)
    }

    /// Replace an active record's body, bumping `updated_at`.
    pub async fn update(&self, id: &RecordId, body: EntityBody) -> Result<SyncRecord> {
        let entity = body.entity_type();
        let db = self.db.lock().await;
        let repo = SqliteRecordRepository::new(db.connection());

        let mut record = repo
            .get(entity, id)?
            .filter(|record| !record.is_deleted())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.update_body(body, &self.clock.now_rfc3339());
        repo.save(&record)?;
        Ok(record)
    }

    /// Insert or replace a record by id.
    pub async fn save(&self, record: &SyncRecord) -> Result<()> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).save(record)
    }

    /// Insert or replace records in one transaction.
    pub async fn save_batch(&self, records: &[SyncRecord]) -> Result<()> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).save_batch(records)
    }

    /// Tombstone a record; `false` when it was already deleted.
    pub async fn soft_delete(&self, entity: EntityType, id: &RecordId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).soft_delete(
            entity,
            id,
            &self.clock.now_rfc3339(),
        )
    }

    /// Records (tombstones included) updated strictly after `cursor`, oldest first.
    pub async fn modified_since(&self, entity: EntityType, cursor: &str) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection())
            .modified_since(entity, timestamp_millis(Some(cursor)))
    }

    /// Ids of every locally tombstoned record.
    pub async fn locally_deleted_ids(&self, entity: EntityType) -> Result<HashSet<RecordId>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).locally_deleted_ids(entity)
    }

    /// Active records never confirmed against the cloud.
    pub async fn never_synced(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).never_synced(entity)
    }

    /// Records changed since their last confirmed upload.
    pub async fn pending_upload(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).pending_upload(entity)
    }

    /// Every active record of a type.
    pub async fn all_active(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        let repo = SqliteRecordRepository::new(db.connection());
        let total = repo.count(entity, false)?;
        repo.list(entity, &ListFilter::page(total, 0))
    }

    /// Every record of a type, tombstones included.
    pub async fn all_records(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let db = self.db.lock().await;
        let repo = SqliteRecordRepository::new(db.connection());
        let total = repo.count(entity, true)?;
        repo.list(entity, &ListFilter::page(total, 0).with_deleted())
    }

    /// Stamp a record as matching its remote copy.
    pub async fn mark_synced(&self, entity: EntityType, id: &RecordId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).mark_synced(
            entity,
            id,
            &self.clock.now_rfc3339(),
        )
    }

    /// Physically remove tombstones last touched before `cutoff_ms`.
    pub async fn purge_deleted_before(
        &self,
        entity: EntityType,
        cutoff_ms: i64,
    ) -> Result<Vec<RecordId>> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).purge_deleted_before(entity, cutoff_ms)
    }

    pub async fn count(&self, entity: EntityType, include_deleted: bool) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).count(entity, include_deleted)
    }

    // ----- sync bookkeeping -----

    pub async fn sync_metadata(&self, entity: EntityType) -> Result<SyncMetadata> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).load_metadata(entity)
    }

    /// Load, modify, and save metadata under one lock.
    pub async fn update_sync_metadata(
        &self,
        entity: EntityType,
        update: impl FnOnce(&mut SyncMetadata) + Send,
    ) -> Result<SyncMetadata> {
        let db = self.db.lock().await;
        let repo = SqliteSyncStateRepository::new(db.connection());
        let mut metadata = repo.load_metadata(entity)?;
        update(&mut metadata);
        repo.save_metadata(entity, &metadata)?;
        Ok(metadata)
    }

    pub async fn sync_lock(&self, entity: EntityType) -> Result<SyncLockState> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).load_lock(entity)
    }

    pub async fn save_sync_lock(&self, entity: EntityType, lock: &SyncLockState) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).save_lock(entity, lock)
    }

    /// Atomically take the persisted lock unless a live holder has it.
    pub async fn claim_sync_lock(
        &self,
        entity: EntityType,
        now_ms: i64,
        stale_before_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).claim_lock(entity, now_ms, stale_before_ms)
    }

    pub async fn app_state(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).get_state(key)
    }

    pub async fn set_app_state(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).set_state(key, value)
    }

    pub async fn remove_app_state(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncStateRepository::new(db.connection()).remove_state(key)
    }

    // ----- integrity -----

    /// Remove every entity row, keeping sync bookkeeping.
    pub async fn wipe_entities(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).wipe_entities()
    }

    /// Remove every row of every table except the schema version.
    pub async fn wipe_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        SqliteRecordRepository::new(db.connection()).wipe_entities()?;
        SqliteSyncStateRepository::new(db.connection()).wipe()
    }

    /// Structural and row-level problems; empty when the store is healthy.
    pub async fn integrity_issues(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut issues = db.quick_check()?;
        if !issues.is_empty() {
            // Row decoding on a structurally damaged file is meaningless
            return Ok(issues);
        }

        let records = SqliteRecordRepository::new(db.connection());
        for entity in EntityType::ALL {
            issues.extend(records.integrity_issues(entity)?);
        }
        issues.extend(SqliteSyncStateRepository::new(db.connection()).integrity_issues()?);
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Client;

    const JAN_1_2024: i64 = 1_704_067_200_000;

    #[tokio::test(flavor = "multi_thread")]
    async fn create_uses_store_clock() {
        let store = LocalStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(JAN_1_2024)));

        let record = store
            .create(EntityBody::Client(Client::new("Acme")))
            .await
            .unwrap();
        assert_eq!(record.created_at, "2024-01-01T00:00:00.000Z");
        assert_eq!(record.updated_at, record.created_at);

        let listed = store.list(EntityType::Client, &ListFilter::page(10, 0)).await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_rejects_blank_name() {
        let store = LocalStore::open_in_memory().unwrap();
        let error = store
            .create(EntityBody::Client(Client::new("   ")))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_refuses_tombstoned_record() {
        let store = LocalStore::open_in_memory().unwrap();
        let record = store
            .create(EntityBody::Client(Client::new("Acme")))
            .await
            .unwrap();
        store.soft_delete(EntityType::Client, &record.id).await.unwrap();

        let error = store
            .update(&record.id, EntityBody::Client(Client::new("Acme 2")))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wipe_all_clears_records_and_bookkeeping() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .create(EntityBody::Client(Client::new("Acme")))
            .await
            .unwrap();
        store
            .update_sync_metadata(EntityType::Client, |metadata| {
                metadata.last_sync_at = Some("2024-01-01T00:00:00.000Z".to_string());
            })
            .await
            .unwrap();
        store.set_app_state("k", "v").await.unwrap();

        store.wipe_all().await.unwrap();

        assert_eq!(store.count(EntityType::Client, true).await.unwrap(), 0);
        assert_eq!(
            store.sync_metadata(EntityType::Client).await.unwrap(),
            SyncMetadata::default()
        );
        assert_eq!(store.app_state("k").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn integrity_issues_empty_for_fresh_store() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .create(EntityBody::Client(Client::new("Acme")))
            .await
            .unwrap();
        assert!(store.integrity_issues().await.unwrap().is_empty());
    }

    #[test]
    fn open_path_quarantines_unreadable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("quoteflow.db");
        let wal_path = tmp.path().join("quoteflow.db-wal");
        std::fs::write(&db_path, vec![0x42_u8; 8192]).unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();

        let store = LocalStore::open_path(&db_path).unwrap();
        assert_eq!(store.path(), Some(db_path.as_path()));

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("quoteflow.db.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rebuild_file_store_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::open_path(tmp.path().join("quoteflow.db")).unwrap();
        store
            .create(EntityBody::Client(Client::new("Acme")))
            .await
            .unwrap();

        store.rebuild().await.unwrap();

        assert_eq!(store.count(EntityType::Client, true).await.unwrap(), 0);
        assert!(store.integrity_issues().await.unwrap().is_empty());
    }
}
