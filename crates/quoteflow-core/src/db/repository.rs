//! Record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{EntityBody, EntityType, RecordId, SyncRecord};
use crate::util::timestamp_millis;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

const RECORD_COLUMNS: &str = "id, body, created_at, updated_at, deleted_at, synced_at";

/// Filters for [`RecordRepository::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub limit: usize,
    pub offset: usize,
    /// Include tombstoned rows
    pub include_deleted: bool,
    /// Case-insensitive exact name match
    pub name: Option<String>,
}

impl ListFilter {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Trait for syncable record storage operations
pub trait RecordRepository {
    /// Get a record by ID, tombstoned or not
    fn get(&self, entity: EntityType, id: &RecordId) -> Result<Option<SyncRecord>>;

    /// List records, most recently updated first
    fn list(&self, entity: EntityType, filter: &ListFilter) -> Result<Vec<SyncRecord>>;

    /// Insert or replace a record by id
    fn save(&self, record: &SyncRecord) -> Result<()>;

    /// Insert or replace many records in one transaction
    fn save_batch(&self, records: &[SyncRecord]) -> Result<()>;

    /// Tombstone a record; returns `false` when it was already deleted
    fn soft_delete(&self, entity: EntityType, id: &RecordId, now: &str) -> Result<bool>;

    /// Every record (tombstones included) updated strictly after `cursor_ms`, oldest first
    fn modified_since(&self, entity: EntityType, cursor_ms: i64) -> Result<Vec<SyncRecord>>;

    /// Ids of tombstoned records
    fn locally_deleted_ids(&self, entity: EntityType) -> Result<HashSet<RecordId>>;

    /// Active records that have never been confirmed against the cloud
    fn never_synced(&self, entity: EntityType) -> Result<Vec<SyncRecord>>;

    /// Records (tombstones included) changed since they were last confirmed
    /// against the cloud, or never confirmed at all
    fn pending_upload(&self, entity: EntityType) -> Result<Vec<SyncRecord>>;

    /// Stamp a record as matching its remote copy
    fn mark_synced(&self, entity: EntityType, id: &RecordId, at: &str) -> Result<()>;

    /// Physically remove tombstones last touched before `cutoff_ms`
    fn purge_deleted_before(&self, entity: EntityType, cutoff_ms: i64) -> Result<Vec<RecordId>>;

    /// Count records
    fn count(&self, entity: EntityType, include_deleted: bool) -> Result<usize>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a row selected with `RECORD_COLUMNS`
    fn parse_record(entity: EntityType, row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
        let id: String = row.get(0)?;
        let body: String = row.get(1)?;

        let id = id.parse::<RecordId>().map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error))
        })?;
        let body = EntityBody::decode(entity, &body).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(error))
        })?;

        Ok(SyncRecord {
            id,
            body,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            deleted_at: row.get(4)?,
            synced_at: row.get(5)?,
        })
    }

    fn upsert(conn: &Connection, record: &SyncRecord) -> Result<()> {
        let table = record.entity_type().table();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table}
                 (id, name, body, created_at, updated_at, updated_ms, deleted_at, synced_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                record.id.as_str(),
                record.name(),
                record.body.encode()?,
                record.created_at,
                record.updated_at,
                record.updated_at_millis(),
                record.deleted_at,
                record.synced_at,
            ],
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        entity: EntityType,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SyncRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, |row| Self::parse_record(entity, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Describe every row of `entity` that cannot be read back faithfully
    pub fn integrity_issues(&self, entity: EntityType) -> Result<Vec<String>> {
        let table = entity.table();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, body, created_at, updated_at, updated_ms, deleted_at FROM {table}"
        ))?;
        let mut rows = stmt.query([])?;
        let mut issues = Vec::new();

        while let Some(row) = rows.next()? {
            let id: Option<String> = row.get(0).ok();
            let label = format!("{table}/{}", id.as_deref().unwrap_or("<unreadable id>"));

            if id.as_deref().and_then(|id| id.parse::<RecordId>().ok()).is_none() {
                issues.push(format!("{label}: invalid id"));
            }
            match row.get::<_, String>(1) {
                Ok(body) => {
                    if let Err(error) = EntityBody::decode(entity, &body) {
                        issues.push(format!("{label}: {error}"));
                    }
                }
                Err(error) => issues.push(format!("{label}: unreadable body ({error})")),
            }
            for (index, column) in [(2, "created_at"), (3, "updated_at")] {
                let value: Option<String> = row.get(index).ok();
                if timestamp_millis(value.as_deref()) == 0 {
                    issues.push(format!("{label}: {column} is not a timestamp"));
                }
            }
            if row.get::<_, i64>(4).is_err() {
                issues.push(format!("{label}: updated_ms is not an integer"));
            }
            if let Ok(Some(deleted_at)) = row.get::<_, Option<String>>(5) {
                if timestamp_millis(Some(&deleted_at)) == 0 {
                    issues.push(format!("{label}: deleted_at is not a timestamp"));
                }
            }
        }

        Ok(issues)
    }

    /// Remove every row of every entity table
    pub fn wipe_entities(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for entity in EntityType::ALL {
            tx.execute(&format!("DELETE FROM {}", entity.table()), [])?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, entity: EntityType, id: &RecordId) -> Result<Option<SyncRecord>> {
        let table = entity.table();
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE id = ?"),
                params![id.as_str()],
                |row| Self::parse_record(entity, row),
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self, entity: EntityType, filter: &ListFilter) -> Result<Vec<SyncRecord>> {
        let table = entity.table();
        let sql = format!(
            "SELECT {RECORD_COLUMNS}
             FROM {table}
             WHERE (?1 OR deleted_at IS NULL)
               AND (?2 IS NULL OR name = ?2 COLLATE NOCASE)
             ORDER BY updated_ms DESC, id ASC
             LIMIT ?3 OFFSET ?4"
        );
        self.query_records(
            entity,
            &sql,
            params![
                filter.include_deleted,
                filter.name,
                filter.limit as i64,
                filter.offset as i64
            ],
        )
    }

    fn save(&self, record: &SyncRecord) -> Result<()> {
        Self::upsert(self.conn, record)
    }

    fn save_batch(&self, records: &[SyncRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        for record in records {
            Self::upsert(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn soft_delete(&self, entity: EntityType, id: &RecordId, now: &str) -> Result<bool> {
        let table = entity.table();
        let rows = self.conn.execute(
            &format!(
                "UPDATE {table} SET deleted_at = ?1, updated_at = ?1, updated_ms = ?2
                 WHERE id = ?3 AND deleted_at IS NULL"
            ),
            params![now, timestamp_millis(Some(now)), id.as_str()],
        )?;

        if rows > 0 {
            return Ok(true);
        }
        if self.get(entity, id)?.is_some() {
            Ok(false)
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }

    fn modified_since(&self, entity: EntityType, cursor_ms: i64) -> Result<Vec<SyncRecord>> {
        let table = entity.table();
        self.query_records(
            entity,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {table}
                 WHERE updated_ms > ?
                 ORDER BY updated_ms ASC, id ASC"
            ),
            params![cursor_ms],
        )
    }

    fn locally_deleted_ids(&self, entity: EntityType) -> Result<HashSet<RecordId>> {
        let table = entity.table();
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} WHERE deleted_at IS NOT NULL"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }

    fn never_synced(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let table = entity.table();
        self.query_records(
            entity,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {table}
                 WHERE synced_at IS NULL AND deleted_at IS NULL
                 ORDER BY updated_ms ASC"
            ),
            [],
        )
    }

    fn pending_upload(&self, entity: EntityType) -> Result<Vec<SyncRecord>> {
        let table = entity.table();
        let candidates = self.query_records(
            entity,
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {table}
                 WHERE synced_at IS NULL OR synced_at <> updated_at
                 ORDER BY updated_ms ASC"
            ),
            [],
        )?;
        Ok(candidates
            .into_iter()
            .filter(|record| {
                record.synced_at.as_deref().is_none_or(|synced_at| {
                    timestamp_millis(Some(synced_at)) < record.updated_at_millis()
                })
            })
            .collect())
    }

    fn mark_synced(&self, entity: EntityType, id: &RecordId, at: &str) -> Result<()> {
        let table = entity.table();
        self.conn.execute(
            &format!("UPDATE {table} SET synced_at = ? WHERE id = ?"),
            params![at, id.as_str()],
        )?;
        Ok(())
    }

    fn purge_deleted_before(&self, entity: EntityType, cutoff_ms: i64) -> Result<Vec<RecordId>> {
        let table = entity.table();
        let tx = self.conn.unchecked_transaction()?;
        let ids = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM {table} WHERE deleted_at IS NOT NULL AND updated_ms < ?"
            ))?;
            let ids = stmt
                .query_map(params![cutoff_ms], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        tx.execute(
            &format!("DELETE FROM {table} WHERE deleted_at IS NOT NULL AND updated_ms < ?"),
            params![cutoff_ms],
        )?;
        tx.commit()?;

        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }

    fn count(&self, entity: EntityType, include_deleted: bool) -> Result<usize> {
        let table = entity.table();
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE (? OR deleted_at IS NULL)"),
            params![include_deleted],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
