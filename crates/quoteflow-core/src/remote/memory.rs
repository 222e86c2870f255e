//! Process-local gateway: a shared remote store for tests and offline demos.
//!
//! Clones share the same rows, so two engines holding clones behave like two
//! devices talking to one cloud project.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    fetch_paginated, RemoteError, RemoteGateway, RemoteQuery, RemoteResult, SortOrder,
};
use crate::models::{EntityType, RecordId, SyncRecord};
use crate::util::timestamp_millis;

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<(EntityType, RecordId), SyncRecord>,
    offline: bool,
    rejected_uploads: HashSet<RecordId>,
    upload_calls: usize,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a row directly, bypassing the upload path
    pub fn insert_remote(&self, record: SyncRecord) {
        let mut record = record;
        record.synced_at = None;
        self.state()
            .rows
            .insert((record.entity_type(), record.id), record);
    }

    pub fn remote_record(&self, entity: EntityType, id: &RecordId) -> Option<SyncRecord> {
        self.state().rows.get(&(entity, *id)).cloned()
    }

    /// Every stored row of `entity`, tombstones included, oldest first
    pub fn remote_records(&self, entity: EntityType) -> Vec<SyncRecord> {
        let mut records: Vec<_> = self
            .state()
            .rows
            .values()
            .filter(|record| record.entity_type() == entity)
            .cloned()
            .collect();
        records.sort_by_key(SyncRecord::updated_at_millis);
        records
    }

    /// Simulate losing connectivity; every call fails while set
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make uploads of one record fail
    pub fn reject_uploads_for(&self, id: RecordId) {
        self.state().rejected_uploads.insert(id);
    }

    /// Number of upload attempts seen, successful or not
    pub fn upload_count(&self) -> usize {
        self.state().upload_calls
    }

    fn page(&self, query: &RemoteQuery, offset: usize, limit: usize) -> RemoteResult<Vec<SyncRecord>> {
        let state = self.state();
        if state.offline {
            return Err(RemoteError::Unreachable);
        }
        let cursor_ms = query.cursor.as_deref().map(|cursor| timestamp_millis(Some(cursor)));

        let mut matches: Vec<_> = state
            .rows
            .values()
            .filter(|record| record.entity_type() == query.entity)
            .filter(|record| query.include_deleted || !record.is_deleted())
            .filter(|record| cursor_ms.is_none_or(|cursor| record.updated_at_millis() > cursor))
            .cloned()
            .collect();
        matches.sort_by_key(SyncRecord::updated_at_millis);
        if query.order == SortOrder::UpdatedDesc {
            matches.reverse();
        }

        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }
}

impl RemoteGateway for InMemoryGateway {
    async fn upload(&self, record: &SyncRecord) -> bool {
        let mut state = self.state();
        state.upload_calls += 1;
        if state.offline || state.rejected_uploads.contains(&record.id) {
            tracing::warn!("Upload of {} {} rejected", record.entity_type(), record.id);
            return false;
        }

        let mut stored = record.clone();
        stored.synced_at = None;
        state.rows.insert((stored.entity_type(), stored.id), stored);
        true
    }

    async fn download_since(&self, query: &RemoteQuery) -> Option<Vec<SyncRecord>> {
        let result = fetch_paginated(query, |offset, limit| {
            let page = self.page(query, offset, limit);
            async move { page }
        })
        .await;

        match result {
            Ok(records) => Some(records),
            Err(error) => {
                tracing::warn!("Download of {} failed: {}", query.entity, error);
                None
            }
        }
    }

    async fn download_deleted_ids_since(
        &self,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Option<Vec<RecordId>> {
        let state = self.state();
        if state.offline {
            tracing::warn!("Tombstone download of {} failed: remote unreachable", entity);
            return None;
        }
        let cursor_ms = cursor.map(|cursor| timestamp_millis(Some(cursor)));

        let ids = state
            .rows
            .values()
            .filter(|record| record.entity_type() == entity)
            .filter_map(|record| {
                let deleted_at = record.deleted_at.as_deref()?;
                let deleted_ms = timestamp_millis(Some(deleted_at));
                cursor_ms
                    .is_none_or(|cursor| deleted_ms > cursor)
                    .then_some(record.id)
            })
            .collect();
        Some(ids)
    }

    async fn fetch_versions(
        &self,
        entity: EntityType,
        ids: &[RecordId],
    ) -> Option<HashMap<RecordId, String>> {
        let state = self.state();
        if state.offline {
            return None;
        }
        Some(
            ids.iter()
                .filter_map(|id| {
                    state
                        .rows
                        .get(&(entity, *id))
                        .map(|record| (*id, record.updated_at.clone()))
                })
                .collect(),
        )
    }

    async fn delete(&self, entity: EntityType, id: &RecordId) -> bool {
        let mut state = self.state();
        if state.offline {
            return false;
        }
        state.rows.remove(&(entity, *id));
        true
    }
}
