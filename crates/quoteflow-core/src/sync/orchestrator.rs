//! One reconciliation pass per entity type: tombstones down, changes down,
//! changes up, cursor forward.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::lock::{LockError, SyncLockManager};
use super::mode::SyncMode;
use crate::clock::{duration_millis, SharedClock};
use crate::config::SyncSettings;
use crate::models::{EntityType, RecordId, SyncRecord};
use crate::remote::{RemoteGateway, RemoteQuery, SortOrder};
use crate::services::LocalStore;
use crate::util::{format_timestamp, timestamp_millis};
use crate::{Error, Result};

/// Why a requested pass did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LockHeld,
    CoolingDown,
    Disabled,
    AlreadyMigrated,
}

/// Outcome of one sync, migration, or purge invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entity: EntityType,
    pub downloaded: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub duplicates_merged: usize,
    pub failed: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReport {
    pub const fn new(entity: EntityType) -> Self {
        Self {
            entity,
            downloaded: 0,
            uploaded: 0,
            deleted: 0,
            duplicates_merged: 0,
            failed: 0,
            success: false,
            skipped: None,
            error: None,
        }
    }

    fn skipped(entity: EntityType, reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::new(entity)
        }
    }

    fn failed_with(entity: EntityType, error: &crate::Error) -> Self {
        let mut report = Self::new(entity);
        report.error = Some(error.to_string());
        report
    }

    pub const fn changed_anything(&self) -> bool {
        self.downloaded + self.uploaded + self.deleted + self.duplicates_merged > 0
    }
}

#[derive(Debug, Default)]
struct PassState {
    /// Ids the pull phase wrote from remote data; the remote already holds
    /// these versions, so the push phase leaves them alone
    settled: HashSet<RecordId>,
    /// Set when the incremental ceiling cut the pull short
    resume_from: Option<String>,
}

/// Drives sync passes for every entity type against one gateway.
#[derive(Debug)]
pub struct SyncEngine<G> {
    store: LocalStore,
    gateway: G,
    locks: SyncLockManager,
    settings: SyncSettings,
    clock: SharedClock,
}

impl<G: RemoteGateway> SyncEngine<G> {
    pub fn new(store: LocalStore, gateway: G, settings: SyncSettings) -> Self {
        let clock = store.clock().clone();
        let locks = SyncLockManager::new(
            store.clone(),
            settings.lock_stale_after(),
            settings.cooldown(),
        );
        Self {
            store,
            gateway,
            locks,
            settings,
            clock,
        }
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Run one pass for `entity`.
    ///
    /// Never returns an error: failures land in the report.
    pub async fn sync(&self, entity: EntityType) -> SyncReport {
        let metadata = match self.store.sync_metadata(entity).await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!("Could not read {} sync metadata: {}", entity, error);
                return SyncReport::failed_with(entity, &error);
            }
        };
        if !metadata.sync_enabled {
            tracing::debug!("Sync disabled for {}", entity);
            return SyncReport::skipped(entity, SkipReason::Disabled);
        }

        if let Some(report) = self.gate(entity, true).await {
            return report;
        }

        let mut report = SyncReport::new(entity);
        let outcome = self.run_pass(entity, &mut report).await;
        if let Err(error) = self.locks.release(entity).await {
            tracing::warn!("Failed to release {} sync lock: {}", entity, error);
        }

        match outcome {
            Ok(()) => report.success = true,
            Err(error) => {
                tracing::warn!("{} sync failed: {}", entity, error);
                report.error = Some(error.to_string());
            }
        }
        report
    }

    /// Run a pass for every entity type, one after another.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(EntityType::ALL.len());
        for entity in EntityType::ALL {
            reports.push(self.sync(entity).await);
        }
        reports
    }

    /// Cooldown and lock checks. `Some` means the caller must stop.
    async fn gate(&self, entity: EntityType, with_cooldown: bool) -> Option<SyncReport> {
        let check = if with_cooldown {
            self.locks.check_cooldown(entity).await
        } else {
            Ok(())
        };
        let check = match check {
            Ok(()) => self.locks.try_acquire(entity).await,
            Err(error) => Err(error),
        };

        match check {
            Ok(()) => None,
            Err(LockError::InProgress(_)) => {
                tracing::debug!("{} sync already in progress", entity);
                Some(SyncReport::skipped(entity, SkipReason::LockHeld))
            }
            Err(LockError::CoolingDown { remaining, .. }) => {
                tracing::debug!("{} sync cooling down for {:?}", entity, remaining);
                Some(SyncReport::skipped(entity, SkipReason::CoolingDown))
            }
            Err(LockError::Store(error)) => {
                tracing::warn!("Could not take {} sync lock: {}", entity, error);
                Some(SyncReport::failed_with(entity, &error))
            }
        }
    }

    async fn run_pass(&self, entity: EntityType, report: &mut SyncReport) -> Result<()> {
        let metadata = self.store.sync_metadata(entity).await?;
        let mode = SyncMode::from_cursor(metadata.last_sync_at);
        tracing::debug!("Starting {} sync ({})", entity, mode);

        let mut state = PassState::default();
        self.pull_tombstones(entity, &mode, &mut state, report).await?;
        self.pull_changes(entity, &mode, &mut state, report).await?;
        self.push_changes(entity, &mode, &state, report).await?;

        // Item failures do not hold the cursor back; pending uploads are
        // retried on every pass
        let cursor = state
            .resume_from
            .take()
            .unwrap_or_else(|| self.clock.now_rfc3339());
        self.store
            .update_sync_metadata(entity, move |metadata| {
                metadata.last_sync_at = Some(cursor);
            })
            .await?;

        tracing::info!(
            "Synced {}: {} down, {} up, {} deleted, {} merged, {} failed",
            entity,
            report.downloaded,
            report.uploaded,
            report.deleted,
            report.duplicates_merged,
            report.failed
        );
        Ok(())
    }

    async fn pull_tombstones(
        &self,
        entity: EntityType,
        mode: &SyncMode,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let Some(ids) = self
            .gateway
            .download_deleted_ids_since(entity, mode.cursor())
            .await
        else {
            return Err(Error::Remote(format!("could not download {entity} tombstones")));
        };

        for id in ids {
            let Some(local) = self.store.get_by_id(entity, &id).await? else {
                continue;
            };
            if local.is_deleted() {
                continue;
            }
            if self.store.soft_delete(entity, &id).await? {
                tracing::debug!("Applied remote tombstone for {} {}", entity, id);
                self.store.mark_synced(entity, &id).await?;
                state.settled.insert(id);
                report.deleted += 1;
            }
        }
        Ok(())
    }

    /// Initial passes take the newest records up to a limit. Incremental
    /// passes walk forward from the cursor, oldest first, page by page.
    fn download_query(&self, entity: EntityType, mode: &SyncMode) -> RemoteQuery {
        match mode {
            SyncMode::Initial => RemoteQuery::new(entity, self.settings.initial_download_limit)
                .page_size(self.settings.remote_page_size),
            SyncMode::Incremental(cursor) => {
                RemoteQuery::new(entity, self.settings.incremental_pass_limit)
                    .since(Some(cursor))
                    .page_size(self.settings.incremental_page_size)
                    .order(SortOrder::UpdatedAsc)
            }
        }
    }

    async fn pull_changes(
        &self,
        entity: EntityType,
        mode: &SyncMode,
        state: &mut PassState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let query = self.download_query(entity, mode);
        let Some(incoming) = self.gateway.download_since(&query).await else {
            return Err(Error::Remote(format!("could not download {entity} changes")));
        };
        if !mode.is_initial() && incoming.len() >= query.limit {
            state.resume_from = resume_cursor(&incoming);
            tracing::info!(
                "{} pull hit the {} record ceiling; resuming from {:?} next pass",
                entity,
                query.limit,
                state.resume_from
            );
        }
        if incoming.is_empty() {
            return Ok(());
        }

        let tombstoned = self.store.locally_deleted_ids(entity).await?;
        let mut dedupe_candidates = if entity.dedupes_by_name() {
            self.store.never_synced(entity).await?
        } else {
            Vec::new()
        };
        let now = self.clock.now_rfc3339();

        let mut downloads = Vec::new();
        let mut merged = HashSet::new();
        let mut remote_duplicates = Vec::new();

        for remote in incoming {
            if tombstoned.contains(&remote.id) {
                tracing::debug!("Ignoring remote {} {}: deleted locally", entity, remote.id);
                continue;
            }

            if let Some(local) = self.store.get_by_id(entity, &remote.id).await? {
                if remote.is_newer_than(&local) {
                    downloads.push(settled_copy(remote, &now));
                } else {
                    tracing::debug!("Keeping local {} {}: remote is not newer", entity, local.id);
                }
                continue;
            }

            let duplicate = dedupe_candidates
                .iter_mut()
                .find(|local| local.id != remote.id && same_name(local.name(), remote.name()));
            match duplicate {
                Some(local) => {
                    tracing::debug!(
                        "Merging remote {} {} into local {} by name",
                        entity,
                        remote.id,
                        local.id
                    );
                    if remote.is_newer_than(local) {
                        local.body = remote.body.clone();
                    }
                    // The merge is a new write; stamp it so other devices' cursors see it
                    local.updated_at.clone_from(&now);
                    merged.insert(local.id);
                    remote_duplicates.push(remote);
                    report.duplicates_merged += 1;
                }
                None => downloads.push(settled_copy(remote, &now)),
            }
        }

        let survivors: Vec<_> = dedupe_candidates
            .into_iter()
            .filter(|local| merged.contains(&local.id))
            .collect();

        let saved = self.apply_downloads(&downloads, report).await;
        report.downloaded += saved;
        for survivor in &survivors {
            self.store.save(survivor).await?;
        }
        state.settled.extend(downloads.iter().map(|record| record.id));

        for mut duplicate in remote_duplicates {
            duplicate.mark_deleted(&now);
            if !self.gateway.upload(&duplicate).await {
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Persist downloaded records atomically, falling back to one at a time.
    ///
    /// Returns how many were written.
    async fn apply_downloads(&self, records: &[SyncRecord], report: &mut SyncReport) -> usize {
        if records.is_empty() {
            return 0;
        }
        match self.store.save_batch(records).await {
            Ok(()) => return records.len(),
            Err(error) => {
                tracing::warn!(
                    "Batch save of {} downloads failed, retrying one by one: {}",
                    records.len(),
                    error
                );
            }
        }

        let mut saved = 0;
        for record in records {
            match self.store.save(record).await {
                Ok(()) => saved += 1,
                Err(error) => {
                    tracing::warn!("Could not save downloaded {}: {}", record.id, error);
                    report.failed += 1;
                }
            }
        }
        saved
    }

    async fn push_changes(
        &self,
        entity: EntityType,
        mode: &SyncMode,
        state: &PassState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut candidates = match mode.cursor() {
            None => self.store.all_active(entity).await?,
            Some(cursor) => self.store.modified_since(entity, cursor).await?,
        };
        // Earlier failures and offline edits the cursor has already passed
        let listed: HashSet<_> = candidates.iter().map(|record| record.id).collect();
        candidates.extend(
            self.store
                .pending_upload(entity)
                .await?
                .into_iter()
                .filter(|record| !listed.contains(&record.id)),
        );
        candidates.retain(|record| !state.settled.contains(&record.id));
        if candidates.is_empty() {
            return Ok(());
        }

        let ids: Vec<_> = candidates.iter().map(|record| record.id).collect();
        let Some(versions) = self.gateway.fetch_versions(entity, &ids).await else {
            tracing::warn!("Skipping {} upload: remote versions unavailable", entity);
            return Ok(());
        };

        for record in candidates {
            if !needs_upload(&record, &versions) {
                continue;
            }
            if self.gateway.upload(&record).await {
                self.store.mark_synced(entity, &record.id).await?;
                report.uploaded += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Upload every local record once, so data created before sign-in reaches
    /// the cloud. Only a fully successful run is remembered.
    pub async fn migrate_local_to_cloud(&self, entity: EntityType) -> SyncReport {
        match self.store.sync_metadata(entity).await {
            Ok(metadata) if metadata.has_migrated => {
                return SyncReport::skipped(entity, SkipReason::AlreadyMigrated);
            }
            Ok(_) => {}
            Err(error) => return SyncReport::failed_with(entity, &error),
        }
        if let Some(report) = self.gate(entity, false).await {
            return report;
        }

        let mut report = SyncReport::new(entity);
        let outcome = self.run_migration(entity, &mut report).await;
        if let Err(error) = self.locks.release(entity).await {
            tracing::warn!("Failed to release {} sync lock: {}", entity, error);
        }

        match outcome {
            Ok(()) => report.success = report.failed == 0,
            Err(error) => report.error = Some(error.to_string()),
        }
        report
    }

    async fn run_migration(&self, entity: EntityType, report: &mut SyncReport) -> Result<()> {
        for record in self.store.all_records(entity).await? {
            if self.gateway.upload(&record).await {
                self.store.mark_synced(entity, &record.id).await?;
                report.uploaded += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.failed == 0 {
            self.store
                .update_sync_metadata(entity, |metadata| metadata.has_migrated = true)
                .await?;
            tracing::info!("Migrated {} {} records to the cloud", report.uploaded, entity);
        } else {
            tracing::warn!(
                "{} migration incomplete: {} uploads failed",
                entity,
                report.failed
            );
        }
        Ok(())
    }

    /// Hard-delete tombstones older than the retention window, remote first.
    pub async fn purge_tombstones(&self, entity: EntityType) -> SyncReport {
        if let Some(report) = self.gate(entity, false).await {
            return report;
        }

        let mut report = SyncReport::new(entity);
        let cutoff_ms =
            self.clock.now_millis() - duration_millis(self.settings.tombstone_retention());
        let outcome = self.store.purge_deleted_before(entity, cutoff_ms).await;

        if let Ok(ids) = &outcome {
            for id in ids {
                if self.gateway.delete(entity, id).await {
                    report.deleted += 1;
                } else {
                    report.failed += 1;
                }
            }
            tracing::info!("Purged {} {} tombstones", ids.len(), entity);
        }

        if let Err(error) = self.locks.release(entity).await {
            tracing::warn!("Failed to release {} sync lock: {}", entity, error);
        }
        match outcome {
            Ok(_) => report.success = report.failed == 0,
            Err(error) => report.error = Some(error.to_string()),
        }
        report
    }

    pub async fn set_sync_enabled(&self, entity: EntityType, enabled: bool) -> Result<()> {
        self.store
            .update_sync_metadata(entity, move |metadata| metadata.sync_enabled = enabled)
            .await?;
        tracing::info!(
            "Sync {} for {}",
            if enabled { "enabled" } else { "disabled" },
            entity
        );
        Ok(())
    }

    /// Forget every cursor so the next pass for each type is an initial sync.
    pub async fn reset_cursors(&self) -> Result<()> {
        for entity in EntityType::ALL {
            self.store
                .update_sync_metadata(entity, |metadata| metadata.last_sync_at = None)
                .await?;
        }
        Ok(())
    }
}

/// Cursor for a pull cut short by the ceiling, given records oldest first.
///
/// Lands just before the newest timestamp taken, so records sharing that
/// timestamp are fetched again rather than skipped.
fn resume_cursor(records: &[SyncRecord]) -> Option<String> {
    let last_ms = records.last()?.updated_at_millis();
    let resume_ms = records
        .iter()
        .rev()
        .map(SyncRecord::updated_at_millis)
        .find(|updated_ms| *updated_ms < last_ms)
        .unwrap_or(last_ms);
    Some(format_timestamp(resume_ms))
}

fn settled_copy(mut record: SyncRecord, now: &str) -> SyncRecord {
    record.synced_at = Some(now.to_string());
    record
}

fn same_name(left: &str, right: &str) -> bool {
    let left = left.trim();
    !left.is_empty() && left.to_lowercase() == right.trim().to_lowercase()
}

/// Local copy must be strictly newer than the remote one, or the remote
/// must not have it. Local-only tombstones have nothing to propagate.
fn needs_upload(record: &SyncRecord, versions: &HashMap<RecordId, String>) -> bool {
    match versions.get(&record.id) {
        None => !record.is_deleted(),
        Some(remote_updated_at) => {
            record.updated_at_millis() > timestamp_millis(Some(remote_updated_at))
        }
    }
}
