//! Per-entity mutual exclusion and sync throttling.
//!
//! Two layers guard a pass: an in-process flag, claimed synchronously so two
//! tasks in one process can never both pass, and a persisted lock row that
//! survives restarts. The row is taken with one conditional write, so two
//! processes sharing a database cannot both hold it. A persisted lock older
//! than the stale window is treated as left behind by a crashed pass and
//! reclaimed.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::clock::{duration_millis, SharedClock};
use crate::models::{EntityType, SyncLockState};
use crate::services::LocalStore;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("A {0} sync is already running")]
    InProgress(EntityType),
    #[error("{entity} synced recently; retry in {remaining:?}")]
    CoolingDown {
        entity: EntityType,
        remaining: Duration,
    },
    #[error(transparent)]
    Store(#[from] crate::Error),
}

#[derive(Debug)]
pub struct SyncLockManager {
    store: LocalStore,
    clock: SharedClock,
    stale_after: Duration,
    cooldown: Duration,
    active: Mutex<HashSet<EntityType>>,
}

impl SyncLockManager {
    pub fn new(store: LocalStore, stale_after: Duration, cooldown: Duration) -> Self {
        let clock = store.clock().clone();
        Self {
            store,
            clock,
            stale_after,
            cooldown,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, entity: EntityType) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity)
    }

    fn unclaim(&self, entity: EntityType) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity);
    }

    pub fn is_held_in_process(&self, entity: EntityType) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&entity)
    }

    /// Take the lock for `entity` or report why it is unavailable.
    pub async fn try_acquire(&self, entity: EntityType) -> Result<(), LockError> {
        if !self.claim(entity) {
            return Err(LockError::InProgress(entity));
        }

        match self.acquire_persisted(entity).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.unclaim(entity);
                Err(error)
            }
        }
    }

    async fn acquire_persisted(&self, entity: EntityType) -> Result<(), LockError> {
        let now_ms = self.clock.now_millis();
        let stale_before_ms = now_ms - duration_millis(self.stale_after);
        if !self
            .store
            .claim_sync_lock(entity, now_ms, stale_before_ms)
            .await?
        {
            return Err(LockError::InProgress(entity));
        }
        tracing::debug!("Took {} sync lock at {}", entity, now_ms);
        Ok(())
    }

    /// Drop both lock layers. Safe to call when the lock is not held.
    pub async fn release(&self, entity: EntityType) -> crate::Result<()> {
        self.unclaim(entity);
        self.store
            .save_sync_lock(entity, &SyncLockState::default())
            .await
    }

    /// Reject a pass started within the cooldown window of the last one.
    pub async fn check_cooldown(&self, entity: EntityType) -> Result<(), LockError> {
        let metadata = self.store.sync_metadata(entity).await?;
        let Some(last_sync_ms) = metadata.last_sync_millis() else {
            return Ok(());
        };

        let elapsed = self.clock.now_millis() - last_sync_ms;
        let cooldown = duration_millis(self.cooldown);
        if (0..cooldown).contains(&elapsed) {
            let remaining = u64::try_from(cooldown - elapsed).unwrap_or_default();
            return Err(LockError::CoolingDown {
                entity,
                remaining: Duration::from_millis(remaining),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;

    const START: i64 = 1_704_067_200_000;

    fn manager() -> (SyncLockManager, Arc<ManualClock>, LocalStore) {
        let clock = Arc::new(ManualClock::new(START));
        let store = LocalStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        let manager = SyncLockManager::new(
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        (manager, clock, store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_acquire_fails_until_release() {
        let (manager, _clock, store) = manager();

        manager.try_acquire(EntityType::Quote).await.unwrap();
        assert!(matches!(
            manager.try_acquire(EntityType::Quote).await,
            Err(LockError::InProgress(EntityType::Quote))
        ));
        // Other entity types are independent
        manager.try_acquire(EntityType::Client).await.unwrap();

        manager.release(EntityType::Quote).await.unwrap();
        assert!(!store.sync_lock(EntityType::Quote).await.unwrap().in_progress);
        manager.try_acquire(EntityType::Quote).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persisted_lock_blocks_until_stale() {
        let (manager, clock, store) = manager();
        store
            .save_sync_lock(
                EntityType::Invoice,
                &SyncLockState {
                    in_progress: true,
                    started_at: Some(START - 30_000),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            manager.try_acquire(EntityType::Invoice).await,
            Err(LockError::InProgress(_))
        ));
        assert!(!manager.is_held_in_process(EntityType::Invoice));

        clock.advance(Duration::from_secs(31));
        manager.try_acquire(EntityType::Invoice).await.unwrap();
        let lock = store.sync_lock(EntityType::Invoice).await.unwrap();
        assert_eq!(lock.started_at, Some(START + 31_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persisted_lock_excludes_a_second_process() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("quoteflow.db");
        let clock = Arc::new(ManualClock::new(START));
        let open = || {
            let store = LocalStore::open_path(&db_path)
                .unwrap()
                .with_clock(clock.clone());
            SyncLockManager::new(store, Duration::from_secs(60), Duration::from_secs(5))
        };
        let first = open();
        let second = open();

        first.try_acquire(EntityType::Client).await.unwrap();
        assert!(matches!(
            second.try_acquire(EntityType::Client).await,
            Err(LockError::InProgress(EntityType::Client))
        ));
        assert!(!second.is_held_in_process(EntityType::Client));

        first.release(EntityType::Client).await.unwrap();
        second.try_acquire(EntityType::Client).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_without_start_time_is_stale() {
        let (manager, _clock, store) = manager();
        store
            .save_sync_lock(
                EntityType::Client,
                &SyncLockState {
                    in_progress: true,
                    started_at: None,
                },
            )
            .await
            .unwrap();

        manager.try_acquire(EntityType::Client).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cooldown_rejects_recent_sync() {
        let (manager, clock, store) = manager();
        manager.check_cooldown(EntityType::Quote).await.unwrap();

        store
            .update_sync_metadata(EntityType::Quote, |metadata| {
                metadata.last_sync_at = Some(crate::util::format_timestamp(START));
            })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        match manager.check_cooldown(EntityType::Quote).await {
            Err(LockError::CoolingDown { remaining, .. }) => {
                assert_eq!(remaining, Duration::from_secs(3));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        clock.advance(Duration::from_secs(3));
        manager.check_cooldown(EntityType::Quote).await.unwrap();
    }
}
