//! Startup safety net: crash-loop detection, throttled corruption scans,
//! and recovery from the cloud or from scratch.

mod launch;

use serde::Serialize;

use crate::clock::{duration_millis, SharedClock};
use crate::config::SyncSettings;
use crate::models::EntityType;
use crate::remote::RemoteGateway;
use crate::services::LocalStore;
use crate::sync::{SyncEngine, SyncReport};
use crate::util::timestamp_millis;
use crate::Result;

pub use launch::{LaunchState, LaunchTracker};

const LAST_SCAN_KEY: &str = "integrity.last_scan_at";
const RECOVERY_STARTED_KEY: &str = "integrity.recovery_started_at";

/// Which path startup checks took
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartupOutcome {
    Healthy {
        scanned: bool,
    },
    /// Too many launches without a healthy run; every local table was wiped
    NuclearReset {
        launches: u32,
    },
    /// Corrupt data replaced by a fresh initial sync
    CloudRecovered {
        issues: Vec<String>,
        reports: Vec<SyncReport>,
    },
    /// Corrupt data dropped; no signed-in identity to restore from
    LocalDataCleared {
        issues: Vec<String>,
    },
    /// Local data was dropped but the cloud restore did not complete; the
    /// recovery flag stays set and the next launch resumes it
    RecoveryPending {
        issues: Vec<String>,
        reports: Vec<SyncReport>,
    },
    /// Another recovery started recently and has not finished
    RecoveryInProgress,
}

#[derive(Debug)]
pub struct IntegrityMonitor {
    store: LocalStore,
    launches: LaunchTracker,
    settings: SyncSettings,
    clock: SharedClock,
    started_at_ms: i64,
}

impl IntegrityMonitor {
    pub fn new(store: LocalStore, launches: LaunchTracker, settings: SyncSettings) -> Self {
        let clock = store.clock().clone();
        let started_at_ms = clock.now_millis();
        Self {
            store,
            launches,
            settings,
            clock,
            started_at_ms,
        }
    }

    pub fn launch_state(&self) -> LaunchState {
        self.launches.load()
    }

    /// Count this launch. Call once per process start.
    pub fn record_launch(&self) -> Result<LaunchState> {
        let mut state = self.launches.load();
        state.consecutive_launches = state.consecutive_launches.saturating_add(1);
        state.last_launch_at = Some(self.clock.now_rfc3339());
        self.launches.save(&state)?;
        Ok(state)
    }

    /// The app reached a known-good point; clear the crash counter.
    pub fn mark_healthy(&self) -> Result<()> {
        let mut state = self.launches.load();
        state.consecutive_launches = 0;
        state.last_stable_at = Some(self.clock.now_rfc3339());
        self.launches.save(&state)
    }

    /// Mark healthy once the process has been up for the stable-run window.
    ///
    /// Returns whether the counter was cleared.
    pub fn confirm_stable_run(&self) -> Result<bool> {
        let uptime = self.clock.now_millis() - self.started_at_ms;
        if uptime < duration_millis(self.settings.stable_run_after()) {
            return Ok(false);
        }
        self.mark_healthy()?;
        Ok(true)
    }

    /// Launch bookkeeping plus, when due, a corruption scan and recovery.
    ///
    /// Pass the sync engine when a signed-in identity exists; without one,
    /// corrupt data is cleared instead of restored.
    pub async fn run_startup_checks<G: RemoteGateway>(
        &self,
        engine: Option<&SyncEngine<G>>,
    ) -> Result<StartupOutcome> {
        let launch = self.record_launch()?;
        if launch.consecutive_launches >= self.settings.crash_loop_threshold {
            return self.nuclear_reset(launch.consecutive_launches).await;
        }

        match self.recovery_started_at().await {
            Some(started_ms) if self.is_recovery_live(started_ms) => {
                tracing::info!("Recovery already in progress; skipping integrity scan");
                return Ok(StartupOutcome::RecoveryInProgress);
            }
            Some(_) => {
                tracing::warn!("Resuming interrupted recovery");
                return self.resume_recovery(engine).await;
            }
            None => {}
        }

        if !self.scan_due().await {
            return Ok(StartupOutcome::Healthy { scanned: false });
        }

        let issues = self.scan().await;
        if issues.is_empty() {
            self.record_scan().await;
            return Ok(StartupOutcome::Healthy { scanned: true });
        }

        tracing::warn!("Local store failed integrity scan: {}", issues.join("; "));
        self.recover(engine, issues).await
    }

    /// Run the corruption scan now, ignoring the throttle.
    ///
    /// A store too damaged to query reports that failure as its only issue.
    pub async fn scan(&self) -> Vec<String> {
        match self.store.integrity_issues().await {
            Ok(issues) => issues,
            Err(error) => vec![format!("integrity check failed: {error}")],
        }
    }

    async fn scan_due(&self) -> bool {
        let Ok(Some(last_scan)) = self.store.app_state(LAST_SCAN_KEY).await else {
            return true;
        };
        let last_scan_ms = timestamp_millis(Some(&last_scan));
        last_scan_ms == 0
            || self.clock.now_millis() - last_scan_ms
                >= duration_millis(self.settings.integrity_scan_interval())
    }

    async fn record_scan(&self) {
        if let Err(error) = self
            .store
            .set_app_state(LAST_SCAN_KEY, &self.clock.now_rfc3339())
            .await
        {
            tracing::warn!("Could not record integrity scan time: {}", error);
        }
    }

    async fn recovery_started_at(&self) -> Option<i64> {
        let raw = self.store.app_state(RECOVERY_STARTED_KEY).await.ok()??;
        Some(timestamp_millis(Some(&raw)))
    }

    fn is_recovery_live(&self, started_ms: i64) -> bool {
        started_ms > 0
            && self.clock.now_millis() - started_ms
                < duration_millis(self.settings.recovery_stale_after())
    }

    async fn nuclear_reset(&self, launches: u32) -> Result<StartupOutcome> {
        tracing::warn!(
            "{} launches without a healthy run; wiping local data",
            launches
        );
        if let Err(error) = self.store.wipe_all().await {
            tracing::warn!("Wipe failed ({}); rebuilding local store", error);
            self.store.rebuild().await?;
        }

        let mut state = self.launches.load();
        state.consecutive_launches = 0;
        self.launches.save(&state)?;
        Ok(StartupOutcome::NuclearReset { launches })
    }

    /// Drop entity rows, replacing the whole file when rows cannot be deleted.
    async fn clear_entities(&self) -> Result<()> {
        if let Err(error) = self.store.wipe_entities().await {
            tracing::warn!("Wipe failed ({}); rebuilding local store", error);
            self.store.rebuild().await?;
        }
        Ok(())
    }

    async fn recover<G: RemoteGateway>(
        &self,
        engine: Option<&SyncEngine<G>>,
        issues: Vec<String>,
    ) -> Result<StartupOutcome> {
        let Some(engine) = engine else {
            tracing::warn!("No signed-in identity; clearing corrupt local data");
            if let Err(error) = self.store.wipe_all().await {
                tracing::warn!("Wipe failed ({}); rebuilding local store", error);
                self.store.rebuild().await?;
            }
            self.record_scan().await;
            return Ok(StartupOutcome::LocalDataCleared { issues });
        };

        // The flag goes down before anything is dropped so a crash mid-wipe
        // is resumed on the next launch.
        tracing::warn!("Restoring local data from the cloud");
        self.store
            .set_app_state(RECOVERY_STARTED_KEY, &self.clock.now_rfc3339())
            .await?;
        engine.reset_cursors().await?;
        self.clear_entities().await?;

        self.restore(engine, issues).await
    }

    /// Pick up a recovery whose flag outlived the stale window.
    ///
    /// A store that still scans dirty is wiped again; a clean one only needs
    /// the cloud download finished.
    async fn resume_recovery<G: RemoteGateway>(
        &self,
        engine: Option<&SyncEngine<G>>,
    ) -> Result<StartupOutcome> {
        let mut issues = self.scan().await;
        if !issues.is_empty() {
            return self.recover(engine, issues).await;
        }

        issues.push("interrupted recovery".to_string());
        match engine {
            Some(engine) => self.restore(engine, issues).await,
            None => {
                tracing::warn!("No signed-in identity; recovery stays pending");
                Ok(StartupOutcome::RecoveryPending {
                    issues,
                    reports: Vec::new(),
                })
            }
        }
    }

    /// Initial-sync every entity, clearing the recovery flag only when each
    /// pass completed.
    async fn restore<G: RemoteGateway>(
        &self,
        engine: &SyncEngine<G>,
        issues: Vec<String>,
    ) -> Result<StartupOutcome> {
        let mut reports = Vec::with_capacity(EntityType::ALL.len());
        for (index, entity) in EntityType::ALL.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.recovery_pause()).await;
            }
            reports.push(engine.sync(entity).await);
        }

        let restored = reports.iter().map(|report| report.downloaded).sum::<usize>();
        if reports.iter().any(|report| report.error.is_some()) {
            tracing::warn!(
                "Cloud recovery incomplete ({} records restored); retrying next launch",
                restored
            );
            return Ok(StartupOutcome::RecoveryPending { issues, reports });
        }

        self.store.remove_app_state(RECOVERY_STARTED_KEY).await?;
        self.record_scan().await;
        tracing::info!("Cloud recovery finished: {} records restored", restored);
        Ok(StartupOutcome::CloudRecovered { issues, reports })
    }
}

#[cfg(test)]
mod tests;
