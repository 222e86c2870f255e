use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::{IntegrityMonitor, LaunchTracker, StartupOutcome, RECOVERY_STARTED_KEY};
use crate::clock::{ManualClock, SharedClock};
use crate::config::SyncSettings;
use crate::models::{Client, EntityBody, EntityType, SyncRecord};
use crate::remote::InMemoryGateway;
use crate::services::LocalStore;
use crate::sync::SyncEngine;
use crate::util::format_timestamp;

const JUN_1_2024: i64 = 1_717_200_000_000;

struct Fixture {
    _tmp: TempDir,
    clock: Arc<ManualClock>,
    store: LocalStore,
    monitor: IntegrityMonitor,
}

fn settings() -> SyncSettings {
    SyncSettings {
        recovery_pause_ms: 0,
        ..SyncSettings::default()
    }
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(JUN_1_2024));
    let shared: SharedClock = clock.clone();
    let store = LocalStore::open_path(tmp.path().join("quoteflow.db"))
        .unwrap()
        .with_clock(shared);
    let monitor = IntegrityMonitor::new(
        store.clone(),
        LaunchTracker::new(tmp.path().join("launch-state.json")),
        settings(),
    );
    Fixture {
        _tmp: tmp,
        clock,
        store,
        monitor,
    }
}

/// Damage one stored body behind the store's back
fn corrupt_first_client(db_path: &Path) {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.execute("UPDATE clients SET body = '{\"version\":1,\"kind\":\"cl'", [])
        .unwrap();
}

async fn offline_checks(monitor: &IntegrityMonitor) -> StartupOutcome {
    monitor
        .run_startup_checks::<InMemoryGateway>(None)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn third_unhealthy_launch_wipes_local_data() {
    let fx = fixture();
    fx.store
        .create(EntityBody::Client(Client::new("Acme")))
        .await
        .unwrap();

    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::Healthy { scanned: true }
    );
    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::Healthy { scanned: false }
    );
    assert_eq!(fx.monitor.launch_state().consecutive_launches, 2);

    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::NuclearReset { launches: 3 }
    );
    assert_eq!(fx.store.count(EntityType::Client, true).await.unwrap(), 0);
    assert_eq!(fx.monitor.launch_state().consecutive_launches, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_marker_between_launches_prevents_reset() {
    let fx = fixture();
    fx.store
        .create(EntityBody::Client(Client::new("Acme")))
        .await
        .unwrap();

    for _ in 0..5 {
        offline_checks(&fx.monitor).await;
        fx.monitor.mark_healthy().unwrap();
    }

    assert_eq!(fx.store.count(EntityType::Client, false).await.unwrap(), 1);
    let state = fx.monitor.launch_state();
    assert_eq!(state.consecutive_launches, 0);
    assert_eq!(state.last_stable_at, Some(format_timestamp(JUN_1_2024)));
}

#[tokio::test(flavor = "multi_thread")]
async fn stable_run_needs_minimum_uptime() {
    let fx = fixture();
    fx.monitor.record_launch().unwrap();

    fx.clock.advance(Duration::from_secs(5));
    assert!(!fx.monitor.confirm_stable_run().unwrap());
    assert_eq!(fx.monitor.launch_state().consecutive_launches, 1);

    fx.clock.advance(Duration::from_secs(5));
    assert!(fx.monitor.confirm_stable_run().unwrap());
    assert_eq!(fx.monitor.launch_state().consecutive_launches, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn scan_runs_at_most_once_per_interval() {
    let fx = fixture();

    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::Healthy { scanned: true }
    );
    fx.monitor.mark_healthy().unwrap();

    fx.clock.advance(Duration::from_secs(60 * 60));
    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::Healthy { scanned: false }
    );
    fx.monitor.mark_healthy().unwrap();

    fx.clock.advance(Duration::from_secs(24 * 60 * 60));
    assert_eq!(
        offline_checks(&fx.monitor).await,
        StartupOutcome::Healthy { scanned: true }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn corruption_without_identity_clears_local_data() {
    let fx = fixture();
    fx.store
        .create(EntityBody::Client(Client::new("Acme")))
        .await
        .unwrap();
    corrupt_first_client(fx.store.path().unwrap());

    match offline_checks(&fx.monitor).await {
        StartupOutcome::LocalDataCleared { issues } => {
            assert_eq!(issues.len(), 1);
            assert!(issues[0].starts_with("clients/"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fx.store.count(EntityType::Client, true).await.unwrap(), 0);
    assert!(fx.monitor.scan().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn corruption_with_identity_restores_from_cloud() {
    let fx = fixture();
    let remote = InMemoryGateway::new();
    let backed_up = SyncRecord::new(
        EntityBody::Client(Client::new("Backed Up")),
        "2024-05-01T00:00:00.000Z",
    );
    remote.insert_remote(backed_up.clone());
    let engine = SyncEngine::new(fx.store.clone(), remote, settings());

    fx.store
        .create(EntityBody::Client(Client::new("Local Only")))
        .await
        .unwrap();
    fx.store
        .update_sync_metadata(EntityType::Client, |metadata| {
            metadata.last_sync_at = Some("2024-05-31T00:00:00.000Z".to_string());
        })
        .await
        .unwrap();
    corrupt_first_client(fx.store.path().unwrap());

    match fx.monitor.run_startup_checks(Some(&engine)).await.unwrap() {
        StartupOutcome::CloudRecovered { issues, reports } => {
            assert!(!issues.is_empty());
            assert_eq!(reports.len(), EntityType::ALL.len());
            assert!(reports.iter().all(|report| report.success));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let restored = fx.store.all_active(EntityType::Client).await.unwrap();
    assert_eq!(
        restored.iter().map(|record| record.id).collect::<Vec<_>>(),
        vec![backed_up.id]
    );
    assert_eq!(fx.store.app_state(RECOVERY_STARTED_KEY).await.unwrap(), None);
    assert!(fx.monitor.scan().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn live_recovery_flag_skips_checks_and_stale_flag_resumes() {
    let fx = fixture();
    let remote = InMemoryGateway::new();
    let engine = SyncEngine::new(fx.store.clone(), remote, settings());

    fx.store
        .set_app_state(RECOVERY_STARTED_KEY, &format_timestamp(JUN_1_2024 - 60_000))
        .await
        .unwrap();
    assert_eq!(
        fx.monitor.run_startup_checks(Some(&engine)).await.unwrap(),
        StartupOutcome::RecoveryInProgress
    );

    fx.clock.advance(Duration::from_secs(5 * 60));
    match fx.monitor.run_startup_checks(Some(&engine)).await.unwrap() {
        StartupOutcome::CloudRecovered { issues, .. } => {
            assert_eq!(issues, vec!["interrupted recovery".to_string()]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fx.store.app_state(RECOVERY_STARTED_KEY).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_cloud_leaves_recovery_pending_until_restored() {
    let fx = fixture();
    let remote = InMemoryGateway::new();
    let backed_up = SyncRecord::new(
        EntityBody::Client(Client::new("Backed Up")),
        "2024-05-01T00:00:00.000Z",
    );
    remote.insert_remote(backed_up.clone());
    let engine = SyncEngine::new(fx.store.clone(), remote.clone(), settings());

    fx.store
        .create(EntityBody::Client(Client::new("Local Only")))
        .await
        .unwrap();
    fx.store
        .update_sync_metadata(EntityType::Client, |metadata| {
            metadata.last_sync_at = Some("2024-05-31T00:00:00.000Z".to_string());
        })
        .await
        .unwrap();
    corrupt_first_client(fx.store.path().unwrap());
    remote.set_offline(true);

    match fx.monitor.run_startup_checks(Some(&engine)).await.unwrap() {
        StartupOutcome::RecoveryPending { issues, reports } => {
            assert!(!issues.is_empty());
            assert_eq!(reports.len(), EntityType::ALL.len());
            assert!(reports.iter().all(|report| report.error.is_some()));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(fx
        .store
        .app_state(RECOVERY_STARTED_KEY)
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        fx.store
            .sync_metadata(EntityType::Client)
            .await
            .unwrap()
            .last_sync_at,
        None
    );
    fx.monitor.mark_healthy().unwrap();

    remote.set_offline(false);
    fx.clock.advance(Duration::from_secs(10 * 60));
    match fx.monitor.run_startup_checks(Some(&engine)).await.unwrap() {
        StartupOutcome::CloudRecovered { issues, .. } => {
            assert_eq!(issues, vec!["interrupted recovery".to_string()]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let restored = fx.store.all_active(EntityType::Client).await.unwrap();
    assert_eq!(
        restored.iter().map(|record| record.id).collect::<Vec<_>>(),
        vec![backed_up.id]
    );
    assert_eq!(fx.store.app_state(RECOVERY_STARTED_KEY).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_flag_over_corrupt_store_wipes_and_restores() {
    let fx = fixture();
    let remote = InMemoryGateway::new();
    let backed_up = SyncRecord::new(
        EntityBody::Client(Client::new("Backed Up")),
        "2024-05-01T00:00:00.000Z",
    );
    remote.insert_remote(backed_up.clone());
    let engine = SyncEngine::new(fx.store.clone(), remote, settings());

    fx.store
        .create(EntityBody::Client(Client::new("Half Wiped")))
        .await
        .unwrap();
    fx.store
        .update_sync_metadata(EntityType::Client, |metadata| {
            metadata.last_sync_at = Some("2024-05-31T00:00:00.000Z".to_string());
        })
        .await
        .unwrap();
    corrupt_first_client(fx.store.path().unwrap());
    fx.store
        .set_app_state(RECOVERY_STARTED_KEY, &format_timestamp(JUN_1_2024 - 10 * 60_000))
        .await
        .unwrap();

    match fx.monitor.run_startup_checks(Some(&engine)).await.unwrap() {
        StartupOutcome::CloudRecovered { issues, .. } => {
            assert!(issues[0].starts_with("clients/"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let restored = fx.store.all_active(EntityType::Client).await.unwrap();
    assert_eq!(
        restored.iter().map(|record| record.id).collect::<Vec<_>>(),
        vec![backed_up.id]
    );
    assert!(fx.monitor.scan().await.is_empty());
}
