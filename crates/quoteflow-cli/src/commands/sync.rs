use std::time::Duration;

use quoteflow_core::EntityType;

use crate::commands::common::{print_reports, App};
use crate::error::CliError;

fn selected(entity: Option<EntityType>) -> Vec<EntityType> {
    entity.map_or_else(|| EntityType::ALL.to_vec(), |entity| vec![entity])
}

fn finish(failed: usize) -> Result<(), CliError> {
    if failed == 0 {
        Ok(())
    } else {
        Err(CliError::SyncFailed(failed))
    }
}

pub async fn run_sync(
    app: &App,
    entity: Option<EntityType>,
    as_json: bool,
) -> Result<(), CliError> {
    let engine = app.sync_engine()?;
    let reports = match entity {
        Some(entity) => vec![engine.sync(entity).await],
        None => engine.sync_all().await,
    };
    finish(print_reports(&reports, as_json)?)
}

/// Sync on a fixed interval until Ctrl-C.
///
/// Failed rounds are printed and retried on the next tick. Once the process
/// has stayed up long enough the launch counter is cleared.
pub async fn run_sync_watch(
    app: &App,
    entity: Option<EntityType>,
    as_json: bool,
    every: Duration,
) -> Result<(), CliError> {
    let engine = app.sync_engine()?;
    loop {
        let reports = match entity {
            Some(entity) => vec![engine.sync(entity).await],
            None => engine.sync_all().await,
        };
        let failed = print_reports(&reports, as_json)?;
        if failed > 0 {
            tracing::warn!("{} sync pass(es) failed; retrying in {:?}", failed, every);
        }
        if app.monitor.confirm_stable_run()? {
            tracing::debug!("Stable run confirmed");
        }

        tokio::select! {
            () = tokio::time::sleep(every) => {}
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
        }
    }
}

pub async fn run_migrate(app: &App, as_json: bool) -> Result<(), CliError> {
    let engine = app.sync_engine()?;
    let mut reports = Vec::with_capacity(EntityType::ALL.len());
    for entity in EntityType::ALL {
        reports.push(engine.migrate_local_to_cloud(entity).await);
    }
    finish(print_reports(&reports, as_json)?)
}

pub async fn run_purge(
    app: &App,
    entity: Option<EntityType>,
    as_json: bool,
) -> Result<(), CliError> {
    let engine = app.sync_engine()?;
    let mut reports = Vec::new();
    for entity in selected(entity) {
        reports.push(engine.purge_tombstones(entity).await);
    }
    finish(print_reports(&reports, as_json)?)
}
