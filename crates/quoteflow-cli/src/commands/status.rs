use quoteflow_core::EntityType;
use serde::Serialize;

use crate::commands::common::{last_sync_label, App};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct EntityStatus {
    entity: EntityType,
    active: usize,
    deleted: usize,
    pending_upload: usize,
    last_sync_at: Option<String>,
    sync_enabled: bool,
    has_migrated: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    database: Option<String>,
    sync_configured: bool,
    user_id: Option<String>,
    consecutive_launches: u32,
    entities: Vec<EntityStatus>,
}

pub async fn run_status(app: &App, as_json: bool) -> Result<(), CliError> {
    let mut entities = Vec::with_capacity(EntityType::ALL.len());
    for entity in EntityType::ALL {
        let total = app.store.count(entity, true).await?;
        let active = app.store.count(entity, false).await?;
        let pending_upload = app.store.pending_upload(entity).await?.len();
        let metadata = app.store.sync_metadata(entity).await?;
        entities.push(EntityStatus {
            entity,
            active,
            deleted: total.saturating_sub(active),
            pending_upload,
            last_sync_at: metadata.last_sync_at,
            sync_enabled: metadata.sync_enabled,
            has_migrated: metadata.has_migrated,
        });
    }

    let report = StatusReport {
        database: app.store.path().map(|path| path.display().to_string()),
        sync_configured: app.engine.is_some(),
        user_id: app.user_id.clone(),
        consecutive_launches: app.monitor.launch_state().consecutive_launches,
        entities,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(database) = &report.database {
        println!("Database: {database}");
    }
    if report.sync_configured {
        println!(
            "Sync: signed in as {}",
            report.user_id.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("Sync: not configured (local only)");
    }
    println!();

    let now_ms = app.store.clock().now_millis();
    println!(
        "{:<17} {:>7} {:>8} {:>8}  {:<12} state",
        "entity", "active", "deleted", "pending", "last sync"
    );
    for status in &report.entities {
        let state = if status.sync_enabled {
            "enabled"
        } else {
            "disabled"
        };
        println!(
            "{:<17} {:>7} {:>8} {:>8}  {:<12} {state}",
            status.entity.table(),
            status.active,
            status.deleted,
            status.pending_upload,
            last_sync_label(status.last_sync_at.as_deref(), now_ms),
        );
    }
    Ok(())
}
