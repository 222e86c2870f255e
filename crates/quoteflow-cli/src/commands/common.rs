use std::env;
use std::path::{Path, PathBuf};

use quoteflow_core::integrity::{IntegrityMonitor, LaunchTracker, StartupOutcome};
use quoteflow_core::models::LineItem;
use quoteflow_core::remote::{Principal, SupabaseGateway};
use quoteflow_core::services::LocalStore;
use quoteflow_core::sync::{SkipReason, SyncEngine, SyncReport};
use quoteflow_core::util::{compact_text, timestamp_millis};
use quoteflow_core::{EntityBody, EntityType, RecordId, SyncRecord};
use serde::Serialize;

use crate::config::CliConfig;
use crate::error::CliError;

const LAUNCH_STATE_FILE_NAME: &str = "launch-state.json";

/// Everything a command needs: the store, the optional cloud link, and the
/// startup safety net.
pub struct App {
    pub store: LocalStore,
    pub engine: Option<SyncEngine<SupabaseGateway>>,
    pub monitor: IntegrityMonitor,
    pub user_id: Option<String>,
}

impl App {
    pub fn open(db_path: &Path, config: &CliConfig) -> Result<Self, CliError> {
        let store = LocalStore::open_path(db_path)?;
        let monitor = IntegrityMonitor::new(
            store.clone(),
            LaunchTracker::new(launch_state_path(db_path)),
            config.sync.clone(),
        );
        let engine = build_gateway(config)?
            .map(|gateway| SyncEngine::new(store.clone(), gateway, config.sync.clone()));

        Ok(Self {
            store,
            engine,
            monitor,
            user_id: config.user_id.clone(),
        })
    }

    pub fn sync_engine(&self) -> Result<&SyncEngine<SupabaseGateway>, CliError> {
        self.engine.as_ref().ok_or(CliError::SyncNotConfigured)
    }

    pub async fn run_startup_checks(&self) -> Result<StartupOutcome, CliError> {
        let outcome = self.monitor.run_startup_checks(self.engine.as_ref()).await?;
        if let Some(notice) = startup_notice(&outcome) {
            eprintln!("{notice}");
        }
        Ok(outcome)
    }

    pub fn mark_healthy(&self) -> Result<(), CliError> {
        Ok(self.monitor.mark_healthy()?)
    }
}

fn build_gateway(config: &CliConfig) -> Result<Option<SupabaseGateway>, CliError> {
    let Some((rest_url, anon_key)) = config.remote.resolve()? else {
        return Ok(None);
    };
    let (Some(user_id), Some(access_token)) = (config.user_id.clone(), config.access_token.clone())
    else {
        tracing::debug!("Cloud endpoint configured but no signed-in user; sync disabled");
        return Ok(None);
    };

    let principal = Principal::new(user_id, access_token).map_err(quoteflow_core::Error::from)?;
    let gateway = SupabaseGateway::new(
        rest_url,
        anon_key,
        principal,
        config.sync.request_timeout(),
    )
    .map_err(quoteflow_core::Error::from)?;
    Ok(Some(gateway))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("QUOTEFLOW_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quoteflow")
        .join("quoteflow.db")
}

/// The launch counter lives beside the database, outside it.
pub fn launch_state_path(db_path: &Path) -> PathBuf {
    db_path.with_file_name(LAUNCH_STATE_FILE_NAME)
}

pub fn startup_notice(outcome: &StartupOutcome) -> Option<String> {
    match outcome {
        StartupOutcome::Healthy { .. } => None,
        StartupOutcome::NuclearReset { launches } => Some(format!(
            "Local data was reset after {launches} launches without a clean exit."
        )),
        StartupOutcome::CloudRecovered { issues, reports } => Some(format!(
            "Restored your data from the cloud ({} problems found, {} records restored).",
            issues.len(),
            reports.iter().map(|report| report.downloaded).sum::<usize>()
        )),
        StartupOutcome::LocalDataCleared { issues } => Some(format!(
            "Cleared damaged local data ({} problems found). Sign in to restore from the cloud.",
            issues.len()
        )),
        StartupOutcome::RecoveryPending { issues, .. } => Some(format!(
            "Cleared damaged local data ({} problems found) but could not reach the cloud to restore it. Will retry next launch.",
            issues.len()
        )),
        StartupOutcome::RecoveryInProgress => {
            Some("A data restore is still in progress.".to_string())
        }
    }
}

/// Accept a full record id or a unique prefix of one.
pub async fn resolve_record_id(
    store: &LocalStore,
    entity: EntityType,
    raw: &str,
) -> Result<RecordId, CliError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CliError::EmptyRecordId);
    }
    if let Ok(id) = raw.parse::<RecordId>() {
        return Ok(id);
    }

    let prefix = raw.to_ascii_lowercase();
    let matches = store
        .all_records(entity)
        .await?
        .into_iter()
        .filter(|record| record.id.to_string().starts_with(&prefix))
        .map(|record| record.id)
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [] => Err(CliError::RecordNotFound(raw.to_string())),
        [id] => Ok(*id),
        _ => Err(CliError::AmbiguousRecordId(format!(
            "ID prefix '{raw}' matches {} {}; use more characters",
            matches.len(),
            entity.table()
        ))),
    }
}

/// Parse `description|quantity|unit_cents`.
pub fn parse_line_item(raw: &str) -> Result<LineItem, CliError> {
    let invalid = || CliError::InvalidLineItem(raw.to_string());
    let mut parts = raw.split('|').map(str::trim);

    let (Some(description), Some(quantity), Some(unit_cents), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if description.is_empty() {
        return Err(invalid());
    }
    let quantity = quantity
        .parse::<f64>()
        .ok()
        .filter(|quantity| quantity.is_finite() && *quantity > 0.0)
        .ok_or_else(invalid)?;
    let unit_cents = unit_cents.parse::<i64>().map_err(|_| invalid())?;

    Ok(LineItem::new(description, quantity, unit_cents))
}

pub fn normalize_name(name: &str) -> Result<String, CliError> {
    let name = name.trim();
    if name.is_empty() {
        Err(CliError::EmptyName)
    } else {
        Ok(name.to_string())
    }
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}${}.{:02}", cents / 100, cents % 100)
}

pub fn body_total_cents(body: &EntityBody) -> Option<i64> {
    match body {
        EntityBody::Quote(quote) => Some(quote.total_cents()),
        EntityBody::Invoice(invoice) => Some(invoice.total_cents()),
        EntityBody::PriceBookItem(item) => Some(item.unit_price_cents),
        EntityBody::Client(_) => None,
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let text = compact_text(text).replace('\n', " ");
    if text.chars().count() <= max_chars {
        return text;
    }
    let truncated = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    format!("{truncated}...")
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let month = 30 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < month {
        format!("{}d ago", diff / day)
    } else {
        format!("{}mo ago", diff / month)
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub entity: EntityType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cents: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    pub synced: bool,
}

pub fn record_to_list_item(record: &SyncRecord) -> RecordListItem {
    RecordListItem {
        id: record.id.to_string(),
        entity: record.entity_type(),
        name: record.name().to_string(),
        total_cents: body_total_cents(&record.body),
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
        deleted_at: record.deleted_at.clone(),
        synced: record.synced_at.is_some(),
    }
}

pub fn format_record_lines(records: &[SyncRecord], now_ms: i64) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let name = preview(record.name(), 40);
            let relative_time = format_relative_time(record.updated_at_millis(), now_ms);
            let mut line = format!("{short_id:<13}  {name:<40}  {relative_time:<10}");

            if let Some(total) = body_total_cents(&record.body) {
                line.push_str(&format!("  {:>12}", format_cents(total)));
            }
            if record.is_deleted() {
                line.push_str("  (deleted)");
            }
            line.trim_end().to_string()
        })
        .collect()
}

pub const fn describe_skip(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::LockHeld => "another sync is running",
        SkipReason::CoolingDown => "synced moments ago",
        SkipReason::Disabled => "sync disabled",
        SkipReason::AlreadyMigrated => "already migrated",
    }
}

pub fn format_report_line(report: &SyncReport) -> String {
    let label = report.entity.table();
    if let Some(reason) = report.skipped {
        return format!("{label:<17} skipped ({})", describe_skip(reason));
    }
    if let Some(error) = &report.error {
        return format!("{label:<17} failed: {error}");
    }
    format!(
        "{label:<17} {} down, {} up, {} deleted, {} merged, {} failed",
        report.downloaded, report.uploaded, report.deleted, report.duplicates_merged, report.failed
    )
}

/// Print reports and count the passes that errored out.
pub fn print_reports(reports: &[SyncReport], as_json: bool) -> Result<usize, CliError> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(reports)?);
    } else {
        for report in reports {
            println!("{}", format_report_line(report));
        }
    }
    Ok(reports
        .iter()
        .filter(|report| report.error.is_some())
        .count())
}

pub fn last_sync_label(last_sync_at: Option<&str>, now_ms: i64) -> String {
    match last_sync_at {
        Some(cursor) if timestamp_millis(Some(cursor)) > 0 => {
            format_relative_time(timestamp_millis(Some(cursor)), now_ms)
        }
        _ => "never".to_string(),
    }
}
