use quoteflow_core::db::ListFilter;
use quoteflow_core::EntityType;

use crate::commands::common::{format_record_lines, record_to_list_item, App};
use crate::error::CliError;

pub async fn run_list(
    app: &App,
    entity: EntityType,
    limit: usize,
    include_deleted: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let mut filter = ListFilter::page(limit.max(1), 0);
    if include_deleted {
        filter = filter.with_deleted();
    }
    let records = app.store.list(entity, &filter).await?;

    if as_json {
        let items = records.iter().map(record_to_list_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No {} found.", entity.table().replace('_', " "));
        return Ok(());
    }

    let now_ms = app.store.clock().now_millis();
    for line in format_record_lines(&records, now_ms) {
        println!("{line}");
    }
    Ok(())
}
