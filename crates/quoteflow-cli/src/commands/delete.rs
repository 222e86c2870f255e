use quoteflow_core::EntityType;

use crate::commands::common::{resolve_record_id, App};
use crate::error::CliError;

pub async fn run_delete(app: &App, entity: EntityType, raw_id: &str) -> Result<(), CliError> {
    let id = resolve_record_id(&app.store, entity, raw_id).await?;
    if app.store.get_by_id(entity, &id).await?.is_none() {
        return Err(CliError::RecordNotFound(raw_id.trim().to_string()));
    }

    if app.store.soft_delete(entity, &id).await? {
        println!("Deleted {} {id}", entity.as_str());
    } else {
        println!("{} {id} was already deleted", entity.as_str());
    }
    Ok(())
}
