use quoteflow_core::models::{Client, Quote};
use quoteflow_core::util::normalize_text_option;
use quoteflow_core::{EntityBody, EntityType};

use crate::commands::common::{
    format_cents, normalize_name, parse_line_item, resolve_record_id, App,
};
use crate::error::CliError;

pub async fn run_add_client(
    app: &App,
    name: &str,
    email: Option<String>,
    phone: Option<String>,
) -> Result<(), CliError> {
    let mut client = Client::new(normalize_name(name)?);
    client.email = normalize_text_option(email);
    client.phone = normalize_text_option(phone);

    let record = app.store.create(EntityBody::Client(client)).await?;
    tracing::debug!(id = %record.id, "Created client");
    println!("{}", record.id);
    Ok(())
}

pub async fn run_add_quote(
    app: &App,
    title: &str,
    client: Option<&str>,
    lines: &[String],
) -> Result<(), CliError> {
    let mut quote = Quote::new(normalize_name(title)?);
    if let Some(client) = client {
        let client_id = resolve_record_id(&app.store, EntityType::Client, client).await?;
        let exists = app
            .store
            .get_by_id(EntityType::Client, &client_id)
            .await?
            .is_some_and(|record| !record.is_deleted());
        if !exists {
            return Err(CliError::RecordNotFound(client.to_string()));
        }
        quote.client_id = Some(client_id);
    }
    quote.line_items = lines
        .iter()
        .map(|line| parse_line_item(line))
        .collect::<Result<Vec<_>, _>>()?;

    let total = quote.total_cents();
    let record = app.store.create(EntityBody::Quote(quote)).await?;
    tracing::debug!(id = %record.id, "Created quote");
    println!("{}  {}", record.id, format_cents(total));
    Ok(())
}
