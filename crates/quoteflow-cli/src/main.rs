//! QuoteFlow CLI - quotes and invoices from the terminal
//!
//! Works against the local store; `sync` reconciles with the cloud when
//! credentials are configured.

mod cli;
mod commands;
mod config;
mod error;


use std::time::Duration;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_db_path, App};
use crate::config::CliConfig;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "quoteflow=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?.with_env_overrides();
    let db_path = resolve_db_path(cli.db_path);
    let app = App::open(&db_path, &config)?;

    run_invocation(&app, cli.command).await
}

/// Startup checks, the command, then the healthy marker.
///
/// A command that fails on bad input or an unreachable cloud still counts as
/// a clean run; only a process that dies before this returns leaves the
/// launch counter raised.
async fn run_invocation(app: &App, command: Commands) -> Result<(), CliError> {
    app.run_startup_checks().await?;
    let result = run_command(app, command).await;
    app.mark_healthy()?;
    result
}

async fn run_command(app: &App, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Status { json } => commands::status::run_status(app, json).await,
        Commands::List {
            entity,
            limit,
            include_deleted,
            json,
        } => commands::list::run_list(app, entity.into(), limit, include_deleted, json).await,
        Commands::AddClient { name, email, phone } => {
            commands::add::run_add_client(app, &name, email, phone).await
        }
        Commands::AddQuote {
            title,
            client,
            lines,
        } => commands::add::run_add_quote(app, &title, client.as_deref(), &lines).await,
        Commands::Delete { entity, id } => {
            commands::delete::run_delete(app, entity.into(), &id).await
        }
        Commands::Sync {
            entity,
            json,
            watch: None,
        } => commands::sync::run_sync(app, entity.map(Into::into), json).await,
        Commands::Sync {
            entity,
            json,
            watch: Some(secs),
        } => {
            let every = Duration::from_secs(secs.max(1));
            commands::sync::run_sync_watch(app, entity.map(Into::into), json, every).await
        }
        Commands::Migrate { json } => commands::sync::run_migrate(app, json).await,
        Commands::Purge { entity, json } => {
            commands::sync::run_purge(app, entity.map(Into::into), json).await
        }
        Commands::Doctor { json } => commands::doctor::run_doctor(app, json).await,
    }
}
