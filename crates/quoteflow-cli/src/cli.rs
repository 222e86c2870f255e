use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use quoteflow_core::EntityType;

#[derive(Parser)]
#[command(name = "quoteflow")]
#[command(about = "Quotes, invoices, and clients that work offline and sync later")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the CLI config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show record counts and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records of one type
    #[command(alias = "ls")]
    List {
        #[arg(value_enum)]
        entity: EntityArg,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Include deleted records
        #[arg(long)]
        include_deleted: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a client
    AddClient {
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Create a draft quote
    AddQuote {
        title: String,
        /// Client ID or unique ID prefix
        #[arg(long)]
        client: Option<String>,
        /// Line item as "description|quantity|unit_cents" (repeatable)
        #[arg(long = "line", value_name = "LINE")]
        lines: Vec<String>,
    },
    /// Delete a record
    Delete {
        #[arg(value_enum)]
        entity: EntityArg,
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Sync one or every record type with the cloud
    Sync {
        #[arg(value_enum)]
        entity: Option<EntityArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Keep syncing every SECS seconds until Ctrl-C
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },
    /// Upload records created before sync was set up
    Migrate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Permanently remove old deleted records, locally and in the cloud
    Purge {
        #[arg(value_enum)]
        entity: Option<EntityArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the local store for damage
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntityArg {
    #[value(alias = "clients")]
    Client,
    #[value(alias = "quotes")]
    Quote,
    #[value(alias = "invoices")]
    Invoice,
    #[value(alias = "items", alias = "price-book")]
    Item,
}

impl From<EntityArg> for EntityType {
    fn from(value: EntityArg) -> Self {
        match value {
            EntityArg::Client => Self::Client,
            EntityArg::Quote => Self::Quote,
            EntityArg::Invoice => Self::Invoice,
            EntityArg::Item => Self::PriceBookItem,
        }
    }
}
