//! quoteflow-core - Core library for QuoteFlow
//!
//! This crate contains the entity models, the on-device store, and the sync
//! engine that keeps clients, quotes, invoices, and price-book items in step
//! with the cloud while the app works fully offline.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod integrity;
pub mod models;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityBody, EntityType, RecordId, SyncRecord};
