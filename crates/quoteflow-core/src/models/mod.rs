//! Data models for QuoteFlow

mod entity;
mod record;
mod sync_state;

pub use entity::{
    Client, EntityBody, Invoice, InvoiceStatus, LineItem, PriceBookItem, Quote, QuoteStatus,
    BODY_FORMAT_VERSION,
};
pub use record::{EntityType, RecordId, SyncRecord};
pub use sync_state::{SyncLockState, SyncMetadata};
