//! Syncable record model shared by every entity type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::EntityBody;
use crate::error::Error;
use crate::util::timestamp_millis;

/// A unique identifier for a record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// The kinds of records kept in sync with the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Client,
    Quote,
    Invoice,
    PriceBookItem,
}

impl EntityType {
    /// Every entity type, in the order a full sync or recovery walks them.
    pub const ALL: [Self; 4] = [Self::Client, Self::PriceBookItem, Self::Quote, Self::Invoice];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Quote => "quote",
            Self::Invoice => "invoice",
            Self::PriceBookItem => "price_book_item",
        }
    }

    /// Table name, identical on the device and in the cloud.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Client => "clients",
            Self::Quote => "quotes",
            Self::Invoice => "invoices",
            Self::PriceBookItem => "price_book_items",
        }
    }

    /// Whether independently created records with the same name are the same thing.
    ///
    /// Quotes and invoices legitimately repeat titles, so only address-book
    /// style entities collapse on name.
    pub const fn dedupes_by_name(self) -> bool {
        matches!(self, Self::Client | Self::PriceBookItem)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "client" | "clients" => Ok(Self::Client),
            "quote" | "quotes" => Ok(Self::Quote),
            "invoice" | "invoices" => Ok(Self::Invoice),
            "price_book_item" | "price_book_items" | "item" | "items" => Ok(Self::PriceBookItem),
            other => Err(Error::InvalidInput(format!("unknown entity type '{other}'"))),
        }
    }
}

/// A record as held by the local store and exchanged with the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Unique identifier, shared by the local and remote copy
    pub id: RecordId,
    /// Entity-specific fields
    pub body: EntityBody,
    /// Creation timestamp (RFC 3339), never changed after creation
    pub created_at: String,
    /// Last mutation timestamp (RFC 3339); the only conflict signal
    pub updated_at: String,
    /// Tombstone timestamp; set means the record is soft-deleted
    pub deleted_at: Option<String>,
    /// Last time this row was confirmed identical to the remote copy (local only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
}

impl SyncRecord {
    /// Create a new record stamped with `now`
    #[must_use]
    pub fn new(body: EntityBody, now: &str) -> Self {
        Self {
            id: RecordId::new(),
            body,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            deleted_at: None,
            synced_at: None,
        }
    }

    pub const fn entity_type(&self) -> EntityType {
        self.body.entity_type()
    }

    /// Display name, also the duplicate-detection key
    pub fn name(&self) -> &str {
        self.body.name()
    }

    /// `updated_at` as Unix milliseconds, epoch zero when unparsable
    pub fn updated_at_millis(&self) -> i64 {
        timestamp_millis(Some(&self.updated_at))
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Last-write-wins: strictly newer than `other`
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.updated_at_millis() > other.updated_at_millis()
    }

    /// Replace the body and bump `updated_at`
    pub fn update_body(&mut self, body: EntityBody, now: &str) {
        self.body = body;
        self.updated_at = now.to_string();
    }

    /// Set the tombstone and bump `updated_at`
    pub fn mark_deleted(&mut self, now: &str) {
        self.deleted_at = Some(now.to_string());
        self.updated_at = now.to_string();
    }
}
