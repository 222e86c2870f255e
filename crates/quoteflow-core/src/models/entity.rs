//! Entity bodies and their versioned storage envelope
//!
//! Bodies are stored in a single JSON column locally and a `jsonb` column
//! remotely. The envelope carries a format version and the entity kind so a
//! row written by a newer app build, or filed under the wrong table, is
//! reported instead of silently misread.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{EntityType, RecordId};
use crate::error::{Error, Result};

/// Current body envelope format
pub const BODY_FORMAT_VERSION: u32 = 1;

/// A customer the contractor quotes and invoices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Client {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            phone: None,
            address: None,
            notes: None,
        }
    }
}

/// One priced line on a quote or invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    /// Unit price in minor currency units
    pub unit_price_cents: i64,
    /// Price-book entry this line was copied from, if any
    #[serde(default)]
    pub price_book_item_id: Option<RecordId>,
}

impl LineItem {
    #[must_use]
    pub fn new(description: impl Into<String>, quantity: f64, unit_price_cents: i64) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price_cents,
            price_book_item_id: None,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn total_cents(&self) -> i64 {
        (self.quantity * self.unit_price_cents as f64).round() as i64
    }
}

fn line_items_total(items: &[LineItem]) -> i64 {
    items.iter().map(LineItem::total_cents).sum()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    #[default]
    Draft,
    Sent,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub title: String,
    #[serde(default)]
    pub client_id: Option<RecordId>,
    #[serde(default)]
    pub status: QuoteStatus,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Quote {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            client_id: None,
            status: QuoteStatus::Draft,
            line_items: Vec::new(),
            notes: None,
        }
    }

    pub fn total_cents(&self) -> i64 {
        line_items_total(&self.line_items)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Overdue,
    Void,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Human-facing invoice number, e.g. `INV-0042`
    pub number: String,
    #[serde(default)]
    pub client_id: Option<RecordId>,
    #[serde(default)]
    pub quote_id: Option<RecordId>,
    #[serde(default)]
    pub status: InvoiceStatus,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub due_date: Option<String>,
}

impl Invoice {
    #[must_use]
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            client_id: None,
            quote_id: None,
            status: InvoiceStatus::Draft,
            line_items: Vec::new(),
            due_date: None,
        }
    }

    pub fn total_cents(&self) -> i64 {
        line_items_total(&self.line_items)
    }
}

/// A reusable priced item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBookItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    pub unit_price_cents: i64,
}

/// Entity-specific fields of a syncable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum EntityBody {
    Client(Client),
    Quote(Quote),
    Invoice(Invoice),
    PriceBookItem(PriceBookItem),
}

#[derive(Serialize, Deserialize)]
struct BodyEnvelope {
    version: u32,
    kind: EntityType,
    fields: Value,
}

impl EntityBody {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Client(_) => EntityType::Client,
            Self::Quote(_) => EntityType::Quote,
            Self::Invoice(_) => EntityType::Invoice,
            Self::PriceBookItem(_) => EntityType::PriceBookItem,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Client(client) => &client.name,
            Self::Quote(quote) => &quote.title,
            Self::Invoice(invoice) => &invoice.number,
            Self::PriceBookItem(item) => &item.name,
        }
    }

    /// Encode into the versioned envelope as a JSON value
    pub fn to_value(&self) -> Result<Value> {
        let fields = match self {
            Self::Client(client) => serde_json::to_value(client)?,
            Self::Quote(quote) => serde_json::to_value(quote)?,
            Self::Invoice(invoice) => serde_json::to_value(invoice)?,
            Self::PriceBookItem(item) => serde_json::to_value(item)?,
        };
        Ok(serde_json::to_value(BodyEnvelope {
            version: BODY_FORMAT_VERSION,
            kind: self.entity_type(),
            fields,
        })?)
    }

    /// Encode into the versioned envelope as a JSON string
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Decode an envelope, requiring it to hold an `expected` body
    pub fn from_value(expected: EntityType, value: Value) -> Result<Self> {
        let envelope: BodyEnvelope = serde_json::from_value(value)
            .map_err(|error| Error::Payload(format!("malformed body envelope: {error}")))?;

        if envelope.version == 0 || envelope.version > BODY_FORMAT_VERSION {
            return Err(Error::Payload(format!(
                "unsupported body version {} (this build reads up to {BODY_FORMAT_VERSION})",
                envelope.version
            )));
        }
        if envelope.kind != expected {
            return Err(Error::Payload(format!(
                "expected a {expected} body, found {}",
                envelope.kind
            )));
        }

        let fields = envelope.fields;
        let body = match expected {
            EntityType::Client => Self::Client(serde_json::from_value(fields)?),
            EntityType::Quote => Self::Quote(serde_json::from_value(fields)?),
            EntityType::Invoice => Self::Invoice(serde_json::from_value(fields)?),
            EntityType::PriceBookItem => Self::PriceBookItem(serde_json::from_value(fields)?),
        };
        Ok(body)
    }

    /// Decode an envelope from its stored string form
    pub fn decode(expected: EntityType, raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|error| Error::Payload(format!("body is not JSON: {error}")))?;
        Self::from_value(expected, value)
    }
}
