//! Remote data gateway: the cloud side of sync.
//!
//! Every operation is scoped to the authenticated principal and reports
//! failure through its return value (`false` or `None`) after logging.
//! Downloads return `None` on failure so callers can tell an unreachable
//! remote apart from one with nothing new.

mod memory;
mod supabase;

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{EntityBody, EntityType, RecordId, SyncRecord};

pub use memory::InMemoryGateway;
pub use supabase::{Principal, SupabaseGateway};

/// Upper bound on tombstone ids pulled in a single pass
pub const MAX_TOMBSTONES_PER_PASS: usize = 5_000;

/// Errors raised inside gateway implementations before they are folded into
/// the `bool`/`Option` results of [`RemoteGateway`]
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote API error: {0}")]
    Api(String),
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
    #[error("Remote is unreachable")]
    Unreachable,
}

pub type RemoteResult<T> = Result<T, RemoteError>;

impl From<RemoteError> for crate::Error {
    fn from(error: RemoteError) -> Self {
        Self::Remote(error.to_string())
    }
}

/// Cloud store operations used by the sync orchestrator
#[allow(async_fn_in_trait)]
pub trait RemoteGateway {
    /// Upsert a record by id
    async fn upload(&self, record: &SyncRecord) -> bool;

    /// Fetch records matching `query` in `query.order`; `None` when the
    /// download failed
    async fn download_since(&self, query: &RemoteQuery) -> Option<Vec<SyncRecord>>;

    /// Ids tombstoned remotely after `cursor` (all tombstones when `None`);
    /// `None` when the download failed
    async fn download_deleted_ids_since(
        &self,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Option<Vec<RecordId>>;

    /// Remote `updated_at` per id for the ids that exist remotely (tombstones
    /// included); `None` when the lookup itself failed
    async fn fetch_versions(
        &self,
        entity: EntityType,
        ids: &[RecordId],
    ) -> Option<HashMap<RecordId, String>>;

    /// Hard-delete a remote row
    async fn delete(&self, entity: EntityType, id: &RecordId) -> bool;
}

/// Sort applied to remote downloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    UpdatedDesc,
    UpdatedAsc,
}

impl SortOrder {
    const fn as_postgrest(self) -> &'static str {
        match self {
            Self::UpdatedDesc => "updated_at.desc",
            Self::UpdatedAsc => "updated_at.asc",
        }
    }
}

/// Typed description of one remote download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
    pub entity: EntityType,
    /// Only rows with `updated_at` strictly after this timestamp
    pub cursor: Option<String>,
    /// Total row ceiling across all pages
    pub limit: usize,
    /// Rows requested per page
    pub page_size: usize,
    pub order: SortOrder,
    /// Include tombstoned rows (excluded by default)
    pub include_deleted: bool,
}

impl RemoteQuery {
    pub fn new(entity: EntityType, limit: usize) -> Self {
        Self {
            entity,
            cursor: None,
            limit,
            page_size: limit,
            order: SortOrder::default(),
            include_deleted: false,
        }
    }

    #[must_use]
    pub fn since(mut self, cursor: Option<&str>) -> Self {
        self.cursor = cursor.map(str::to_string);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, self.limit.max(1));
        self
    }

    #[must_use]
    pub const fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// PostgREST filter, sort, and paging parameters for one page
    pub fn to_query_pairs(
        &self,
        owner_id: &str,
        offset: usize,
        page_limit: usize,
    ) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("select".to_string(), "*".to_string()),
            ("user_id".to_string(), format!("eq.{owner_id}")),
        ];
        if let Some(cursor) = &self.cursor {
            pairs.push(("updated_at".to_string(), format!("gt.{cursor}")));
        }
        if !self.include_deleted {
            pairs.push(("deleted_at".to_string(), "is.null".to_string()));
        }
        pairs.push(("order".to_string(), self.order.as_postgrest().to_string()));
        pairs.push(("offset".to_string(), offset.to_string()));
        pairs.push(("limit".to_string(), page_limit.to_string()));
        pairs
    }
}

/// Walk a paged remote resource until `query.limit` rows or a short page.
///
/// `fetch_page(offset, page_limit)` returns one page.
pub async fn fetch_paginated<T, F, Fut>(query: &RemoteQuery, mut fetch_page: F) -> RemoteResult<Vec<T>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = RemoteResult<Vec<T>>>,
{
    let page_size = query.page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0usize;

    while rows.len() < query.limit {
        let page_limit = page_size.min(query.limit - rows.len());
        let page = fetch_page(offset, page_limit).await?;
        let count = page.len();
        rows.extend(page.into_iter().take(page_limit));

        if count < page_limit {
            break;
        }
        offset += count;
    }

    Ok(rows)
}

/// Row shape exchanged with the cloud store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub name: String,
    pub body: Value,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl RemoteRow {
    pub fn from_record(record: &SyncRecord, owner_id: Option<&str>) -> RemoteResult<Self> {
        let body = record
            .body
            .to_value()
            .map_err(|error| RemoteError::InvalidPayload(error.to_string()))?;
        Ok(Self {
            id: record.id.to_string(),
            user_id: owner_id.map(str::to_string),
            name: record.name().to_string(),
            body,
            created_at: record.created_at.clone(),
            updated_at: record.updated_at.clone(),
            deleted_at: record.deleted_at.clone(),
        })
    }

    pub fn into_record(self, entity: EntityType) -> RemoteResult<SyncRecord> {
        let id = self
            .id
            .parse::<RecordId>()
            .map_err(|error| RemoteError::InvalidPayload(format!("id '{}': {error}", self.id)))?;
        let body = EntityBody::from_value(entity, self.body)
            .map_err(|error| RemoteError::InvalidPayload(format!("{entity}/{id}: {error}")))?;
        Ok(SyncRecord {
            id,
            body,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            synced_at: None,
        })
    }
}

/// Convert rows, dropping (and logging) the ones that do not decode
pub(crate) fn decode_rows(entity: EntityType, rows: Vec<RemoteRow>) -> Vec<SyncRecord> {
    rows.into_iter()
        .filter_map(|row| match row.into_record(entity) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!("Skipping undecodable remote {} row: {}", entity, error);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Client;
    use pretty_assertions::assert_eq;

    #[test]
    fn query_pairs_filter_owner_cursor_and_tombstones() {
        let query = RemoteQuery::new(EntityType::Quote, 100)
            .since(Some("2024-01-01T00:00:00.000Z"))
            .page_size(50);
        let pairs = query.to_query_pairs("user-1", 50, 50);

        assert_eq!(
            pairs,
            vec![
                ("select".to_string(), "*".to_string()),
                ("user_id".to_string(), "eq.user-1".to_string()),
                (
                    "updated_at".to_string(),
                    "gt.2024-01-01T00:00:00.000Z".to_string()
                ),
                ("deleted_at".to_string(), "is.null".to_string()),
                ("order".to_string(), "updated_at.desc".to_string()),
                ("offset".to_string(), "50".to_string()),
                ("limit".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn query_pairs_without_cursor_or_deleted_filter() {
        let pairs = RemoteQuery::new(EntityType::Client, 10)
            .with_deleted()
            .to_query_pairs("u", 0, 10);
        assert!(!pairs.iter().any(|(key, _)| key == "updated_at"));
        assert!(!pairs.iter().any(|(key, _)| key == "deleted_at"));
    }

    #[test]
    fn ascending_order_renders_for_postgrest() {
        let pairs = RemoteQuery::new(EntityType::Invoice, 10)
            .order(SortOrder::UpdatedAsc)
            .to_query_pairs("u", 0, 10);
        assert!(pairs.contains(&("order".to_string(), "updated_at.asc".to_string())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paginated_fetch_stops_at_limit() {
        let query = RemoteQuery::new(EntityType::Client, 7).page_size(3);
        let mut calls = Vec::new();

        let rows = fetch_paginated(&query, |offset, limit| {
            calls.push((offset, limit));
            async move { Ok((offset..offset + limit).collect::<Vec<_>>()) }
        })
        .await
        .unwrap();

        assert_eq!(rows, (0..7).collect::<Vec<_>>());
        assert_eq!(calls, vec![(0, 3), (3, 3), (6, 1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paginated_fetch_stops_on_short_page() {
        let query = RemoteQuery::new(EntityType::Client, 100).page_size(10);
        let rows = fetch_paginated(&query, |offset, _limit| async move {
            Ok(if offset == 0 { vec![1, 2, 3] } else { vec![9] })
        })
        .await
        .unwrap();
        assert_eq!(rows, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paginated_fetch_propagates_errors() {
        let query = RemoteQuery::new(EntityType::Client, 10);
        let result: RemoteResult<Vec<u8>> =
            fetch_paginated(&query, |_, _| async { Err(RemoteError::Unreachable) }).await;
        assert!(result.is_err());
    }

    #[test]
    fn remote_row_round_trips_a_record() {
        let record = SyncRecord::new(
            EntityBody::Client(Client::new("Acme")),
            "2024-01-01T00:00:00.000Z",
        );
        let row = RemoteRow::from_record(&record, Some("user-1")).unwrap();
        assert_eq!(row.user_id.as_deref(), Some("user-1"));
        assert_eq!(row.body["kind"], "client");

        let decoded = row.into_record(EntityType::Client).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rows_skips_bad_rows() {
        let good = RemoteRow::from_record(
            &SyncRecord::new(
                EntityBody::Client(Client::new("Acme")),
                "2024-01-01T00:00:00.000Z",
            ),
            None,
        )
        .unwrap();
        let mut bad = good.clone();
        bad.id = "not-a-uuid".to_string();

        let records = decode_rows(EntityType::Client, vec![bad, good]);
        assert_eq!(records.len(), 1);
    }
}
