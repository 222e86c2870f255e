//! PostgREST-backed gateway for a Supabase project.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::{
    decode_rows, fetch_paginated, RemoteError, RemoteGateway, RemoteQuery, RemoteResult,
    RemoteRow, MAX_TOMBSTONES_PER_PASS,
};
use crate::models::{EntityType, RecordId, SyncRecord};
use crate::util::normalize_text_option;

/// Ids per `id=in.(...)` filter, keeps request URLs bounded
const VERSION_CHUNK_SIZE: usize = 100;

/// Authenticated identity every remote row is scoped to
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub access_token: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> RemoteResult<Self> {
        let user_id = normalize_text_option(Some(user_id.into())).ok_or_else(|| {
            RemoteError::InvalidConfiguration("user id must not be empty".to_string())
        })?;
        let access_token = normalize_text_option(Some(access_token.into())).ok_or_else(|| {
            RemoteError::InvalidConfiguration("access token must not be empty".to_string())
        })?;
        Ok(Self {
            user_id,
            access_token,
        })
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Principal")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct SupabaseGateway {
    rest_url: String,
    anon_key: String,
    principal: Principal,
    client: reqwest::Client,
}

impl std::fmt::Debug for SupabaseGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SupabaseGateway")
            .field("rest_url", &self.rest_url)
            .field("anon_key", &"[REDACTED]")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl SupabaseGateway {
    /// `rest_url` is the PostgREST base, e.g. `https://x.supabase.co/rest/v1`
    pub fn new(
        rest_url: impl Into<String>,
        anon_key: impl Into<String>,
        principal: Principal,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let rest_url = normalize_text_option(Some(rest_url.into()))
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                RemoteError::InvalidConfiguration("REST URL must not be empty".to_string())
            })?;
        let anon_key = normalize_text_option(Some(anon_key.into())).ok_or_else(|| {
            RemoteError::InvalidConfiguration("anon key must not be empty".to_string())
        })?;

        Ok(Self {
            rest_url,
            anon_key,
            principal,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub const fn principal(&self) -> &Principal {
        &self.principal
    }

    fn table_url(&self, entity: EntityType) -> String {
        format!("{}/{}", self.rest_url, entity.table())
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.principal.access_token)
            .header("Accept", "application/json")
    }

    async fn try_upload(&self, record: &SyncRecord) -> RemoteResult<()> {
        let row = RemoteRow::from_record(record, Some(&self.principal.user_id))?;
        let response = self
            .authed(self.client.post(self.table_url(record.entity_type())))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn fetch_rows(
        &self,
        query: &RemoteQuery,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        let pairs = query.to_query_pairs(&self.principal.user_id, offset, limit);
        let response = self
            .authed(self.client.get(self.table_url(query.entity)))
            .query(&pairs)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<Vec<RemoteRow>>().await?)
    }

    async fn try_download(&self, query: &RemoteQuery) -> RemoteResult<Vec<SyncRecord>> {
        let rows = fetch_paginated(query, |offset, limit| self.fetch_rows(query, offset, limit))
            .await?;
        Ok(decode_rows(query.entity, rows))
    }

    async fn fetch_tombstone_page(
        &self,
        entity: EntityType,
        cursor: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<IdRow>> {
        let mut pairs = vec![
            ("select".to_string(), "id".to_string()),
            ("user_id".to_string(), format!("eq.{}", self.principal.user_id)),
        ];
        match cursor {
            Some(cursor) => pairs.push(("deleted_at".to_string(), format!("gt.{cursor}"))),
            None => pairs.push(("deleted_at".to_string(), "not.is.null".to_string())),
        }
        pairs.push(("order".to_string(), "deleted_at.desc".to_string()));
        pairs.push(("offset".to_string(), offset.to_string()));
        pairs.push(("limit".to_string(), limit.to_string()));

        let response = self
            .authed(self.client.get(self.table_url(entity)))
            .query(&pairs)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<Vec<IdRow>>().await?)
    }

    async fn try_download_deleted_ids(
        &self,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> RemoteResult<Vec<RecordId>> {
        let query = RemoteQuery::new(entity, MAX_TOMBSTONES_PER_PASS).page_size(1_000);
        let rows = fetch_paginated(&query, |offset, limit| {
            self.fetch_tombstone_page(entity, cursor, offset, limit)
        })
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.id.parse::<RecordId>().ok())
            .collect())
    }

    async fn try_fetch_versions(
        &self,
        entity: EntityType,
        ids: &[RecordId],
    ) -> RemoteResult<HashMap<RecordId, String>> {
        let mut versions = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(VERSION_CHUNK_SIZE) {
            let id_list = chunk
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let pairs = [
                ("select".to_string(), "id,updated_at".to_string()),
                ("user_id".to_string(), format!("eq.{}", self.principal.user_id)),
                ("id".to_string(), format!("in.({id_list})")),
            ];
            let response = self
                .authed(self.client.get(self.table_url(entity)))
                .query(&pairs)
                .send()
                .await?;
            let response = ensure_success(response).await?;

            for row in response.json::<Vec<VersionRow>>().await? {
                match row.id.parse::<RecordId>() {
                    Ok(id) => {
                        versions.insert(id, row.updated_at);
                    }
                    Err(error) => {
                        tracing::warn!("Ignoring remote {} version with bad id: {}", entity, error);
                    }
                }
            }
        }

        Ok(versions)
    }

    async fn try_delete(&self, entity: EntityType, id: &RecordId) -> RemoteResult<()> {
        let pairs = [
            ("id".to_string(), format!("eq.{id}")),
            ("user_id".to_string(), format!("eq.{}", self.principal.user_id)),
        ];
        let response = self
            .authed(self.client.delete(self.table_url(entity)))
            .query(&pairs)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

impl RemoteGateway for SupabaseGateway {
    async fn upload(&self, record: &SyncRecord) -> bool {
        match self.try_upload(record).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    "Upload of {} {} failed: {}",
                    record.entity_type(),
                    record.id,
                    error
                );
                false
            }
        }
    }

    async fn download_since(&self, query: &RemoteQuery) -> Option<Vec<SyncRecord>> {
        match self.try_download(query).await {
            Ok(records) => Some(records),
            Err(error) => {
                tracing::warn!("Download of {} failed: {}", query.entity, error);
                None
            }
        }
    }

    async fn download_deleted_ids_since(
        &self,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Option<Vec<RecordId>> {
        match self.try_download_deleted_ids(entity, cursor).await {
            Ok(ids) => Some(ids),
            Err(error) => {
                tracing::warn!("Tombstone download of {} failed: {}", entity, error);
                None
            }
        }
    }

    async fn fetch_versions(
        &self,
        entity: EntityType,
        ids: &[RecordId],
    ) -> Option<HashMap<RecordId, String>> {
        if ids.is_empty() {
            return Some(HashMap::new());
        }
        match self.try_fetch_versions(entity, ids).await {
            Ok(versions) => Some(versions),
            Err(error) => {
                tracing::warn!("Version lookup for {} failed: {}", entity, error);
                None
            }
        }
    }

    async fn delete(&self, entity: EntityType, id: &RecordId) -> bool {
        match self.try_delete(entity, id).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!("Remote delete of {} {} failed: {}", entity, id, error);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VersionRow {
    id: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
    error: Option<String>,
}

async fn ensure_success(response: reqwest::Response) -> RemoteResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Api(parse_api_error(status, &body)))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorBody>(body) {
        if let Some(message) = payload
            .message
            .or(payload.error)
            .or(payload.details)
            .or(payload.hint)
        {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
