//! Sync engine and remote endpoint configuration.
//!
//! `SyncSettings` carries every timing and sizing knob of the engine. All
//! fields default, so a partial JSON document (or none at all) is valid.
//! `RemoteConfig` holds the public endpoint of the cloud store; secrets such
//! as access tokens never live here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Timing and sizing knobs for sync, locking, and integrity checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Maximum records pulled by a first (cursor-less) sync
    pub initial_download_limit: usize,
    /// Records per request during an incremental sync
    pub incremental_page_size: usize,
    /// Ceiling on records pulled by one incremental pass; the next pass
    /// resumes after the last record taken
    pub incremental_pass_limit: usize,
    /// Page size used when walking the remote in chunks
    pub remote_page_size: usize,
    /// A persisted lock older than this is treated as abandoned
    pub lock_stale_after_secs: u64,
    /// Minimum spacing between two successful syncs of one entity type
    pub cooldown_secs: u64,
    /// Tombstones older than this are hard-purged
    pub tombstone_retention_days: u64,
    /// Consecutive unconfirmed launches that trigger a nuclear reset
    pub crash_loop_threshold: u32,
    /// Uptime after which a launch counts as stable
    pub stable_run_after_secs: u64,
    /// Minimum spacing between two corruption scans
    pub integrity_scan_interval_secs: u64,
    /// A recovery flag older than this is treated as abandoned
    pub recovery_stale_after_secs: u64,
    /// Pause between entity types during cloud recovery
    pub recovery_pause_ms: u64,
    /// HTTP timeout for gateway requests
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_download_limit: 2_000,
            incremental_page_size: 100,
            incremental_pass_limit: 5_000,
            remote_page_size: 500,
            lock_stale_after_secs: 60,
            cooldown_secs: 5,
            tombstone_retention_days: 30,
            crash_loop_threshold: 3,
            stable_run_after_secs: 10,
            integrity_scan_interval_secs: 24 * 60 * 60,
            recovery_stale_after_secs: 5 * 60,
            recovery_pause_ms: 500,
            request_timeout_secs: 20,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.initial_download_limit == 0
            || self.incremental_page_size == 0
            || self.incremental_pass_limit == 0
            || self.remote_page_size == 0
        {
            return Err(Error::InvalidInput(
                "download limits and page sizes must be positive".to_string(),
            ));
        }
        if self.crash_loop_threshold == 0 {
            return Err(Error::InvalidInput(
                "crash_loop_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub const fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub const fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_days * 24 * 60 * 60)
    }

    pub const fn stable_run_after(&self) -> Duration {
        Duration::from_secs(self.stable_run_after_secs)
    }

    pub const fn integrity_scan_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_scan_interval_secs)
    }

    pub const fn recovery_stale_after(&self) -> Duration {
        Duration::from_secs(self.recovery_stale_after_secs)
    }

    pub const fn recovery_pause(&self) -> Duration {
        Duration::from_millis(self.recovery_pause_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Public endpoint of the cloud relational API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_anon_key: Option<String>,
}

impl RemoteConfig {
    /// Both values present and well-formed: returns `(rest_base_url, anon_key)`.
    ///
    /// `Ok(None)` means sync is simply not configured; a half-filled config is an error.
    pub fn resolve(&self) -> Result<Option<(String, String)>> {
        let url = normalize_text_option(self.supabase_url.clone());
        let anon_key = normalize_text_option(self.supabase_anon_key.clone());

        match (url, anon_key) {
            (None, None) => Ok(None),
            (Some(url), Some(anon_key)) => Ok(Some((normalize_rest_url(&url)?, anon_key))),
            _ => Err(Error::InvalidInput(
                "supabase_url and supabase_anon_key must be configured together".to_string(),
            )),
        }
    }
}

/// Normalize a project URL into its PostgREST base (`.../rest/v1`).
pub fn normalize_rest_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("Supabase URL must not be empty".to_string()));
    }
    if !is_http_url(trimmed) {
        return Err(Error::InvalidInput(
            "Supabase URL must include http:// or https://".to_string(),
        ));
    }
    if trimmed.ends_with("/rest/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/rest/v1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: SyncSettings =
            serde_json::from_str(r#"{ "cooldown_secs": 1, "crash_loop_threshold": 4 }"#).unwrap();
        assert_eq!(settings.cooldown(), Duration::from_secs(1));
        assert_eq!(settings.crash_loop_threshold, 4);
        assert_eq!(settings.initial_download_limit, 2_000);
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let error = serde_json::from_str::<SyncSettings>(r#"{ "cooldown": 1 }"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn settings_validate_rejects_zero_page_size() {
        let settings = SyncSettings {
            incremental_page_size: 0,
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load_from_path(&tmp.path().join("sync.json")).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn normalize_rest_url_appends_rest_path() {
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/rest/v1").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert!(normalize_rest_url("demo.supabase.co").is_err());
    }

    #[test]
    fn remote_config_requires_both_halves() {
        assert_eq!(RemoteConfig::default().resolve().unwrap(), None);

        let half = RemoteConfig {
            supabase_url: Some("https://demo.supabase.co".to_string()),
            supabase_anon_key: Some("  ".to_string()),
        };
        assert!(half.resolve().is_err());
    }
}
