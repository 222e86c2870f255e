//! Persistent CLI configuration with environment overrides.

use std::path::{Path, PathBuf};

use quoteflow_core::config::{RemoteConfig, SyncSettings};
use quoteflow_core::util::normalize_text_option;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "cli-config.json";

pub const ENV_CONFIG_PATH: &str = "QUOTEFLOW_CONFIG";
pub const ENV_SUPABASE_URL: &str = "QUOTEFLOW_SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "QUOTEFLOW_SUPABASE_ANON_KEY";
pub const ENV_USER_ID: &str = "QUOTEFLOW_USER_ID";
pub const ENV_ACCESS_TOKEN: &str = "QUOTEFLOW_ACCESS_TOKEN";

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Never written to disk; supplied through the environment
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl std::fmt::Debug for CliConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CliConfig")
            .field("version", &self.version)
            .field("remote", &self.remote.supabase_url)
            .field("user_id", &self.user_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("sync", &self.sync)
            .finish()
    }
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quoteflow")
        .join(CONFIG_FILE_NAME)
}

impl CliConfig {
    /// Load from `explicit`, `$QUOTEFLOW_CONFIG`, or the platform config dir.
    pub fn load(explicit: Option<&Path>) -> Result<Self, CliError> {
        let path = explicit.map_or_else(
            || {
                std::env::var_os(ENV_CONFIG_PATH)
                    .map_or_else(default_config_path, PathBuf::from)
            },
            Path::to_path_buf,
        );
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            CliError::Config(format!(
                "Failed to read config at {}: {}",
                path.display(),
                error
            ))
        })?;
        let mut config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            CliError::Config(format!(
                "Failed to parse config at {}: {}",
                path.display(),
                error
            ))
        })?;
        config
            .sync
            .validate()
            .map_err(|error| CliError::Config(error.to_string()))?;
        config.normalize();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        std::fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
        Ok(())
    }

    /// Apply `QUOTEFLOW_*` variables from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| normalize_text_option(lookup(key));

        if let Some(url) = read(ENV_SUPABASE_URL) {
            self.remote.supabase_url = Some(url);
        }
        if let Some(anon_key) = read(ENV_SUPABASE_ANON_KEY) {
            self.remote.supabase_anon_key = Some(anon_key);
        }
        if let Some(user_id) = read(ENV_USER_ID) {
            self.user_id = Some(user_id);
        }
        if let Some(token) = read(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
        self
    }

    fn normalize(&mut self) {
        self.remote.supabase_url = normalize_text_option(self.remote.supabase_url.take());
        self.remote.supabase_anon_key =
            normalize_text_option(self.remote.supabase_anon_key.take());
        self.user_id = normalize_text_option(self.user_id.take());
    }
}
