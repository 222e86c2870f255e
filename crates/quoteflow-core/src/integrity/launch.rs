//! Launch counter kept beside the database so a store wipe cannot reset it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchState {
    /// Launches since the last confirmed healthy run
    pub consecutive_launches: u32,
    pub last_launch_at: Option<String>,
    pub last_stable_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchTracker {
    path: PathBuf,
}

impl LaunchTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state counts as a first launch.
    pub fn load(&self) -> LaunchState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return LaunchState::default();
            }
            Err(error) => {
                tracing::warn!("Could not read {}: {}", self.path.display(), error);
                return LaunchState::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|error| {
            tracing::warn!("Ignoring malformed {}: {}", self.path.display(), error);
            LaunchState::default()
        })
    }

    pub fn save(&self, state: &LaunchState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
