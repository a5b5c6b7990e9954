use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{PersistedState, StateStore, STATE_KEY, STATE_VERSION};

/// Stores the job state as a single JSON document under the data directory.
pub struct JsonStateStore {
    file_path: PathBuf,
}

impl JsonStateStore {
    /// Create the store, making sure the data directory exists.
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .context("Failed to create data directory")?;

        Ok(Self {
            file_path: data_dir.join(format!("{}.json", STATE_KEY)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Copy the current file aside as `*.json.bak` before it gets replaced.
    async fn backup(&self) {
        let backup_path = self.file_path.with_extension("json.bak");
        if let Err(e) = tokio::fs::copy(&self.file_path, &backup_path).await {
            tracing::error!(
                "Failed to back up {}: {}",
                self.file_path.display(),
                e
            );
        }
    }

    /// Decode the file contents. `None` means the contents must be discarded.
    fn decode(&self, content: &str) -> Option<PersistedState> {
        let raw: Value = match serde_json::from_str(content) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    "{} is corrupted ({}), backing up and starting empty",
                    self.file_path.display(),
                    e
                );
                return None;
            }
        };

        let version = raw.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(STATE_VERSION)) {
            tracing::warn!(
                "{} has schema version {:?} (expected {}), backing up and starting empty",
                self.file_path.display(),
                version,
                STATE_VERSION
            );
            return None;
        }

        match serde_json::from_value::<PersistedState>(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(
                    "{} does not match the job layout ({}), backing up and starting empty",
                    self.file_path.display(),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self) -> Result<PersistedState> {
        if !self.file_path.exists() {
            return Ok(PersistedState::default());
        }

        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("Failed to read {}", self.file_path.display()))?;

        match self.decode(&content) {
            Some(state) => Ok(state),
            None => {
                self.backup().await;
                Ok(PersistedState::default())
            }
        }
    }

    /// Write to a .tmp file first, then rename over the real file.
    async fn save(&self, state: &PersistedState) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(state).context("Failed to serialize sync jobs")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary sync jobs file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary sync jobs file")?;

        Ok(())
    }
}
