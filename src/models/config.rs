use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Bearer token forwarded to the remote backend, if any.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Fail a job that is still pending this long after it was created.
    /// `None` polls until a terminal state is reported or the job is cleared.
    #[serde(default)]
    pub job_deadline_secs: Option<u64>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_idle_interval_ms() -> u64 {
    1000
}

fn default_max_snapshots() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            backend_url: default_backend_url(),
            api_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            max_snapshots: default_max_snapshots(),
            request_timeout_secs: default_request_timeout_secs(),
            job_deadline_secs: None,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Deadline in milliseconds, matching the epoch-ms job timestamps.
    pub fn job_deadline_ms(&self) -> Option<i64> {
        self.job_deadline_secs
            .map(|secs| i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX))
    }

    /// Apply `SIRIUS_BACKEND_URL` / `SIRIUS_API_TOKEN` on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SIRIUS_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend_url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("SIRIUS_API_TOKEN") {
            if !token.trim().is_empty() {
                self.api_token = Some(token.trim().to_string());
            }
        }
    }
}
