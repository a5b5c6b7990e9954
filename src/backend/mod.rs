pub mod http;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::Connection;

pub use http::HttpSyncBackend;
pub use mock::ScriptedBackend;

/// A decoded response from the remote backend.
///
/// Transport failures are reported as `Err` by [`SyncBackend`]; anything that
/// produced an HTTP status ends up here, including non-2xx answers.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    /// Parsed JSON body, `{}` when the body was empty or not JSON.
    pub body: Value,
    /// Set when the body could not be decoded as JSON.
    pub decode_error: Option<String>,
}

impl BackendResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            decode_error: None,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The remote service that runs syncs and reports ticket progress.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Ask the backend to start syncing `connection`.
    async fn start_sync(&self, connection: &Connection) -> Result<BackendResponse>;

    /// Fetch the current status payload for `ticket`.
    async fn poll_ticket(&self, ticket: &str, connection_type: Option<&str>)
        -> Result<BackendResponse>;
}
