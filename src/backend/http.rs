use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CACHE_CONTROL;
use reqwest::{Client, Response, Url};
use serde_json::{json, Value};

use super::{BackendResponse, SyncBackend};
use crate::errors::SyncError;
use crate::models::{Connection, SyncConfig};

/// [`SyncBackend`] speaking HTTP to the analytics backend.
///
/// - start: `POST {base}/connections/{id}/sync[?type=..]` with body `{}`
/// - poll:  `GET {base}/connections/sync/{ticket}[?type=..]`
#[derive(Clone)]
pub struct HttpSyncBackend {
    http: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpSyncBackend {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base_url = Url::parse(&config.backend_url).map_err(|e| {
            SyncError::Validation(format!("Invalid backend url '{}': {}", config.backend_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Validation(format!(
                "Backend url '{}' cannot be used as a base",
                config.backend_url
            ))
            .into());
        }

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Join `segments` onto the base url, percent-encoding each one.
    fn endpoint(&self, segments: &[&str], connection_type: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Validation("Backend url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        if let Some(t) = connection_type {
            url.query_pairs_mut().append_pair("type", t);
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Read the status and JSON body. A missing or malformed body becomes `{}`.
async fn decode_response(response: Response) -> Result<BackendResponse> {
    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(SyncError::from)
        .context("Failed to read backend response body")?;

    if text.trim().is_empty() {
        return Ok(BackendResponse::new(status, json!({})));
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(body) => Ok(BackendResponse::new(status, body)),
        Err(e) => Ok(BackendResponse {
            status,
            body: json!({}),
            decode_error: Some(format!("Invalid JSON from backend: {}", e)),
        }),
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn start_sync(&self, connection: &Connection) -> Result<BackendResponse> {
        let id = connection.id.to_string();
        let url = self.endpoint(
            &["connections", &id, "sync"],
            connection.connection_type.as_deref(),
        )?;
        tracing::debug!("POST {}", url);

        let response = self
            .authorize(self.http.post(url))
            .json(&json!({}))
            .send()
            .await
            .map_err(SyncError::from)?;

        decode_response(response).await
    }

    async fn poll_ticket(
        &self,
        ticket: &str,
        connection_type: Option<&str>,
    ) -> Result<BackendResponse> {
        let url = self.endpoint(&["connections", "sync", ticket], connection_type)?;
        tracing::debug!("GET {}", url);

        let response = self
            .authorize(self.http.get(url))
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(SyncError::from)?;

        decode_response(response).await
    }
}
