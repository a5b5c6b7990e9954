use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub queue_length: usize,
    pub worker_idle: bool,
    pub backend_url: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let view = state.store.view().await;
    let active_jobs = view
        .jobs_by_connection_id
        .values()
        .filter(|j| j.is_active())
        .count();

    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        total_jobs: view.jobs_by_connection_id.len(),
        active_jobs,
        queue_length: view.queue.len(),
        worker_idle: state.store.is_worker_idle(),
        backend_url: state.config.backend_url.clone(),
        data_dir,
    };

    (StatusCode::OK, Json(response))
}
