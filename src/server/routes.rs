use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::models::Connection;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Parse a connection id path segment, answering 400 on garbage.
fn parse_connection_id(raw: &str) -> Result<i64, Response> {
    raw.trim().parse::<i64>().map_err(|_| {
        tracing::warn!("Invalid connection id: '{}'", raw);
        error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            &format!("'{}' is not a valid connection id", raw),
        )
    })
}

// ---------------------------------------------------------------------------
// Query params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct StartSyncParams {
    #[serde(rename = "type")]
    pub connection_type: Option<String>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/sync-jobs
pub async fn list_sync_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.store.view().await))
}

/// GET /api/sync-jobs/{connection_id}
pub async fn get_sync_job(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Response {
    let connection_id = match parse_connection_id(&connection_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.store.job(connection_id).await {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No sync job for connection {}", connection_id),
        ),
    }
}

/// DELETE /api/sync-jobs/{connection_id}
///
/// Clearing an absent job is not an error.
pub async fn clear_sync_job(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Response {
    let connection_id = match parse_connection_id(&connection_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    state.store.clear_job(connection_id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// POST /api/connections/{id}/sync?type=...
pub async fn start_sync(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Query(params): Query<StartSyncParams>,
) -> Response {
    let connection_id = match parse_connection_id(&connection_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let mut connection = Connection::new(connection_id, params.connection_type.as_deref());
    connection.name = params.name.filter(|n| !n.trim().is_empty());

    match state.store.start_connection_sync(&connection).await {
        Some(started) => (StatusCode::ACCEPTED, Json(started)).into_response(),
        None => error_response(
            StatusCode::BAD_GATEWAY,
            "sync_not_started",
            &format!("Backend did not start a sync for connection {}", connection_id),
        ),
    }
}

/// POST /api/shutdown
pub async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested");

    if let Some(ref tx) = state.shutdown_tx {
        let _ = tx.send(());
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "Shutdown initiated",
        })),
    )
}
