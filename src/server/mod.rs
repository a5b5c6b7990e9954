pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::store::SyncJobStore;
use crate::models::SyncConfig;

/// Shared application state for the Axum server.
pub struct AppState {
    pub store: Arc<SyncJobStore>,
    pub config: Arc<SyncConfig>,
    pub start_time: Instant,
    pub shutdown_tx: Option<tokio::sync::watch::Sender<()>>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/sync-jobs", get(routes::list_sync_jobs))
        .route(
            "/api/sync-jobs/{connection_id}",
            get(routes::get_sync_job).delete(routes::clear_sync_job),
        )
        .route("/api/connections/{id}/sync", post(routes::start_sync))
        .route("/api/events", get(sse::sse_handler))
        .route("/api/shutdown", post(routes::shutdown))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
