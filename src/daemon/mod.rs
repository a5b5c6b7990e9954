pub mod clock;
pub mod events;
pub mod store;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{HttpSyncBackend, SyncBackend};
use crate::daemon::clock::SystemClock;
use crate::daemon::events::SyncEvent;
use crate::daemon::store::SyncJobStore;
use crate::daemon::worker::SyncWorker;
use crate::models::SyncConfig;
use crate::server::{self, AppState};
use crate::storage::{JsonStateStore, StateStore};

/// Directory name used under the platform config and data dirs.
pub const APP_DIR_NAME: &str = "sirius-sync";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config_file(path: &Path) -> Result<SyncConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SyncConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the SyncConfig. Resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. SIRIUS_SYNC_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/sirius-sync/config.json)
///   4. {data_dir}/config.json
///   5. SyncConfig::default()
pub fn load_config(config_path: Option<&Path>) -> Result<SyncConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config_file(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    let mut candidates = Vec::new();
    if let Ok(config_dir) = std::env::var("SIRIUS_SYNC_CONFIG_DIR") {
        candidates.push(PathBuf::from(config_dir).join("config.json"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join(APP_DIR_NAME).join("config.json"));
    }
    candidates.push(resolve_data_dir(None).join("config.json"));

    if let Some(path) = candidates.iter().find(|p| p.exists()) {
        return read_config_file(path);
    }

    tracing::info!("No config file found, using defaults");
    Ok(SyncConfig::default())
}

/// Resolve the data directory: explicit override, then `SIRIUS_SYNC_DATA_DIR`,
/// then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("SIRIUS_SYNC_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

// ---------------------------------------------------------------------------
// Completion watcher
// ---------------------------------------------------------------------------

/// Log each terminal transition. Ends when the event channel closes.
pub fn spawn_completion_watcher(mut rx: broadcast::Receiver<SyncEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::Completed {
                    connection_id,
                    ticket,
                    ..
                }) => {
                    tracing::info!("Sync completed for connection {} ({})", connection_id, ticket);
                }
                Ok(SyncEvent::Failed {
                    connection_id,
                    ticket,
                    error,
                    ..
                }) => {
                    tracing::warn!(
                        "Sync failed for connection {} ({}): {}",
                        connection_id,
                        ticket,
                        error.as_deref().unwrap_or("no reason given")
                    );
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Completion watcher lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Daemon bootstrap
// ---------------------------------------------------------------------------

/// CLI-level overrides applied on top of the loaded config.
#[derive(Debug, Default, Clone)]
pub struct DaemonOverrides {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend_url: Option<String>,
}

/// Resolve the effective config: file, then environment, then CLI flags.
pub fn resolve_config(overrides: &DaemonOverrides) -> Result<SyncConfig> {
    let mut config = load_config(overrides.config_path.as_deref())?;
    config.apply_env_overrides();

    if let Some(ref h) = overrides.host {
        config.host = h.clone();
    }
    if let Some(p) = overrides.port {
        config.port = p;
    }
    if let Some(ref url) = overrides.backend_url {
        config.backend_url = url.clone();
    }

    let data_dir = match (&overrides.data_dir, &config.data_dir) {
        (Some(d), _) => d.clone(),
        (None, Some(d)) => d.clone(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir);

    Ok(config)
}

/// Run the daemon in the foreground until Ctrl+C, SIGTERM, or `POST /api/shutdown`.
///
/// Wires the JSON state store and HTTP backend into the job store, starts
/// the worker and completion watcher, then serves the API.
pub async fn start_daemon(overrides: DaemonOverrides) -> Result<()> {
    let config = resolve_config(&overrides)?;
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| resolve_data_dir(None));
    let config = Arc::new(config);

    let persistence = Arc::new(JsonStateStore::new(data_dir.clone()).await?) as Arc<dyn StateStore>;
    let backend = Arc::new(HttpSyncBackend::new(&config)?) as Arc<dyn SyncBackend>;
    tracing::info!("Using backend at {}", config.backend_url);

    let store = Arc::new(
        SyncJobStore::open(backend, persistence, Arc::new(SystemClock), &config)
            .await
            .context("Failed to open sync job store")?,
    );

    let watcher_handle = spawn_completion_watcher(store.subscribe());
    let worker = SyncWorker::new(Arc::clone(&store), &config).spawn();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        start_time: Instant::now(),
        shutdown_tx: Some(shutdown_tx.clone()),
    });

    let router = server::create_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!("Daemon started. Listening on http://{}", bind_addr);
    tracing::info!("Data directory: {}", data_dir.display());

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
            .ok();
    });

    let mut api_shutdown_rx = shutdown_tx.subscribe();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = api_shutdown_rx.changed() => {
                tracing::info!("Received API shutdown signal");
            }
        }
    }

    let _ = shutdown_tx.send(());

    // In-flight poll finishes first so its result is persisted.
    worker.stop().await;
    watcher_handle.abort();
    let _ = server_handle.await;

    tracing::info!("Daemon exited cleanly.");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_explicit_path() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 9100, "backend_url": "https://sirius.example.com/api"}"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.port, 9100);
        assert_eq!(config.backend_url, "https://sirius.example.com/api");
        assert_eq!(config.poll_interval_ms, 2000);
    }

    #[test]
    fn test_load_config_missing_explicit_path_errors() {
        let tmp = TempDir::new().expect("create temp dir");
        let err = load_config(Some(&tmp.path().join("nope.json")))
            .expect_err("should fail")
            .to_string();
        assert!(err.contains("Config file not found"), "got: {}", err);
    }

    #[test]
    fn test_load_config_invalid_json_errors() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write config");
        let err = load_config(Some(&path)).expect_err("should fail");
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_resolve_data_dir_override_wins() {
        let dir = PathBuf::from("/tmp/sirius-override");
        assert_eq!(resolve_data_dir(Some(&dir)), dir);
    }

    #[test]
    fn test_resolve_config_applies_cli_overrides() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9100, "host": "0.0.0.0"}"#).expect("write config");

        let overrides = DaemonOverrides {
            config_path: Some(path),
            data_dir: Some(tmp.path().join("data")),
            port: Some(9200),
            backend_url: Some("http://backend.local:9000".to_string()),
            ..Default::default()
        };
        let config = resolve_config(&overrides).expect("resolve");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9200);
        assert_eq!(config.backend_url, "http://backend.local:9000");
        assert_eq!(config.data_dir, Some(tmp.path().join("data")));
    }

    #[test]
    fn test_resolve_config_keeps_file_data_dir() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("config.json");
        let data_dir = tmp.path().join("from-file");
        std::fs::write(
            &path,
            serde_json::json!({ "data_dir": data_dir }).to_string(),
        )
        .expect("write config");

        let config = resolve_config(&DaemonOverrides {
            config_path: Some(path),
            ..Default::default()
        })
        .expect("resolve");
        assert_eq!(config.data_dir, Some(data_dir));
    }

    #[tokio::test]
    async fn test_completion_watcher_exits_when_channel_closes() {
        let (tx, rx) = broadcast::channel(16);
        let handle = spawn_completion_watcher(rx);

        tx.send(SyncEvent::Completed {
            connection_id: 1,
            ticket: "a".to_string(),
            timestamp: Utc::now(),
        })
        .expect("send");
        tx.send(SyncEvent::Failed {
            connection_id: 2,
            ticket: "b".to_string(),
            error: None,
            timestamp: Utc::now(),
        })
        .expect("send");
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("watcher should stop")
            .expect("join");
    }
}
