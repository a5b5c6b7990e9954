use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};

use crate::backend::SyncBackend;
use crate::daemon::clock::Clock;
use crate::daemon::events::SyncEvent;
use crate::models::{
    extract_ticket, Connection, SyncConfig, SyncJob, SyncJobStatus, SyncSnapshot, TicketState,
};
use crate::storage::{PersistedState, StateStore};

/// Returned by [`SyncJobStore::start_connection_sync`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartedSync {
    pub ticket: String,
    /// True when an already active job was returned instead of starting a new one.
    pub reused: bool,
}

/// Result of one poll, as the worker hands it to the store.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub state: TicketState,
    pub payload: Value,
    pub error: Option<String>,
}

/// Single source of truth for sync jobs and the ticket queue.
///
/// Every mutation is applied under one write lock, then the whole state is
/// persisted and an event is broadcast. The lock is never held across a
/// backend call.
pub struct SyncJobStore {
    state: RwLock<PersistedState>,
    backend: Arc<dyn SyncBackend>,
    persistence: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<SyncEvent>,
    wake: Notify,
    start_lock: Mutex<()>,
    persist_lock: Mutex<()>,
    worker_idle: AtomicBool,
    max_snapshots: usize,
}

impl SyncJobStore {
    /// Load persisted state and build the store.
    pub async fn open(
        backend: Arc<dyn SyncBackend>,
        persistence: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let mut state = persistence.load().await?;
        let fixes = state.repair();
        if fixes > 0 {
            tracing::warn!("Repaired {} inconsistencies in persisted sync jobs", fixes);
        }
        tracing::info!(
            "Restored {} sync job(s), {} ticket(s) queued",
            state.jobs_by_connection_id.len(),
            state.queue.len()
        );

        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Ok(Self {
            state: RwLock::new(state),
            backend,
            persistence,
            clock,
            event_tx,
            wake: Notify::new(),
            start_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            worker_idle: AtomicBool::new(true),
            max_snapshots: config.max_snapshots.max(1),
        })
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a backend sync for `connection`, or return the active job's ticket.
    ///
    /// Returns `None` when the backend could not be reached, answered with a
    /// non-2xx status, or did not hand out a ticket. Nothing is recorded then.
    pub async fn start_connection_sync(&self, connection: &Connection) -> Option<StartedSync> {
        // Serializes starts so a connection never gets two backend requests.
        let _guard = self.start_lock.lock().await;

        if let Some(ticket) = self.active_ticket(connection.id).await {
            tracing::debug!(
                "Connection {} already has an active sync ({})",
                connection.id,
                ticket
            );
            return Some(StartedSync {
                ticket,
                reused: true,
            });
        }

        let response = match self.backend.start_sync(connection).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Failed to start sync for connection {}: {:#}", connection.id, e);
                return None;
            }
        };

        if !response.is_success() {
            tracing::warn!(
                "Backend refused sync for connection {} (HTTP {})",
                connection.id,
                response.status
            );
            return None;
        }

        let Some(ticket) = extract_ticket(&response.body) else {
            tracing::warn!(
                "Backend accepted sync for connection {} but returned no ticket",
                connection.id
            );
            return None;
        };

        let job = SyncJob::queued(ticket.clone(), connection, response.body, self.clock.now_ms());
        if !self.enqueue_ticket(job).await {
            return self
                .active_ticket(connection.id)
                .await
                .map(|ticket| StartedSync {
                    ticket,
                    reused: true,
                });
        }

        tracing::info!(
            "Sync started for connection {}{} (ticket {})",
            connection.id,
            connection
                .name
                .as_deref()
                .map(|n| format!(" '{}'", n))
                .unwrap_or_default(),
            ticket
        );
        self.wake_worker();

        Some(StartedSync {
            ticket,
            reused: false,
        })
    }

    /// Record `job` and append its ticket to the queue.
    ///
    /// Refuses when the connection already has an active job, when the ticket
    /// is already queued or owned by another connection's job, or when `job`
    /// itself is terminal.
    pub async fn enqueue_ticket(&self, job: SyncJob) -> bool {
        let event = {
            let mut state = self.state.write().await;

            if !job.is_active() {
                return false;
            }
            if state
                .jobs_by_connection_id
                .get(&job.connection_id)
                .is_some_and(SyncJob::is_active)
            {
                tracing::debug!(
                    "Not enqueueing {}: connection {} already has an active job",
                    job.ticket,
                    job.connection_id
                );
                return false;
            }
            if state.queue.iter().any(|t| *t == job.ticket) {
                tracing::debug!("Not enqueueing {}: ticket already queued", job.ticket);
                return false;
            }
            if let Some(owner) = state
                .jobs_by_connection_id
                .values()
                .find(|other| other.ticket == job.ticket && other.connection_id != job.connection_id)
            {
                tracing::warn!(
                    "Not enqueueing {}: ticket already belongs to connection {}",
                    job.ticket,
                    owner.connection_id
                );
                return false;
            }

            let event = SyncEvent::Queued {
                connection_id: job.connection_id,
                ticket: job.ticket.clone(),
                timestamp: Utc::now(),
            };
            state.queue.push_back(job.ticket.clone());
            state.jobs_by_connection_id.insert(job.connection_id, job);
            event
        };

        self.persist().await;
        self.emit(event);
        true
    }

    /// Forget the job for `connection_id` and unqueue its ticket. No-op if absent.
    pub async fn clear_job(&self, connection_id: i64) -> Option<SyncJob> {
        let job = {
            let mut state = self.state.write().await;
            let job = state.jobs_by_connection_id.remove(&connection_id)?;
            state.queue.retain(|t| *t != job.ticket);
            job
        };

        self.persist().await;
        self.emit(SyncEvent::Cleared {
            connection_id,
            ticket: job.ticket.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!("Cleared sync job for connection {}", connection_id);
        Some(job)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn job(&self, connection_id: i64) -> Option<SyncJob> {
        self.state
            .read()
            .await
            .jobs_by_connection_id
            .get(&connection_id)
            .cloned()
    }

    pub async fn jobs(&self) -> Vec<SyncJob> {
        self.state
            .read()
            .await
            .jobs_by_connection_id
            .values()
            .cloned()
            .collect()
    }

    pub async fn queue(&self) -> Vec<String> {
        self.state.read().await.queue.iter().cloned().collect()
    }

    /// The whole `{ jobsByConnectionId, queue }` state.
    pub async fn view(&self) -> PersistedState {
        self.state.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_worker_idle(&self) -> bool {
        self.worker_idle.load(Ordering::SeqCst)
    }

    async fn active_ticket(&self, connection_id: i64) -> Option<String> {
        self.state
            .read()
            .await
            .jobs_by_connection_id
            .get(&connection_id)
            .filter(|job| job.is_active())
            .map(|job| job.ticket.clone())
    }

    // -----------------------------------------------------------------------
    // Worker-facing primitives
    // -----------------------------------------------------------------------

    pub(crate) fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn set_worker_idle(&self, idle: bool) {
        self.worker_idle.store(idle, Ordering::SeqCst);
    }

    /// Wake the worker if it is waiting for work.
    pub fn wake_worker(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// Head-of-queue ticket and the job it references, if any.
    pub(crate) async fn head_of_queue(&self) -> Option<(String, Option<SyncJob>)> {
        let state = self.state.read().await;
        let ticket = state.queue.front()?.clone();
        let mut owners = state
            .jobs_by_connection_id
            .values()
            .filter(|job| job.ticket == ticket);
        let first = owners.next();
        // Prefer an active owner so a stale terminal job never shadows it.
        let job = first
            .filter(|job| job.is_active())
            .or_else(|| owners.find(|job| job.is_active()))
            .or(first)
            .cloned();
        Some((ticket, job))
    }

    /// Remove a ticket whose job vanished or is already terminal.
    pub(crate) async fn drop_ticket(&self, ticket: &str) {
        {
            let mut state = self.state.write().await;
            let before = state.queue.len();
            state.queue.retain(|t| t != ticket);
            if state.queue.len() == before {
                return;
            }
        }

        self.persist().await;
        self.emit(SyncEvent::TicketDropped {
            ticket: ticket.to_string(),
            timestamp: Utc::now(),
        });
        tracing::debug!("Dropped orphaned ticket {}", ticket);
    }

    /// Move a queued job to `running`. Returns the updated job.
    pub(crate) async fn mark_running(&self, connection_id: i64, ticket: &str) -> Option<SyncJob> {
        let now = self.clock.now_ms();
        let job = {
            let mut state = self.state.write().await;
            let job = state
                .jobs_by_connection_id
                .get_mut(&connection_id)
                .filter(|job| job.ticket == ticket)?;
            if job.status != SyncJobStatus::Queued {
                return Some(job.clone());
            }
            job.status = SyncJobStatus::Running;
            job.updated_at = now;
            job.clone()
        };

        self.persist().await;
        self.emit(SyncEvent::Running {
            connection_id,
            ticket: ticket.to_string(),
            timestamp: Utc::now(),
        });
        Some(job)
    }

    /// Apply a poll result. Returns the job's status afterwards, or `None`
    /// when the job was cleared or replaced while the poll was in flight.
    pub(crate) async fn record_poll(
        &self,
        connection_id: i64,
        ticket: &str,
        outcome: PollOutcome,
    ) -> Option<SyncJobStatus> {
        let now = self.clock.now_ms();
        let (event, status) = {
            let mut state = self.state.write().await;
            let job = state
                .jobs_by_connection_id
                .get_mut(&connection_id)
                .filter(|job| job.ticket == ticket)?;
            if job.status.is_terminal() {
                return Some(job.status);
            }

            let failure = failure_reason(&outcome.payload);
            job.push_snapshot(
                SyncSnapshot {
                    at: now,
                    data: outcome.payload,
                },
                self.max_snapshots,
            );
            job.updated_at = now;
            if let Some(error) = outcome.error {
                job.last_error = Some(error);
            }

            let timestamp = Utc::now();
            let event = match outcome.state {
                TicketState::Completed => {
                    job.status = SyncJobStatus::Completed;
                    SyncEvent::Completed {
                        connection_id,
                        ticket: ticket.to_string(),
                        timestamp,
                    }
                }
                TicketState::Failed => {
                    job.status = SyncJobStatus::Failed;
                    SyncEvent::Failed {
                        connection_id,
                        ticket: ticket.to_string(),
                        error: failure,
                        timestamp,
                    }
                }
                TicketState::Pending => {
                    job.status = SyncJobStatus::Running;
                    SyncEvent::Polled {
                        connection_id,
                        ticket: ticket.to_string(),
                        snapshots: job.snapshots.len(),
                        error: job.last_error.clone(),
                        timestamp,
                    }
                }
            };

            let status = job.status;
            if status.is_terminal() {
                state.queue.retain(|t| t != ticket);
            }
            (event, status)
        };

        self.persist().await;
        self.emit(event);
        Some(status)
    }

    /// Fail an active job without polling it. Returns false if it is gone.
    pub(crate) async fn fail_job(&self, connection_id: i64, ticket: &str, reason: &str) -> bool {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.write().await;
            let Some(job) = state
                .jobs_by_connection_id
                .get_mut(&connection_id)
                .filter(|job| job.ticket == ticket && job.is_active())
            else {
                return false;
            };
            job.status = SyncJobStatus::Failed;
            job.updated_at = now;
            job.last_error = Some(reason.to_string());
            state.queue.retain(|t| t != ticket);
        }

        self.persist().await;
        self.emit(SyncEvent::Failed {
            connection_id,
            ticket: ticket.to_string(),
            error: Some(reason.to_string()),
            timestamp: Utc::now(),
        });
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Write the current state. Saves are serialized and always write the
    /// latest state, so an older snapshot never overwrites a newer one.
    ///
    /// Best-effort: a failed write is logged and the in-memory state stays authoritative.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.state.read().await.clone();
        if let Err(e) = self.persistence.save(&snapshot).await {
            tracing::error!("Failed to persist sync jobs: {:#}", e);
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// Human-readable reason carried by a failed ticket payload, if any.
fn failure_reason(payload: &Value) -> Option<String> {
    ["error", "message", "detail"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResponse, ScriptedBackend};
    use crate::daemon::clock::FakeClock;
    use async_trait::async_trait;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // InMemoryStateStore - test double
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct InMemoryStateStore {
        saved: RwLock<Option<PersistedState>>,
        saves: std::sync::atomic::AtomicUsize,
        fail_saves: bool,
    }

    #[async_trait]
    impl StateStore for InMemoryStateStore {
        async fn load(&self) -> Result<PersistedState> {
            Ok(self.saved.read().await.clone().unwrap_or_default())
        }

        async fn save(&self, state: &PersistedState) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves {
                anyhow::bail!("disk full");
            }
            *self.saved.write().await = Some(state.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: SyncJobStore,
        backend: Arc<ScriptedBackend>,
        persistence: Arc<InMemoryStateStore>,
    }

    async fn fixture_with(persistence: InMemoryStateStore) -> Fixture {
        let backend = Arc::new(ScriptedBackend::new());
        let persistence = Arc::new(persistence);
        let store = SyncJobStore::open(
            Arc::clone(&backend) as Arc<dyn SyncBackend>,
            Arc::clone(&persistence) as Arc<dyn StateStore>,
            Arc::new(FakeClock::new(1_000)),
            &SyncConfig::default(),
        )
        .await
        .expect("open store");
        Fixture {
            store,
            backend,
            persistence,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(InMemoryStateStore::default()).await
    }

    fn repo(id: i64) -> Connection {
        Connection::new(id, Some("repository"))
    }

    async fn assert_consistent(store: &SyncJobStore) {
        let view = store.view().await;
        for ticket in &view.queue {
            assert!(
                view.jobs_by_connection_id
                    .values()
                    .any(|j| &j.ticket == ticket),
                "queued ticket {} has no job",
                ticket
            );
            assert_eq!(view.queue.iter().filter(|t| *t == ticket).count(), 1);
        }
        for job in view.jobs_by_connection_id.values() {
            if job.is_active() {
                assert_eq!(view.queue.iter().filter(|t| **t == job.ticket).count(), 1);
            }
        }
    }

    #[tokio::test]
    async fn test_start_creates_queued_job() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1");

        let started = f
            .store
            .start_connection_sync(&repo(7))
            .await
            .expect("started");
        assert_eq!(started.ticket, "tk-1");
        assert!(!started.reused);

        let job = f.store.job(7).await.expect("job");
        assert_eq!(job.status, SyncJobStatus::Queued);
        assert_eq!(job.connection_type.as_deref(), Some("repository"));
        assert_eq!(job.created_at, 1_000);
        assert_eq!(job.snapshots.len(), 1);
        assert_eq!(job.snapshots[0].data, json!({"ticket": "tk-1"}));
        assert_eq!(f.store.queue().await, vec!["tk-1".to_string()]);

        let calls = f.backend.start_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].connection_type.as_deref(), Some("repository"));
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_duplicate_start_returns_same_ticket() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1").push_start_ticket("tk-2");

        let first = f.store.start_connection_sync(&repo(7)).await.expect("first");
        let second = f.store.start_connection_sync(&repo(7)).await.expect("second");
        assert_eq!(first.ticket, second.ticket);
        assert!(second.reused);
        assert_eq!(f.store.jobs().await.len(), 1);
        assert_eq!(f.backend.start_calls().len(), 1);
        assert_eq!(f.store.queue().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_issue_one_request() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1").push_start_ticket("tk-2");

        let (first, second) = (repo(7), repo(7));
        let (a, b) = tokio::join!(
            f.store.start_connection_sync(&first),
            f.store.start_connection_sync(&second)
        );
        assert_eq!(a.expect("a").ticket, "tk-1");
        assert_eq!(b.expect("b").ticket, "tk-1");
        assert_eq!(f.backend.start_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ticket_owned_by_other_connection_is_refused() {
        let f = fixture().await;
        f.backend.push_start_ticket("x").push_start_ticket("x");

        f.store.start_connection_sync(&repo(1)).await.expect("first");
        assert!(f
            .store
            .record_poll(
                1,
                "x",
                PollOutcome {
                    state: TicketState::Completed,
                    payload: json!({"status": "completed"}),
                    error: None,
                },
            )
            .await
            .is_some());

        // The backend hands connection 2 the ticket connection 1 still holds.
        assert!(f.store.start_connection_sync(&repo(2)).await.is_none());
        assert!(f.store.job(2).await.is_none());
        assert!(f.store.queue().await.is_empty());
        assert_eq!(
            f.store.job(1).await.expect("job 1").status,
            SyncJobStatus::Completed
        );
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_restart_on_same_connection_may_reuse_ticket() {
        let f = fixture().await;
        f.backend.push_start_ticket("x").push_start_ticket("x");

        f.store.start_connection_sync(&repo(1)).await.expect("first");
        assert!(f.store.fail_job(1, "x", "gave up").await);

        let again = f.store.start_connection_sync(&repo(1)).await.expect("again");
        assert_eq!(again.ticket, "x");
        assert!(!again.reused);
        assert_eq!(
            f.store.job(1).await.expect("job 1").status,
            SyncJobStatus::Queued
        );
        assert_eq!(f.store.queue().await, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_head_of_queue_prefers_active_owner() {
        let f = fixture().await;
        let mut stale = SyncJob::queued("x".to_string(), &repo(1), json!({}), 1);
        stale.status = SyncJobStatus::Completed;
        let mut state = PersistedState::default();
        state.jobs_by_connection_id.insert(1, stale);
        state
            .jobs_by_connection_id
            .insert(2, SyncJob::queued("x".to_string(), &repo(2), json!({}), 2));
        state.queue.push_back("x".to_string());
        *f.store.state.write().await = state;

        let (ticket, job) = f.store.head_of_queue().await.expect("head");
        assert_eq!(ticket, "x");
        let job = job.expect("owner");
        assert_eq!(job.connection_id, 2);
        assert!(job.is_active());
    }

    #[tokio::test]
    async fn test_start_failures_record_nothing() {
        let f = fixture().await;
        f.backend
            .push_start_error("connection refused")
            .push_start(BackendResponse::new(500, json!({"ticket": "tk-x"})))
            .push_start(BackendResponse::ok(json!({"status": "accepted"})))
            .push_start(BackendResponse::ok(json!({"ticket": ""})));

        for _ in 0..4 {
            assert!(f.store.start_connection_sync(&repo(7)).await.is_none());
        }
        assert!(f.store.jobs().await.is_empty());
        assert!(f.store.queue().await.is_empty());
        assert_eq!(f.persistence.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_extracts_job_id() {
        let f = fixture().await;
        f.backend
            .push_start(BackendResponse::new(202, json!({"job_id": "job-3", "id": "x"})));
        let started = f.store.start_connection_sync(&repo(3)).await.expect("started");
        assert_eq!(started.ticket, "job-3");
    }

    #[tokio::test]
    async fn test_start_after_terminal_replaces_job() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1").push_start_ticket("tk-2");

        f.store.start_connection_sync(&repo(7)).await.expect("first");
        let status = f
            .store
            .record_poll(
                7,
                "tk-1",
                PollOutcome {
                    state: TicketState::Completed,
                    payload: json!({"status": "completed"}),
                    error: None,
                },
            )
            .await;
        assert_eq!(status, Some(SyncJobStatus::Completed));

        let second = f.store.start_connection_sync(&repo(7)).await.expect("second");
        assert_eq!(second.ticket, "tk-2");
        assert!(!second.reused);
        assert_eq!(f.store.job(7).await.expect("job").status, SyncJobStatus::Queued);
        assert_eq!(f.store.queue().await, vec!["tk-2".to_string()]);
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_enqueue_refuses_active_duplicate_and_queued_ticket() {
        let f = fixture().await;
        let job = SyncJob::queued("a".to_string(), &repo(1), json!({}), 1);
        assert!(f.store.enqueue_ticket(job.clone()).await);
        // same connection, still active
        let other = SyncJob::queued("b".to_string(), &repo(1), json!({}), 2);
        assert!(!f.store.enqueue_ticket(other).await);
        // different connection, same ticket
        let same_ticket = SyncJob::queued("a".to_string(), &repo(2), json!({}), 3);
        assert!(!f.store.enqueue_ticket(same_ticket).await);
        // terminal job
        let mut done = SyncJob::queued("c".to_string(), &repo(3), json!({}), 4);
        done.status = SyncJobStatus::Completed;
        assert!(!f.store.enqueue_ticket(done).await);

        assert_eq!(f.store.queue().await, vec!["a".to_string()]);
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_clear_job_removes_job_and_ticket() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1").push_start_ticket("tk-2");
        f.store.start_connection_sync(&repo(7)).await.expect("a");
        f.store.start_connection_sync(&repo(8)).await.expect("b");

        let cleared = f.store.clear_job(7).await.expect("cleared");
        assert_eq!(cleared.ticket, "tk-1");
        assert!(f.store.job(7).await.is_none());
        assert_eq!(f.store.queue().await, vec!["tk-2".to_string()]);
        assert_consistent(&f.store).await;

        // absent job is a no-op
        assert!(f.store.clear_job(7).await.is_none());
        assert!(f.store.clear_job(12345).await.is_none());
    }

    #[tokio::test]
    async fn test_events_for_start_and_clear() {
        let f = fixture().await;
        let mut rx = f.store.subscribe();
        f.backend.push_start_ticket("tk-1");

        f.store.start_connection_sync(&repo(7)).await.expect("start");
        f.store.clear_job(7).await.expect("clear");

        match rx.recv().await.expect("queued") {
            SyncEvent::Queued {
                connection_id,
                ticket,
                ..
            } => {
                assert_eq!(connection_id, 7);
                assert_eq!(ticket, "tk-1");
            }
            other => panic!("Expected Queued, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.expect("cleared"),
            SyncEvent::Cleared { connection_id: 7, .. }
        ));
    }

    #[tokio::test]
    async fn test_record_poll_pending_keeps_ticket_and_error() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1");
        f.store.start_connection_sync(&repo(7)).await.expect("start");
        f.store.mark_running(7, "tk-1").await.expect("running");

        let status = f
            .store
            .record_poll(
                7,
                "tk-1",
                PollOutcome {
                    state: TicketState::Pending,
                    payload: json!({}),
                    error: Some("HTTP 502".to_string()),
                },
            )
            .await;
        assert_eq!(status, Some(SyncJobStatus::Running));

        // A later clean poll keeps the last error around.
        f.store
            .record_poll(
                7,
                "tk-1",
                PollOutcome {
                    state: TicketState::Pending,
                    payload: json!({"status": "running"}),
                    error: None,
                },
            )
            .await;

        let job = f.store.job(7).await.expect("job");
        assert_eq!(job.status, SyncJobStatus::Running);
        assert_eq!(job.last_error.as_deref(), Some("HTTP 502"));
        assert_eq!(job.snapshots.len(), 3);
        assert_eq!(f.store.queue().await, vec!["tk-1".to_string()]);
    }

    #[tokio::test]
    async fn test_record_poll_failed_dequeues_with_reason() {
        let f = fixture().await;
        let mut rx = f.store.subscribe();
        f.backend.push_start_ticket("tk-1");
        f.store.start_connection_sync(&repo(7)).await.expect("start");

        let status = f
            .store
            .record_poll(
                7,
                "tk-1",
                PollOutcome {
                    state: TicketState::Failed,
                    payload: json!({"error": "token expired"}),
                    error: None,
                },
            )
            .await;
        assert_eq!(status, Some(SyncJobStatus::Failed));
        assert!(f.store.queue().await.is_empty());

        let _queued = rx.recv().await.expect("queued");
        match rx.recv().await.expect("failed") {
            SyncEvent::Failed { error, .. } => assert_eq!(error.as_deref(), Some("token expired")),
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_record_poll_is_discarded_for_replaced_ticket() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1");
        f.store.start_connection_sync(&repo(7)).await.expect("start");

        let outcome = PollOutcome {
            state: TicketState::Completed,
            payload: json!({"done": true}),
            error: None,
        };
        assert_eq!(f.store.record_poll(7, "other", outcome.clone()).await, None);
        assert_eq!(f.store.record_poll(99, "tk-1", outcome).await, None);
        assert_eq!(f.store.job(7).await.expect("job").status, SyncJobStatus::Queued);
    }

    #[tokio::test]
    async fn test_terminal_job_is_never_modified() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1");
        f.store.start_connection_sync(&repo(7)).await.expect("start");
        assert!(f.store.fail_job(7, "tk-1", "sync deadline exceeded").await);

        let before = f.store.job(7).await.expect("job");
        let status = f
            .store
            .record_poll(
                7,
                "tk-1",
                PollOutcome {
                    state: TicketState::Completed,
                    payload: json!({"status": "completed"}),
                    error: None,
                },
            )
            .await;
        assert_eq!(status, Some(SyncJobStatus::Failed));
        assert_eq!(f.store.job(7).await.expect("job"), before);
        assert!(!f.store.fail_job(7, "tk-1", "again").await);
        assert!(f.store.mark_running(7, "tk-1").await.is_some_and(|j| j.status == SyncJobStatus::Failed));
    }

    #[tokio::test]
    async fn test_drop_ticket_only_removes_named_ticket() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1").push_start_ticket("tk-2");
        f.store.start_connection_sync(&repo(1)).await.expect("a");
        f.store.start_connection_sync(&repo(2)).await.expect("b");

        f.store.drop_ticket("tk-2").await;
        assert_eq!(f.store.queue().await, vec!["tk-1".to_string()]);
        f.store.drop_ticket("missing").await;
        assert_eq!(f.store.queue().await, vec!["tk-1".to_string()]);
    }

    #[tokio::test]
    async fn test_state_is_persisted_and_restored() {
        let f = fixture().await;
        f.backend.push_start_ticket("tk-1");
        f.store.start_connection_sync(&repo(7)).await.expect("start");

        let saved = f.persistence.saved.read().await.clone().expect("saved");
        assert_eq!(saved.queue, vec!["tk-1".to_string()]);

        let reopened = fixture_with(InMemoryStateStore {
            saved: RwLock::new(Some(saved)),
            ..Default::default()
        })
        .await;
        assert_eq!(reopened.store.job(7).await.expect("job").ticket, "tk-1");
        assert_eq!(reopened.store.queue().await, vec!["tk-1".to_string()]);
    }

    #[tokio::test]
    async fn test_open_repairs_inconsistent_state() {
        let mut saved = PersistedState::default();
        saved.queue.push_back("ghost".to_string());
        let job = SyncJob::queued("tk-1".to_string(), &repo(7), json!({}), 1);
        saved.jobs_by_connection_id.insert(7, job);

        let f = fixture_with(InMemoryStateStore {
            saved: RwLock::new(Some(saved)),
            ..Default::default()
        })
        .await;
        assert_eq!(f.store.queue().await, vec!["tk-1".to_string()]);
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_abort() {
        let f = fixture_with(InMemoryStateStore {
            fail_saves: true,
            ..Default::default()
        })
        .await;
        f.backend.push_start_ticket("tk-1");

        let started = f.store.start_connection_sync(&repo(7)).await;
        assert!(started.is_some());
        assert!(f.store.job(7).await.is_some());
        assert!(f.persistence.saves.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_failure_reason_prefers_error_then_message() {
        assert_eq!(failure_reason(&json!({"error": "boom", "message": "m"})).as_deref(), Some("boom"));
        assert_eq!(failure_reason(&json!({"error": true, "message": "m"})).as_deref(), Some("m"));
        assert_eq!(failure_reason(&json!({"detail": "d"})).as_deref(), Some("d"));
        assert_eq!(failure_reason(&json!({"status": "failed"})), None);
        assert_eq!(failure_reason(&json!("failed")), None);
    }
}
