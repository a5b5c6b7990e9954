use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::daemon::store::{PollOutcome, SyncJobStore};
use crate::models::{normalize_ticket_state, SyncConfig, SyncJob, SyncJobStatus, TicketState};

/// `lastError` recorded when a job outlives `job_deadline_secs`.
pub const DEADLINE_EXCEEDED: &str = "sync deadline exceeded";

/// What a single worker iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing queued.
    Idle,
    /// The head ticket had no live job and was removed.
    Dropped { ticket: String },
    /// Polled; the backend still reports the ticket as pending.
    Pending { ticket: String },
    /// The job reached a terminal status and left the queue.
    Finished {
        ticket: String,
        status: SyncJobStatus,
    },
    /// The job was cleared or replaced while its poll was in flight.
    Discarded { ticket: String },
}

impl TickOutcome {
    /// Delay before the next iteration.
    pub fn delay(&self, poll_interval: Duration, idle_interval: Duration) -> Duration {
        match self {
            TickOutcome::Idle => idle_interval,
            TickOutcome::Pending { .. } => poll_interval,
            TickOutcome::Dropped { .. }
            | TickOutcome::Finished { .. }
            | TickOutcome::Discarded { .. } => Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncWorker
// ---------------------------------------------------------------------------

/// Background poller.
///
/// Always works on the head of the queue: it polls one ticket until the
/// backend reports a terminal state, then moves on to the next. Tickets
/// behind the head are never polled early.
pub struct SyncWorker {
    store: Arc<SyncJobStore>,
    poll_interval: Duration,
    idle_interval: Duration,
    deadline_ms: Option<i64>,
}

impl SyncWorker {
    pub fn new(store: Arc<SyncJobStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval(),
            idle_interval: config.idle_interval(),
            deadline_ms: config.job_deadline_ms(),
        }
    }

    /// Run one iteration against the head of the queue.
    pub async fn tick(&self) -> TickOutcome {
        let Some((ticket, job)) = self.store.head_of_queue().await else {
            self.store.set_worker_idle(true);
            return TickOutcome::Idle;
        };
        self.store.set_worker_idle(false);

        let job = match job {
            Some(job) if job.is_active() => job,
            _ => {
                self.store.drop_ticket(&ticket).await;
                return TickOutcome::Dropped { ticket };
            }
        };

        let job = if job.status == SyncJobStatus::Queued {
            match self.store.mark_running(job.connection_id, &ticket).await {
                Some(job) => job,
                None => return TickOutcome::Discarded { ticket },
            }
        } else {
            job
        };

        if self.deadline_exceeded(&job) {
            tracing::warn!(
                "Sync for connection {} exceeded its deadline (ticket {})",
                job.connection_id,
                ticket
            );
            return if self
                .store
                .fail_job(job.connection_id, &ticket, DEADLINE_EXCEEDED)
                .await
            {
                TickOutcome::Finished {
                    ticket,
                    status: SyncJobStatus::Failed,
                }
            } else {
                TickOutcome::Discarded { ticket }
            };
        }

        let outcome = self.poll(&job).await;
        match self
            .store
            .record_poll(job.connection_id, &ticket, outcome)
            .await
        {
            Some(status) if status.is_terminal() => TickOutcome::Finished { ticket, status },
            Some(_) => TickOutcome::Pending { ticket },
            None => {
                tracing::debug!("Discarding poll result for replaced ticket {}", ticket);
                TickOutcome::Discarded { ticket }
            }
        }
    }

    /// Loop over [`tick`](Self::tick) until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Sync worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.tick().await;
            let delay = outcome.delay(self.poll_interval, self.idle_interval);
            let idle = outcome == TickOutcome::Idle;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.store.wait_for_work(), if idle => {}
                _ = shutdown.changed() => break,
            }
        }
        self.store.set_worker_idle(true);
        tracing::info!("Sync worker stopped");
    }

    /// Run the worker on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle { shutdown_tx, join }
    }

    fn deadline_exceeded(&self, job: &SyncJob) -> bool {
        self.deadline_ms
            .is_some_and(|deadline| self.store.now_ms().saturating_sub(job.created_at) > deadline)
    }

    async fn poll(&self, job: &SyncJob) -> PollOutcome {
        let result = self
            .store
            .backend()
            .poll_ticket(&job.ticket, job.connection_type.as_deref())
            .await;

        match result {
            Ok(response) if response.is_success() => PollOutcome {
                state: normalize_ticket_state(&response.body),
                error: response.decode_error,
                payload: response.body,
            },
            Ok(response) => {
                tracing::debug!("Poll of {} answered HTTP {}", job.ticket, response.status);
                PollOutcome {
                    state: TicketState::Pending,
                    error: Some(format!("HTTP {}", response.status)),
                    payload: response.body,
                }
            }
            Err(e) => {
                tracing::warn!("Poll of {} failed: {:#}", job.ticket, e);
                PollOutcome {
                    state: TicketState::Pending,
                    error: Some(e.to_string()),
                    payload: json!({}),
                }
            }
        }
    }
}

/// Owner of a spawned worker task.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the in-flight iteration to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!("Sync worker task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
