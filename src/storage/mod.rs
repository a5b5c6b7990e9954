pub mod state;

use std::collections::{BTreeMap, HashSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::SyncJob;

pub use state::JsonStateStore;

/// Fixed namespace the job state is persisted under.
pub const STATE_KEY: &str = "sirius-sync-jobs";

/// Bumped whenever the persisted layout changes; older files are discarded.
pub const STATE_VERSION: u32 = 1;

/// Everything that survives a restart: the job map and the ticket queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub jobs_by_connection_id: BTreeMap<i64, SyncJob>,
    #[serde(default)]
    pub queue: VecDeque<String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            jobs_by_connection_id: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }
}

impl PersistedState {
    /// Restore the queue invariants after loading from disk.
    ///
    /// - map keys match each job's `connection_id`
    /// - the queue holds each active job's ticket exactly once
    /// - tickets of missing or terminal jobs are dropped
    ///
    /// Active jobs missing from the queue are appended in `created_at` order.
    /// Returns the number of corrections made.
    pub fn repair(&mut self) -> usize {
        let mut fixes = 0;

        let jobs = std::mem::take(&mut self.jobs_by_connection_id);
        for (key, job) in jobs {
            if key != job.connection_id {
                fixes += 1;
            }
            self.jobs_by_connection_id.insert(job.connection_id, job);
        }

        let active: HashSet<&str> = self
            .jobs_by_connection_id
            .values()
            .filter(|job| job.is_active())
            .map(|job| job.ticket.as_str())
            .collect();

        let mut seen = HashSet::new();
        let before = self.queue.len();
        let queue: VecDeque<String> = self
            .queue
            .drain(..)
            .filter(|ticket| active.contains(ticket.as_str()) && seen.insert(ticket.clone()))
            .collect();
        fixes += before - queue.len();
        self.queue = queue;

        let mut missing: Vec<&SyncJob> = self
            .jobs_by_connection_id
            .values()
            .filter(|job| job.is_active() && !seen.contains(&job.ticket))
            .collect();
        missing.sort_by_key(|job| job.created_at);
        fixes += missing.len();
        let missing: Vec<String> = missing.into_iter().map(|job| job.ticket.clone()).collect();
        self.queue.extend(missing);

        fixes
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, or an empty one.
    async fn load(&self) -> Result<PersistedState>;
    /// Replace the saved state with `state`.
    async fn save(&self, state: &PersistedState) -> Result<()>;
}
