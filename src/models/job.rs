use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A repository or task-board connection that can be synced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: i64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Connection {
    pub fn new(id: i64, connection_type: Option<&str>) -> Self {
        Self {
            id,
            connection_type: connection_type
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl SyncJobStatus {
    /// `Completed` and `Failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncJobStatus::Completed | SyncJobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncJobStatus::Queued => "queued",
            SyncJobStatus::Running => "running",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured backend response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSnapshot {
    pub at: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub ticket: String,
    pub connection_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    pub status: SyncJobStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub snapshots: Vec<SyncSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncJob {
    /// Build a freshly started job whose first snapshot is the start response.
    pub fn queued(ticket: String, connection: &Connection, start_payload: Value, now: i64) -> Self {
        Self {
            ticket,
            connection_id: connection.id,
            connection_type: connection.connection_type.clone(),
            status: SyncJobStatus::Queued,
            created_at: now,
            updated_at: now,
            snapshots: vec![SyncSnapshot {
                at: now,
                data: start_payload,
            }],
            last_error: None,
        }
    }

    /// Append a snapshot, evicting the oldest entries beyond `max`.
    pub fn push_snapshot(&mut self, snapshot: SyncSnapshot, max: usize) {
        self.snapshots.push(snapshot);
        if self.snapshots.len() > max {
            let excess = self.snapshots.len() - max;
            self.snapshots.drain(..excess);
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}
