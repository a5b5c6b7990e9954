use chrono::{DateTime, Utc};
use serde::Serialize;

/// Job lifecycle notifications broadcast by the store.
///
/// Observers diff nothing themselves: every status transition produces
/// exactly one event, and terminal transitions produce `Completed`/`Failed`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum SyncEvent {
    Queued {
        connection_id: i64,
        ticket: String,
        timestamp: DateTime<Utc>,
    },
    Running {
        connection_id: i64,
        ticket: String,
        timestamp: DateTime<Utc>,
    },
    /// A non-terminal poll was recorded.
    Polled {
        connection_id: i64,
        ticket: String,
        snapshots: usize,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Completed {
        connection_id: i64,
        ticket: String,
        timestamp: DateTime<Utc>,
    },
    Failed {
        connection_id: i64,
        ticket: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Cleared {
        connection_id: i64,
        ticket: String,
        timestamp: DateTime<Utc>,
    },
    /// A queued ticket had no job left and was discarded.
    TicketDropped {
        ticket: String,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn connection_id(&self) -> Option<i64> {
        match self {
            SyncEvent::Queued { connection_id, .. }
            | SyncEvent::Running { connection_id, .. }
            | SyncEvent::Polled { connection_id, .. }
            | SyncEvent::Completed { connection_id, .. }
            | SyncEvent::Failed { connection_id, .. }
            | SyncEvent::Cleared { connection_id, .. } => Some(*connection_id),
            SyncEvent::TicketDropped { .. } => None,
        }
    }

    pub fn ticket(&self) -> &str {
        match self {
            SyncEvent::Queued { ticket, .. }
            | SyncEvent::Running { ticket, .. }
            | SyncEvent::Polled { ticket, .. }
            | SyncEvent::Completed { ticket, .. }
            | SyncEvent::Failed { ticket, .. }
            | SyncEvent::Cleared { ticket, .. }
            | SyncEvent::TicketDropped { ticket, .. } => ticket,
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Queued { .. } => "queued",
            SyncEvent::Running { .. } => "running",
            SyncEvent::Polled { .. } => "polled",
            SyncEvent::Completed { .. } => "completed",
            SyncEvent::Failed { .. } => "failed",
            SyncEvent::Cleared { .. } => "cleared",
            SyncEvent::TicketDropped { .. } => "ticket_dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Completed { .. } | SyncEvent::Failed { .. })
    }
}
