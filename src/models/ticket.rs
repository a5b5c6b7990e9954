//! Decoding of loosely-typed backend ticket payloads.
//!
//! The remote backend has returned several shapes over time, so both the
//! start response and the poll response are decoded leniently: every field
//! is optional and a field of an unexpected type is treated as absent.

use serde::Deserialize;
use serde_json::Value;

/// Normalized state of a polled ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Pending,
    Completed,
    Failed,
}

impl TicketState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TicketState::Pending)
    }
}

const COMPLETED_STATES: &[&str] = &["completed", "complete", "done", "success", "succeeded", "finished"];
const FAILED_STATES: &[&str] = &["failed", "error", "errored", "cancelled", "canceled"];

/// The fields of a poll payload that decide its state.
#[derive(Debug, Default, Deserialize)]
pub struct TicketPayload {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub done: Option<Value>,
    #[serde(default)]
    pub success: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub state: Option<Value>,
}

impl TicketPayload {
    /// Decode a payload. Non-objects decode to an empty payload.
    pub fn decode(payload: &Value) -> Self {
        if !payload.is_object() {
            return Self::default();
        }
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn state(&self) -> TicketState {
        if self.error.as_ref().is_some_and(is_truthy) {
            return TicketState::Failed;
        }
        if self.done == Some(Value::Bool(true)) || self.success == Some(Value::Bool(true)) {
            return TicketState::Completed;
        }

        // `status` wins over `state` when present, even if it is not a string.
        let label = match self.status.as_ref().filter(|v| !v.is_null()) {
            Some(status) => status.as_str(),
            None => self.state.as_ref().and_then(Value::as_str),
        };

        match label.map(str::to_lowercase) {
            Some(value) if COMPLETED_STATES.contains(&value.as_str()) => TicketState::Completed,
            Some(value) if FAILED_STATES.contains(&value.as_str()) => TicketState::Failed,
            _ => TicketState::Pending,
        }
    }
}

/// Normalize a raw poll payload into a [`TicketState`].
pub fn normalize_ticket_state(payload: &Value) -> TicketState {
    TicketPayload::decode(payload).state()
}

/// Pull the ticket identifier out of a start-sync response.
///
/// Tries `ticket`, then `job_id`, then `id`; the first non-empty string wins.
pub fn extract_ticket(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    ["ticket", "job_id", "id"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
