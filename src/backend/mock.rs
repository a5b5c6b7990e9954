use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{BackendResponse, SyncBackend};
use crate::errors::SyncError;
use crate::models::Connection;

type Scripted = std::result::Result<BackendResponse, String>;

/// In-process backend that replays scripted responses.
///
/// Start responses are consumed in order across all connections. Poll
/// responses are scripted per ticket; once a ticket's script is exhausted
/// every further poll answers `{"status": "running"}`.
#[derive(Default)]
pub struct ScriptedBackend {
    starts: Mutex<VecDeque<Scripted>>,
    polls: Mutex<HashMap<String, VecDeque<Scripted>>>,
    start_calls: Mutex<Vec<Connection>>,
    poll_calls: Mutex<Vec<(String, Option<String>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_start(&self, response: BackendResponse) -> &Self {
        lock(&self.starts).push_back(Ok(response));
        self
    }

    /// Script a successful start answering `{"ticket": ticket}`.
    pub fn push_start_ticket(&self, ticket: &str) -> &Self {
        self.push_start(BackendResponse::ok(json!({ "ticket": ticket })))
    }

    /// Script a transport failure for the next start.
    pub fn push_start_error(&self, message: &str) -> &Self {
        lock(&self.starts).push_back(Err(message.to_string()));
        self
    }

    pub fn push_poll(&self, ticket: &str, response: BackendResponse) -> &Self {
        lock(&self.polls)
            .entry(ticket.to_string())
            .or_default()
            .push_back(Ok(response));
        self
    }

    /// Script a 200 poll answer for `ticket`.
    pub fn push_poll_body(&self, ticket: &str, body: Value) -> &Self {
        self.push_poll(ticket, BackendResponse::ok(body))
    }

    /// Script a transport failure for the next poll of `ticket`.
    pub fn push_poll_error(&self, ticket: &str, message: &str) -> &Self {
        lock(&self.polls)
            .entry(ticket.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn start_calls(&self) -> Vec<Connection> {
        lock(&self.start_calls).clone()
    }

    pub fn poll_calls(&self) -> Vec<(String, Option<String>)> {
        lock(&self.poll_calls).clone()
    }
}

fn replay(scripted: Scripted) -> Result<BackendResponse> {
    scripted.map_err(|message| SyncError::Backend(message).into())
}

#[async_trait]
impl SyncBackend for ScriptedBackend {
    async fn start_sync(&self, connection: &Connection) -> Result<BackendResponse> {
        lock(&self.start_calls).push(connection.clone());
        let next = lock(&self.starts).pop_front();
        match next {
            Some(scripted) => replay(scripted),
            None => Err(SyncError::Backend("no scripted start response".to_string()).into()),
        }
    }

    async fn poll_ticket(
        &self,
        ticket: &str,
        connection_type: Option<&str>,
    ) -> Result<BackendResponse> {
        lock(&self.poll_calls).push((ticket.to_string(), connection_type.map(str::to_string)));
        let next = lock(&self.polls)
            .get_mut(ticket)
            .and_then(VecDeque::pop_front);
        match next {
            Some(scripted) => replay(scripted),
            None => Ok(BackendResponse::ok(json!({ "status": "running" }))),
        }
    }
}
