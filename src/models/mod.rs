pub mod config;
pub mod job;
pub mod ticket;

pub use config::SyncConfig;
pub use job::{Connection, SyncJob, SyncJobStatus, SyncSnapshot};
pub use ticket::{extract_ticket, normalize_ticket_state, TicketPayload, TicketState};
