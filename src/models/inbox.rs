//! Inbox rows: one persisted recipient of one received message.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A persisted inbox row, the poller's unit of work. Rows are never
/// deleted; `processed` flips to true exactly once.
#[derive(Debug, Clone, FromRow)]
pub struct InboxMessage {
    pub id: i64,
    pub to_addr: String,
    pub from_addr: String,
    pub subject: String,
    pub body: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a freshly received message.
#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub to_addr: String,
    pub from_addr: String,
    pub subject: String,
    pub body: String,
}
