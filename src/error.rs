//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the store, the matcher, and the two senders.
#[derive(Debug, Error)]
pub enum Error {
    /// Database connectivity or schema failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Malformed job at write time, or a bad template at match time.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP transport failure while dispatching a webhook.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] reqwest::Error),

    /// Outbound SMTP failure while sending an auto-reply.
    #[error("reply error: {0}")]
    Reply(String),
}
