//! mailhook library entrypoint.
//!
//! Modules:
//! - `app`: startup, wiring, shutdown coordination
//! - `config`: environment-driven settings
//! - `db`: migrations, SQLite helpers, and the typed store
//! - `error`: crate-wide error type
//! - `models`: typed records used across layers
//! - `smtp`: inbound SMTP listener (catchall trap)
//! - `worker`: inbox poller, matcher, webhook and reply senders
//! - `util`: tracing setup and address helpers

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod smtp;
pub mod util;
pub mod worker;
