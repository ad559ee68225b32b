//! Environment-driven configuration.
//!
//! Everything is read once at startup from `MAILHOOK_*` variables. The
//! allowed hostname is required; every other setting has a default.

use std::time::Duration;

use crate::error::Error;

/// Outbound SMTP settings for auto-replies. Absent when no relay host is
/// configured, in which case replies are skipped with a warning.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

/// Runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub smtp_addr: String,
    pub allowed_hostname: String,
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub reply: Option<ReplyConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let allowed_hostname = std::env::var("MAILHOOK_HOSTNAME")
            .map_err(|_| Error::Validation("MAILHOOK_HOSTNAME must be set".into()))?
            .trim()
            .to_lowercase();
        if allowed_hostname.is_empty() {
            return Err(Error::Validation("MAILHOOK_HOSTNAME must not be empty".into()));
        }

        let reply = match std::env::var("MAILHOOK_REPLY_HOST") {
            Ok(host) if !host.trim().is_empty() => Some(ReplyConfig {
                host: host.trim().to_string(),
                port: env_parse("MAILHOOK_REPLY_PORT", 587),
                username: std::env::var("MAILHOOK_REPLY_USER").ok(),
                password: std::env::var("MAILHOOK_REPLY_PASS").ok(),
                from_address: std::env::var("MAILHOOK_REPLY_FROM")
                    .unwrap_or_else(|_| format!("noreply@{allowed_hostname}")),
            }),
            _ => None,
        };

        Ok(Self {
            database_url: std::env::var("MAILHOOK_DATABASE")
                .unwrap_or_else(|_| "sqlite://mailhook.db".to_string()),
            smtp_addr: std::env::var("MAILHOOK_SMTP_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:25".to_string()),
            allowed_hostname,
            http_timeout: Duration::from_secs(env_parse("MAILHOOK_HTTP_TIMEOUT_SECS", 90)),
            max_retries: env_parse("MAILHOOK_MAX_RETRIES", 3),
            poll_interval: Duration::from_millis(env_parse("MAILHOOK_POLL_INTERVAL_MS", 1000)),
            shutdown_timeout: Duration::from_secs(env_parse("MAILHOOK_SHUTDOWN_TIMEOUT_SECS", 10)),
            reply,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
