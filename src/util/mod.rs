//! Tracing setup and small address helpers.

use tracing_subscriber::{EnvFilter, fmt};

/// Initialize pretty CLI logging.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .pretty()
        .init();
}

/// Strip surrounding angle brackets from an SMTP address argument.
pub fn strip_brackets(raw: &str) -> &str {
    raw.trim().trim_matches(['<', '>'])
}
