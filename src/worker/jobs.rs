//! Typed job lookups for the matcher.

use crate::db::Store;
use crate::error::Error;
use crate::models::job::Job;

/// Thin query layer over the store.
#[derive(Clone)]
pub struct JobRepository {
    store: Store,
}

impl JobRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Active jobs bound to `email`. The input is lowercased before the
    /// lookup; no matches is an empty vec, not an error.
    pub async fn active_jobs_for(&self, email: &str) -> Result<Vec<Job>, Error> {
        self.store.active_jobs_for(&email.to_lowercase()).await
    }
}
