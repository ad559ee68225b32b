//! Job matching: per-recipient lookup, sender-regex predicate, payload
//! rendering.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::error::Error;
use crate::models::inbox::InboxMessage;
use crate::models::job::{Job, Method};
use crate::worker::jobs::JobRepository;
use crate::worker::template::{self, Vars};

/// Per-tick regex cache. Patterns that fail to compile are negative-cached
/// so repeated rows with the same pattern do not re-log.
#[derive(Default)]
pub struct RegexCache {
    compiled: HashMap<String, Option<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&mut self, pattern: &str, job_id: i64) -> Option<&Regex> {
        self.compiled
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("invalid from_regex pattern '{}' (job {}): {}", pattern, job_id, e);
                    None
                }
            })
            .as_ref()
    }
}

/// One job that applies to one inbox row, with its rendered payload.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub job_id: i64,
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub payload: String,
    pub reply_body: String,
    pub error: Option<String>,
}

// Field order is the wire order of the default payload.
#[derive(Serialize)]
struct Payload<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: &'a str,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "Body")]
    body: &'a str,
}

/// Evaluates the active jobs for a message's recipient.
#[derive(Clone)]
pub struct Matcher {
    jobs: JobRepository,
}

impl Matcher {
    pub fn new(jobs: JobRepository) -> Self {
        Self { jobs }
    }

    /// All (job, payload) tuples that apply to `msg`, in job creation
    /// order. Jobs whose regex does not compile or does not accept the
    /// sender are skipped; template failures produce a result with `error`
    /// set and an empty payload.
    pub async fn match_message(
        &self,
        msg: &InboxMessage,
        cache: &mut RegexCache,
    ) -> Result<Vec<MatchResult>, Error> {
        let jobs = self.jobs.active_jobs_for(&msg.to_addr).await?;

        let mut results = Vec::new();
        for job in &jobs {
            let Some(re) = cache.get(&job.from_regex, job.id) else {
                continue;
            };
            if !re.is_match(&msg.from_addr) {
                continue;
            }
            results.push(evaluate(job, msg));
        }
        Ok(results)
    }
}

fn evaluate(job: &Job, msg: &InboxMessage) -> MatchResult {
    let mut result = MatchResult {
        job_id: job.id,
        url: job.url.clone(),
        method: job.http_method(),
        headers: job.header_map(),
        payload: String::new(),
        reply_body: job.response_body.clone(),
        error: None,
    };
    match render_payload(job, msg) {
        Ok(payload) => result.payload = payload,
        Err(e) => result.error = Some(e.to_string()),
    }
    result
}

fn render_payload(job: &Job, msg: &InboxMessage) -> Result<String, Error> {
    let vars = Vars {
        from: &msg.from_addr,
        to: &msg.to_addr,
        subject: &msg.subject,
        body: &msg.body,
    };
    if !job.payload_template.is_empty() {
        return template::render(&job.payload_template, &vars);
    }
    let payload = Payload {
        from: vars.from,
        to: vars.to,
        subject: vars.subject,
        body: vars.body,
    };
    serde_json::to_string(&payload)
        .map_err(|e| Error::Validation(format!("failed to encode payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Store, run_migrations};
    use crate::models::job::NewJob;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite://:memory:")
            .await
            .expect("connect memory sqlite");
        run_migrations(&pool).await.expect("migrate");
        Store::new(pool)
    }

    fn matcher(store: &Store) -> Matcher {
        Matcher::new(JobRepository::new(store.clone()))
    }

    fn message(to: &str, from: &str) -> InboxMessage {
        InboxMessage {
            id: 1,
            to_addr: to.to_string(),
            from_addr: from.to_string(),
            subject: "c".to_string(),
            body: "d".to_string(),
            processed: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn default_payload_is_canonical_json() {
        let store = store().await;
        store
            .create_job(NewJob::new("b@trap.test", "http://sink/1", 1), "trap.test")
            .await
            .unwrap();

        let mut cache = RegexCache::new();
        let results = matcher(&store)
            .match_message(&message("b@trap.test", "a"), &mut cache)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload, r#"{"From":"a","To":"b@trap.test","Subject":"c","Body":"d"}"#);
        assert!(results[0].error.is_none());
    }

    #[tokio::test]
    async fn template_payload_renders_variables() {
        let store = store().await;
        let mut job = NewJob::new("b@trap.test", "http://sink/1", 1);
        job.payload_template = "S={{.Subject}} B={{.Body}}".to_string();
        store.create_job(job, "trap.test").await.unwrap();

        let mut cache = RegexCache::new();
        let results = matcher(&store)
            .match_message(&message("b@trap.test", "a"), &mut cache)
            .await
            .unwrap();
        assert_eq!(results[0].payload, "S=c B=d");
    }

    #[tokio::test]
    async fn sender_regex_uses_search_semantics() {
        let store = store().await;
        let mut job = NewJob::new("b@trap.test", "http://sink/1", 1);
        job.from_regex = "^alerts@.*".to_string();
        store.create_job(job, "trap.test").await.unwrap();
        let m = matcher(&store);

        let mut cache = RegexCache::new();
        let hit = m
            .match_message(&message("b@trap.test", "alerts@x.y"), &mut cache)
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = m
            .match_message(&message("b@trap.test", "x.alerts@y"), &mut cache)
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn catchall_regex_matches_every_sender() {
        let store = store().await;
        store
            .create_job(NewJob::new("b@trap.test", "http://sink/1", 1), "trap.test")
            .await
            .unwrap();
        let m = matcher(&store);

        let mut cache = RegexCache::new();
        for from in ["a", "alerts@x.y", "", "weird <addr>"] {
            let results = m
                .match_message(&message("b@trap.test", from), &mut cache)
                .await
                .unwrap();
            assert_eq!(results.len(), 1, "from={from:?}");
        }
    }

    #[tokio::test]
    async fn bad_template_sets_error_and_empty_payload() {
        let store = store().await;
        let mut job = NewJob::new("b@trap.test", "http://sink/1", 1);
        job.payload_template = "{{.Nope}}".to_string();
        job.response_body = "thanks".to_string();
        store.create_job(job, "trap.test").await.unwrap();

        let mut cache = RegexCache::new();
        let results = matcher(&store)
            .match_message(&message("b@trap.test", "a"), &mut cache)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_some());
        assert!(results[0].payload.is_empty());
        assert_eq!(results[0].reply_body, "thanks");
    }

    #[tokio::test]
    async fn uncompilable_regex_skips_the_job() {
        // Validation rejects bad patterns at write time, so plant one
        // directly to model a row that predates the check.
        let store = store().await;
        let job = store
            .create_job(NewJob::new("b@trap.test", "http://sink/1", 1), "trap.test")
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET from_regex = '[unclosed' WHERE id = ?")
            .bind(job.id)
            .execute(store.pool())
            .await
            .unwrap();

        let mut cache = RegexCache::new();
        let results = matcher(&store)
            .match_message(&message("b@trap.test", "a"), &mut cache)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_yields_no_matches() {
        let store = store().await;
        let mut cache = RegexCache::new();
        let results = matcher(&store)
            .match_message(&message("nobody@trap.test", "a"), &mut cache)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
