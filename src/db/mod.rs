//! Database: migrations, path handling, and the typed store.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::Error;
use crate::models::inbox::{InboxMessage, NewInboxMessage};
use crate::models::job::{Job, NewJob};

/// Run SQLite migrations to create tables and indexes if absent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL,
            from_regex TEXT NOT NULL DEFAULT '.*',
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'GET',
            headers TEXT NULL,
            payload_template TEXT NOT NULL DEFAULT '',
            response_body TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            owner_id INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS inbox_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            to_addr TEXT NOT NULL,
            from_addr TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_email ON jobs (email, is_active)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_inbox_to ON inbox_messages (to_addr)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_inbox_pending ON inbox_messages (processed, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Ensure SQLite file and parent folder exist for a given sqlx URL.
pub fn ensure_sqlite_path(db_url: &str) -> String {
    if !db_url.starts_with("sqlite:") {
        return db_url.to_string();
    }
    let path_part = db_url.trim_start_matches("sqlite://");
    if path_part == ":memory:" {
        return db_url.to_string();
    }
    let (path_only, _) = match path_part.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_part, None),
    };
    if !path_only.is_empty() {
        let p = Path::new(path_only);
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(p);
    }
    db_url.to_string()
}

/// Typed access to jobs and the inbox. Cheap to clone; all clones share the
/// underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Validate and insert a job, returning the stored row. Several jobs
    /// may bind the same address; each match dispatches independently.
    pub async fn create_job(&self, mut job: NewJob, allowed_hostname: &str) -> Result<Job, Error> {
        job.validate(allowed_hostname)?;
        let headers_json = if job.headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&job.headers).unwrap_or_else(|_| "{}".to_string()))
        };
        let row = sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (email, from_regex, url, method, headers, payload_template, response_body, is_active, owner_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(&job.email)
        .bind(&job.from_regex)
        .bind(&job.url)
        .bind(job.method.as_str())
        .bind(headers_json)
        .bind(&job.payload_template)
        .bind(&job.response_body)
        .bind(job.is_active)
        .bind(job.owner_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_job(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active jobs bound to `email`, in creation order.
    pub async fn active_jobs_for(&self, email: &str) -> Result<Vec<Job>, Error> {
        let rows = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE email = ? AND is_active = 1 ORDER BY id ASC",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a received message with `processed = false`; returns the new
    /// row id.
    pub async fn insert_message(&self, msg: &NewInboxMessage) -> Result<i64, Error> {
        let res = sqlx::query(
            "INSERT INTO inbox_messages (to_addr, from_addr, subject, body, processed, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&msg.to_addr)
        .bind(&msg.from_addr)
        .bind(&msg.subject)
        .bind(&msg.body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Oldest unprocessed rows; arrival order, id as the tie-break.
    pub async fn unprocessed_batch(&self, limit: i64) -> Result<Vec<InboxMessage>, Error> {
        let rows = sqlx::query_as::<_, InboxMessage>(
            "SELECT * FROM inbox_messages WHERE processed = 0 ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_processed(&self, id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE inbox_messages SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::NewJob;
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

    #[tokio::test]
    async fn job_lifecycle() {
        let store = store().await;
        let job = store
            .create_job(NewJob::new("Watch@Trap.Test", "http://sink/1", 7), "trap.test")
            .await
            .expect("create job");
        assert_eq!(job.email, "watch@trap.test");
        assert_eq!(job.from_regex, ".*");
        assert!(job.is_active);
        assert_eq!(job.owner_id, 7);

        let found = store.active_jobs_for("watch@trap.test").await.unwrap();
        assert_eq!(found.len(), 1);

        store.delete_job(job.id).await.unwrap();
        assert!(store.active_jobs_for("watch@trap.test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn several_jobs_can_bind_the_same_address() {
        let store = store().await;
        for url in ["http://sink/1", "http://sink/2"] {
            store
                .create_job(NewJob::new("shared@trap.test", url, 1), "trap.test")
                .await
                .expect("insert");
        }
        let jobs = store.active_jobs_for("shared@trap.test").await.unwrap();
        assert_eq!(jobs.len(), 2);
        // Creation order, which is the dispatch order.
        assert_eq!(jobs[0].url, "http://sink/1");
        assert_eq!(jobs[1].url, "http://sink/2");
    }

    #[tokio::test]
    async fn unprocessed_batch_is_fifo_and_marking_removes() {
        let store = store().await;
        let first = store
            .insert_message(&NewInboxMessage {
                to_addr: "a@trap.test".into(),
                from_addr: "s@ext".into(),
                subject: "one".into(),
                body: "1".into(),
            })
            .await
            .unwrap();
        let second = store
            .insert_message(&NewInboxMessage {
                to_addr: "a@trap.test".into(),
                from_addr: "s@ext".into(),
                subject: "two".into(),
                body: "2".into(),
            })
            .await
            .unwrap();

        let batch = store.unprocessed_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, first);
        assert_eq!(batch[1].id, second);
        assert!(!batch[0].processed);

        store.mark_processed(first).await.unwrap();
        let batch = store.unprocessed_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, second);
    }

    #[tokio::test]
    async fn inactive_jobs_are_invisible() {
        let store = store().await;
        let mut job = NewJob::new("off@trap.test", "http://sink/1", 1);
        job.is_active = false;
        store.create_job(job, "trap.test").await.unwrap();
        assert!(store.active_jobs_for("off@trap.test").await.unwrap().is_empty());
    }
}
