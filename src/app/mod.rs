//! Application setup, wiring, and shutdown coordination.

use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, Store};
use crate::smtp;
use crate::worker::jobs::JobRepository;
use crate::worker::matcher::Matcher;
use crate::worker::poller::Poller;
use crate::worker::reply::ReplySender;
use crate::worker::webhook::WebhookSender;

/// Start the receiver and poller, then block until a termination signal
/// initiates the drain.
pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    crate::util::init_tracing();

    let config = Config::from_env()?;

    let db_url = db::ensure_sqlite_path(&config.database_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;
    db::run_migrations(&pool).await?;
    let store = Store::new(pool);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind(&config.smtp_addr).await?;
    let smtp_task = tokio::spawn(smtp::run_listener(
        listener,
        store.clone(),
        config.allowed_hostname.clone(),
        shutdown_rx.clone(),
    ));

    let matcher = Matcher::new(JobRepository::new(store.clone()));
    let webhooks = WebhookSender::new(config.http_timeout)?;
    let replies = config.reply.clone().map(ReplySender::new);
    let poller = Poller::new(
        store,
        matcher,
        webhooks,
        replies,
        config.poll_interval,
        config.max_retries,
    );
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    wait_for_signal().await;
    info!("shutting down, draining in-flight work");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(config.shutdown_timeout, poller_task).await {
        Ok(_) => info!("poller drained, shutdown complete"),
        Err(_) => warn!(
            "shutdown timeout reached after {:?}, forcing exit",
            config.shutdown_timeout
        ),
    }
    if let Err(e) = smtp_task.await {
        error!("smtp listener task failed: {e}");
    }
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}
