//! Periodic inbox drain: match, dispatch, reply, mark processed.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::error::Error;
use crate::models::inbox::InboxMessage;
use crate::worker::matcher::{MatchResult, Matcher, RegexCache};
use crate::worker::reply::ReplySender;
use crate::worker::webhook::{SendResult, WebhookSender};

const BATCH_SIZE: i64 = 10;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Single driver over the inbox table. The poller is the only writer of
/// `processed`, so each row is claimed at most once.
pub struct Poller {
    store: Store,
    matcher: Matcher,
    webhooks: WebhookSender,
    replies: Option<ReplySender>,
    interval: Duration,
    max_retries: u32,
}

impl Poller {
    pub fn new(
        store: Store,
        matcher: Matcher,
        webhooks: WebhookSender,
        replies: Option<ReplySender>,
        interval: Duration,
        max_retries: u32,
    ) -> Self {
        Self { store, matcher, webhooks, replies, interval, max_retries }
    }

    /// Tick until shutdown flips. In-progress selects and retry backoffs
    /// abort on shutdown; an in-flight dispatch runs to completion under
    /// the drain deadline.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("poller starting, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("poller stopping due to shutdown signal");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&mut shutdown).await {
                        error!("error processing messages: {}", e);
                    }
                    if *shutdown.borrow() {
                        info!("poller stopping due to shutdown signal");
                        return;
                    }
                }
            }
        }
    }

    /// One pass: drain up to `BATCH_SIZE` rows, oldest first, sequentially.
    /// A selection failure ends the pass; it is retried on the next tick.
    pub async fn tick(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), Error> {
        let messages = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            batch = self.store.unprocessed_batch(BATCH_SIZE) => batch?,
        };
        if messages.is_empty() {
            return Ok(());
        }
        debug!("processing {} messages", messages.len());

        let mut cache = RegexCache::new();
        for msg in &messages {
            self.process_row(msg, &mut cache, shutdown).await;
            if *shutdown.borrow() {
                break;
            }
        }
        Ok(())
    }

    /// Fan one row through matcher, webhook sender, and replier, then mark
    /// it processed whatever the per-match outcomes were.
    async fn process_row(
        &self,
        msg: &InboxMessage,
        cache: &mut RegexCache,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        match self.matcher.match_message(msg, cache).await {
            Ok(matches) if matches.is_empty() => {
                debug!("no matching jobs found for message to: {}", msg.to_addr);
            }
            Ok(matches) => {
                for m in &matches {
                    if let Some(err) = &m.error {
                        warn!(
                            "skipping webhook for job {} due to processing error: {}",
                            m.job_id, err
                        );
                        continue;
                    }
                    let outcome = self.dispatch(m, shutdown).await;
                    if let Some(err) = &outcome.error {
                        warn!("webhook error for job {}: {}", m.job_id, err);
                    }
                    if outcome.completed() && !m.reply_body.is_empty() {
                        self.send_reply(msg, m).await;
                    }
                }
            }
            Err(e) => {
                // Still marked processed below; a poison row must not be
                // re-selected forever.
                error!("error processing message id {}: {}", msg.id, e);
            }
        }

        if let Err(e) = self.store.mark_processed(msg.id).await {
            warn!("failed to mark message {} as processed: {}", msg.id, e);
        }
    }

    /// Dispatch with the configured retry budget: transport errors and 5xx
    /// retry with exponential backoff, 4xx does not. The final attempt's
    /// outcome is the dispatch outcome.
    async fn dispatch(&self, m: &MatchResult, shutdown: &mut watch::Receiver<bool>) -> SendResult {
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;
        loop {
            let result = self.webhooks.send(m).await;
            let retryable = result.error.is_some() || matches!(result.status, Some(s) if s >= 500);
            if !retryable || attempt >= self.max_retries || *shutdown.borrow() {
                return result;
            }
            attempt += 1;
            debug!(
                "retrying webhook for job {} (attempt {} of {})",
                m.job_id,
                attempt + 1,
                self.max_retries + 1
            );
            tokio::select! {
                _ = shutdown.changed() => return result,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn send_reply(&self, msg: &InboxMessage, m: &MatchResult) {
        let Some(replies) = &self.replies else {
            warn!("job {} has a reply body but no outbound SMTP relay is configured", m.job_id);
            return;
        };
        if let Err(e) = replies.send_reply(&msg.from_addr, &msg.subject, &m.reply_body).await {
            warn!("failed to send auto-reply for job {}: {}", m.job_id, e);
        }
    }
}
