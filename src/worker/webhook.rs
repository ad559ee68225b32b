//! Webhook dispatch over a shared HTTP client.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::error::Error;
use crate::models::job::Method;
use crate::worker::matcher::MatchResult;

/// Outcome of one webhook attempt for one match.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub job_id: i64,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl SendResult {
    /// Whether the HTTP exchange completed, whatever the status class.
    /// Auto-replies key off this: a 4xx answer still counts as delivered.
    pub fn completed(&self) -> bool {
        self.error.is_none() && self.status.is_some()
    }
}

/// Sends one HTTP request per match. Retries are the poller's concern.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl WebhookSender {
    /// Build the shared client. `HTTP_PROXY`-style environment variables
    /// are honoured by the client's default proxy support.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn send(&self, m: &MatchResult) -> SendResult {
        let mut result = SendResult { job_id: m.job_id, status: None, error: None };

        let method = match m.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
        };

        let mut req = self.client.request(method, &m.url).body(m.payload.clone());
        let mut has_content_type = false;
        for (key, value) in &m.headers {
            if key.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            req = req.header(key.as_str(), value.as_str());
        }
        if !has_content_type {
            req = req.header(CONTENT_TYPE, "application/json");
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                // Only the status code is observable; drain and drop the body.
                let _ = resp.bytes().await;
                debug!("webhook call for job {} completed with status: {}", m.job_id, status);
                result.status = Some(status);
            }
            Err(e) => {
                warn!("webhook call for job {} failed: {}", m.job_id, e);
                result.error = Some(e.to_string());
            }
        }
        result
    }
}
