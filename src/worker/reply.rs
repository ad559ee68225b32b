//! Outbound auto-replies over SMTP.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::ReplyConfig;
use crate::error::Error;

/// Sends auto-reply emails through the configured relay. The transport is
/// dialed per call and holds no shared state.
#[derive(Clone)]
pub struct ReplySender {
    config: ReplyConfig,
}

impl ReplySender {
    pub fn new(config: ReplyConfig) -> Self {
        Self { config }
    }

    /// Send `body` back to `to` as `Re: <subject>`. An empty body is a
    /// no-op.
    pub async fn send_reply(&self, to: &str, subject: &str, body: &str) -> Result<(), Error> {
        if body.is_empty() {
            return Ok(());
        }

        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| Error::Reply(format!("invalid from address: {e}")))?;
        let to_addr: Mailbox = to
            .parse()
            .map_err(|e| Error::Reply(format!("invalid recipient address: {e}")))?;

        let email = Message::builder()
            .from(from)
            .to(to_addr)
            .subject(format!("Re: {subject}"))
            .body(body.to_string())
            .map_err(|e| Error::Reply(format!("failed to build reply: {e}")))?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.config.host.as_str())
                .port(self.config.port);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let mailer = builder.build();

        mailer
            .send(email)
            .await
            .map_err(|e| Error::Reply(format!("failed to send reply: {e}")))?;

        info!("sent auto-reply to {}", to);
        Ok(())
    }
}
