//! Inbound SMTP listener: a catchall trap for the allowed hostname.
//!
//! Supports EHLO/HELO, AUTH PLAIN (credentials ignored), MAIL FROM,
//! RCPT TO, DATA, RSET, NOOP, QUIT. Recipients outside the allowed
//! hostname are rejected at RCPT, before any message body is read or
//! stored.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::models::inbox::NewInboxMessage;
use crate::util::strip_brackets;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_RECIPIENTS: usize = 50;

/// Accept connections until shutdown flips, one task per session. Open
/// sessions are not interrupted; they finish under their own timeouts.
pub async fn run_listener(
    listener: TcpListener,
    store: Store,
    allowed_hostname: String,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("smtp listener: {} (hostname: {})", addr, allowed_hostname),
        Err(e) => warn!("smtp listener address unavailable: {}", e),
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("smtp listener stopping, open sessions run to completion");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let store = store.clone();
                        let hostname = allowed_hostname.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, store, hostname).await {
                                warn!("smtp connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("smtp accept error: {}", e),
                }
            }
        }
    }
}

struct Session {
    from: Option<String>,
    rcpts: Vec<String>,
}

impl Session {
    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }
}

async fn handle_client(
    stream: TcpStream,
    store: Store,
    hostname: String,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    write_line(&mut writer, &format!("220 {hostname} ESMTP mailhook")).await?;

    let mut session = Session { from: None, rcpts: Vec::new() };
    let mut buf = String::new();

    loop {
        buf.clear();
        let n = read_line(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        let line = buf.trim_end_matches(['\r', '\n']);
        debug!("smtp <= {}", line);
        let upper = line.to_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            write_line(&mut writer, &format!("250-{hostname}")).await?;
            write_line(&mut writer, "250-AUTH PLAIN").await?;
            write_line(&mut writer, &format!("250-SIZE {MAX_MESSAGE_BYTES}")).await?;
            write_line(&mut writer, "250 OK").await?;
        } else if upper.starts_with("AUTH PLAIN") {
            // Catchall trap: authentication always succeeds.
            let token = match line.split_whitespace().nth(2) {
                Some(t) => t.to_string(),
                None => {
                    write_line(&mut writer, "334 ").await?;
                    let mut cont = String::new();
                    read_line(&mut reader, &mut cont).await?;
                    cont.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            if let Some(user) = decode_plain_username(&token) {
                debug!("smtp auth attempt for {}", user);
            }
            write_line(&mut writer, "235 Authentication successful").await?;
        } else if upper.starts_with("AUTH ") {
            write_line(&mut writer, "504 Unrecognized authentication type").await?;
        } else if let Some(arg) = strip_prefix_ci(line, "MAIL FROM:") {
            session.from = Some(strip_brackets(arg).to_string());
            session.rcpts.clear();
            write_line(&mut writer, "250 OK").await?;
        } else if let Some(arg) = strip_prefix_ci(line, "RCPT TO:") {
            if session.from.is_none() {
                write_line(&mut writer, "503 Bad sequence of commands").await?;
                continue;
            }
            let rcpt = strip_brackets(arg).to_lowercase();
            let suffix = format!("@{hostname}");
            if !rcpt.ends_with(&suffix) {
                warn!("smtp rejected recipient {} (not @{})", rcpt, hostname);
                write_line(&mut writer, "550 No such user here").await?;
            } else if session.rcpts.len() >= MAX_RECIPIENTS {
                write_line(&mut writer, "452 Too many recipients").await?;
            } else {
                debug!("smtp accepted recipient {}", rcpt);
                session.rcpts.push(rcpt);
                write_line(&mut writer, "250 Accepted").await?;
            }
        } else if upper == "DATA" {
            if session.from.is_none() || session.rcpts.is_empty() {
                write_line(&mut writer, "503 Bad sequence of commands").await?;
                continue;
            }
            write_line(&mut writer, "354 End data with <CR><LF>.<CR><LF>").await?;
            let data = match read_data(&mut reader).await? {
                Some(data) => data,
                None => {
                    write_line(&mut writer, "552 Message size exceeds fixed maximum message size")
                        .await?;
                    session.reset();
                    continue;
                }
            };
            let subject = extract_subject(&data);
            let body = extract_body(&data);
            match store_message(&store, &session, &subject, &body).await {
                Ok(count) => {
                    write_line(&mut writer, &format!("250 OK: queued for {count} recipient(s)"))
                        .await?;
                }
                Err(e) => {
                    error!("smtp store error: {}", e);
                    write_line(&mut writer, "451 Requested action aborted: local error").await?;
                }
            }
            session.reset();
        } else if upper == "RSET" {
            session.reset();
            write_line(&mut writer, "250 OK").await?;
        } else if upper == "NOOP" {
            write_line(&mut writer, "250 OK").await?;
        } else if upper == "QUIT" {
            write_line(&mut writer, "221 Bye").await?;
            break;
        } else {
            write_line(&mut writer, "502 Command not implemented").await?;
        }
    }
    Ok(())
}

/// Insert one inbox row per accepted recipient. Any failed insert fails
/// the whole DATA command so the client can retry.
async fn store_message(
    store: &Store,
    session: &Session,
    subject: &str,
    body: &str,
) -> Result<usize, crate::error::Error> {
    let from = session.from.clone().unwrap_or_default();
    for rcpt in &session.rcpts {
        store
            .insert_message(&NewInboxMessage {
                to_addr: rcpt.clone(),
                from_addr: from.clone(),
                subject: subject.to_string(),
                body: body.to_string(),
            })
            .await?;
        info!("smtp stored message from {} to {} (subject: {})", from, rcpt, subject);
    }
    Ok(session.rcpts.len())
}

/// Read a dot-terminated DATA payload, enforcing the size cap. Returns
/// `None` when the cap is exceeded; the remainder is still drained so the
/// session stays in sync.
async fn read_data(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    let mut data = String::new();
    let mut oversize = false;
    loop {
        let mut line = String::new();
        let n = read_line(reader, &mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }
        if line == ".\r\n" || line == ".\n" {
            break;
        }
        // Dot-stuffing: a leading ".." encodes a literal ".".
        let line = match line.strip_prefix('.') {
            Some(stripped) => stripped,
            None => line.as_str(),
        };
        if !oversize {
            if data.len() + line.len() > MAX_MESSAGE_BYTES {
                oversize = true;
            } else {
                data.push_str(line);
            }
        }
    }
    Ok((!oversize).then_some(data))
}

/// Extract the Subject header value; `(no subject)` when absent.
fn extract_subject(message: &str) -> String {
    for line in message.lines() {
        let line = line.trim();
        if let Some(value) = strip_prefix_ci(line, "subject:") {
            return value.trim().to_string();
        }
    }
    "(no subject)".to_string()
}

/// Body is everything after the first blank-line header separator
/// (`\n\n` preferred, `\r\n\r\n` fallback); the whole message when no
/// separator exists.
fn extract_body(message: &str) -> String {
    if let Some((_, body)) = message.split_once("\n\n") {
        return body.trim().to_string();
    }
    if let Some((_, body)) = message.split_once("\r\n\r\n") {
        return body.trim().to_string();
    }
    message.to_string()
}

/// Pull the username out of an `AUTH PLAIN` token (`\0user\0pass`) for
/// debug logging. Credentials are never checked.
fn decode_plain_username(token: &str) -> Option<String> {
    let data = B64.decode(token).ok()?;
    let mut parts = data.split(|b| *b == 0);
    let _ = parts.next();
    String::from_utf8(parts.next()?.to_vec()).ok()
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &line[prefix.len()..])
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, buf: &mut String) -> std::io::Result<usize> {
    match timeout(READ_TIMEOUT, reader.read_line(buf)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out")),
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    debug!("smtp => {}", line);
    let out = format!("{line}\r\n");
    let write = async {
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await
    };
    match timeout(WRITE_TIMEOUT, write).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_plain_username, extract_body, extract_subject, strip_prefix_ci};

    #[test]
    fn subject_is_extracted_case_insensitively() {
        assert_eq!(extract_subject("Subject: Hi\r\n\r\nHello"), "Hi");
        assert_eq!(extract_subject("SUBJECT:   spaced   \r\n\r\nx"), "spaced");
        assert_eq!(extract_subject("From: a@b\r\n\r\nno header"), "(no subject)");
    }

    #[test]
    fn body_splits_on_first_blank_line() {
        assert_eq!(extract_body("Subject: Hi\n\nHello"), "Hello");
        assert_eq!(extract_body("Subject: Hi\r\n\r\nHello"), "Hello");
        assert_eq!(extract_body("Subject: Hi\r\n\r\nHello\r\nWorld"), "Hello\r\nWorld");
        // No separator: the whole message is the body.
        assert_eq!(extract_body("just text"), "just text");
    }

    #[test]
    fn mixed_line_endings_prefer_the_lf_split() {
        // The \n\n split is tried first even when a \r\n\r\n separator
        // appears earlier in the message.
        assert_eq!(extract_body("A: 1\r\n\r\nB\n\nC"), "C");
    }

    #[test]
    fn plain_token_username_is_decoded() {
        // "\0user\0pass"
        let token = "AHVzZXIAcGFzcw==";
        assert_eq!(decode_plain_username(token).as_deref(), Some("user"));
        assert_eq!(decode_plain_username("not base64!"), None);
    }

    #[test]
    fn prefix_match_ignores_case() {
        assert_eq!(strip_prefix_ci("MAIL FROM:<a@b>", "MAIL FROM:"), Some("<a@b>"));
        assert_eq!(strip_prefix_ci("mail from:<a@b>", "MAIL FROM:"), Some("<a@b>"));
        assert_eq!(strip_prefix_ci("RCPT TO:<a@b>", "MAIL FROM:"), None);
        assert_eq!(strip_prefix_ci("MAIL", "MAIL FROM:"), None);
    }
}
