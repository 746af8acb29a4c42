//! Lead-notification mailbox over raw IMAP + TLS.
//!
//! Landing-page form submissions arrive as notification emails. Each poll
//! searches the inbox for unseen messages whose subject matches the
//! configured filter, parses them, and flags them `\Seen`.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::pipeline::intake::{LeadSource, SourceMessage};

/// Error type for the blocking IMAP session.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// IMAP mailbox holding lead notifications.
pub struct ImapLeadSource {
    config: IntakeConfig,
}

impl ImapLeadSource {
    pub fn new(config: IntakeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LeadSource for ImapLeadSource {
    async fn fetch_unseen(&self) -> Result<Vec<SourceMessage>, IntakeError> {
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| IntakeError::Fetch(format!("IMAP task panicked: {e}")))?
            .map_err(|e| IntakeError::Fetch(e.to_string()))
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push('\n');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Keep line structure; the lead parser is line oriented.
    result
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract readable text from a parsed email, preferring the plain part.
fn extract_text(parsed: &mail_parser::Message) -> Option<String> {
    if let Some(text) = parsed.body_text(0) {
        return Some(text.to_string());
    }
    if let Some(html) = parsed.body_html(0) {
        return Some(strip_html(html.as_ref()));
    }
    parsed.attachments().find_map(|part| {
        let is_text = MimeHeaders::content_type(part).is_some_and(|ct| ct.ctype() == "text");
        if is_text {
            std::str::from_utf8(part.contents()).ok().map(String::from)
        } else {
            None
        }
    })
}

/// Turn a raw RFC 822 message into a source message.
///
/// Returns `None` when the message cannot be parsed or has no readable body.
pub fn source_message_from_raw(raw: &[u8], fallback_id: &str) -> Option<SourceMessage> {
    let parsed = MessageParser::default().parse(raw)?;
    let body = extract_text(&parsed).filter(|b| !b.trim().is_empty())?;

    let message_id = parsed
        .message_id()
        .map(String::from)
        .unwrap_or_else(|| fallback_id.to_string());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(SourceMessage {
        message_id,
        body,
        received_at,
    })
}

/// Quote a string for use as an IMAP quoted atom.
fn imap_quote(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Stable id for a notification without a Message-ID header, so a message that
/// stays unseen is still recognized on the next poll.
fn content_message_id(raw: &[u8]) -> String {
    format!("sha256-{:x}", Sha256::digest(raw))
}

/// Message sequence numbers from `* SEARCH` response lines.
fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(String::from))
        .collect()
}

/// Fetch matching unseen messages via raw IMAP over TLS (blocking, run in spawn_blocking).
fn fetch_unseen_imap(config: &IntakeConfig) -> Result<Vec<SourceMessage>, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN {} {}",
            imap_quote(&config.username),
            imap_quote(config.password.expose_secret())
        ),
    )?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;

    let search = send_cmd(
        &mut tls,
        "A3",
        &format!("SEARCH UNSEEN SUBJECT {}", imap_quote(&config.subject_filter)),
    )?;
    let ids = parse_search_response(&search);
    debug!(count = ids.len(), "Unseen lead notifications");

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for id in &ids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {id} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        let fallback_id = content_message_id(raw.as_bytes());
        match source_message_from_raw(raw.as_bytes(), &fallback_id) {
            Some(msg) => results.push(msg),
            None => warn!(seq = %id, "Skipping unreadable lead notification"),
        }

        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, &store_tag, &format!("STORE {id} +FLAGS (\\Seen)"));
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    IoWrite::write_all(tls, format!("{tag} {cmd}\r\n").as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            return Ok(lines);
        }
    }
}
