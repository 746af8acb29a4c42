//! Lead intake: parse landing-page notifications, validate, dedup, enqueue.
//!
//! Poll cycle:
//! 1. `LeadSource::fetch_unseen()`: source-specific I/O
//! 2. `claim(processed_email:{id})`: at most one intake per source message
//! 3. `parse_lead()`: label/value form body → `Lead`, boundary validation
//! 4. `TaskQueue::enqueue(ProcessLead)`

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IntakeError;
use crate::pipeline::queue::TaskQueue;
use crate::pipeline::types::{Lead, Task};
use crate::store::StateStore;
use crate::store::traits::{DEDUP_MARKER_TTL, processed_message_key};

/// A raw notification from the intake source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    /// Stable identifier used for dedup.
    pub message_id: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Where lead notifications come from.
#[async_trait]
pub trait LeadSource: Send + Sync {
    async fn fetch_unseen(&self) -> Result<Vec<SourceMessage>, IntakeError>;
}

/// Page metadata applied when a notification omits it.
#[derive(Debug, Clone)]
pub struct PageDefaults {
    pub page_name: String,
    pub page_url: String,
}

/// Form fields as label lines followed by value lines.
struct FormPatterns {
    fname: Regex,
    email: Regex,
    phone: Regex,
    interest: Regex,
    message: Regex,
    campaign_id: Regex,
    page_name: Regex,
    page_url: Regex,
}

fn label(name: &str) -> Regex {
    Regex::new(&format!(r"(?im)^[ \t]*{name}[ \t]*\r?\n\s*(\S.*)$")).unwrap()
}

static PATTERNS: LazyLock<FormPatterns> = LazyLock::new(|| FormPatterns {
    fname: label("fname"),
    email: label("email"),
    phone: label("phone"),
    interest: label("what_kind_of_office_space_are_you_interested_in"),
    message: label("message"),
    campaign_id: label("campaignid"),
    page_name: label("Page Name"),
    page_url: Regex::new(r"(?im)^[ \t]*URL[ \t]*\r?\n\s*(https?://\S+)").unwrap(),
});

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse and validate a notification body into a `Lead`.
pub fn parse_lead(
    body: &str,
    received_at: DateTime<Utc>,
    defaults: &PageDefaults,
) -> Result<Lead, IntakeError> {
    let p = &*PATTERNS;

    let name = capture(&p.fname, body).ok_or(IntakeError::MissingField("fname"))?;
    let email = capture(&p.email, body).ok_or(IntakeError::MissingField("email"))?;
    let phone = capture(&p.phone, body).ok_or(IntakeError::MissingField("phone"))?;
    let interest = capture(&p.interest, body).ok_or(IntakeError::MissingField(
        "what_kind_of_office_space_are_you_interested_in",
    ))?;

    validate_email(&email)?;
    validate_phone(&phone)?;

    Ok(Lead {
        name,
        email,
        phone,
        interest,
        message: capture(&p.message, body),
        campaign_id: capture(&p.campaign_id, body),
        received_at,
        page_name: capture(&p.page_name, body).unwrap_or_else(|| defaults.page_name.clone()),
        page_url: capture(&p.page_url, body).unwrap_or_else(|| defaults.page_url.clone()),
    })
}

fn validate_email(email: &str) -> Result<(), IntakeError> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace)
        });
    if valid {
        Ok(())
    } else {
        Err(IntakeError::InvalidField {
            field: "email",
            reason: format!("not an address: {email}"),
        })
    }
}

fn validate_phone(phone: &str) -> Result<(), IntakeError> {
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if digits >= 10 {
        Ok(())
    } else {
        Err(IntakeError::InvalidField {
            field: "phone",
            reason: format!("expected at least 10 digits, got {digits}"),
        })
    }
}

/// Spawn the background intake poller.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_lead_poller(
    source: Arc<dyn LeadSource>,
    store: Arc<dyn StateStore>,
    queue: TaskQueue,
    defaults: PageDefaults,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Lead poller started");
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Lead poller shutting down");
                return;
            }

            if let Err(e) = poll_once(source.as_ref(), store.as_ref(), &queue, &defaults).await {
                error!(error = %e, "Lead poll failed");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle. Returns the number of leads enqueued.
pub async fn poll_once(
    source: &dyn LeadSource,
    store: &dyn StateStore,
    queue: &TaskQueue,
    defaults: &PageDefaults,
) -> Result<usize, IntakeError> {
    let messages = source.fetch_unseen().await?;
    if messages.is_empty() {
        return Ok(0);
    }
    info!(count = messages.len(), "Fetched lead notifications");

    let mut enqueued = 0;
    for msg in messages {
        let key = processed_message_key(&msg.message_id);
        match store.claim(&key, DEDUP_MARKER_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %msg.message_id, "Already processed, skipping");
                continue;
            }
            Err(e) => {
                warn!(message_id = %msg.message_id, error = %e, "Dedup check failed, skipping");
                continue;
            }
        }

        let lead = match parse_lead(&msg.body, msg.received_at, defaults) {
            Ok(lead) => lead,
            Err(e) => {
                warn!(message_id = %msg.message_id, error = %e, "Rejected lead notification");
                continue;
            }
        };

        let (name, phone) = (lead.name.clone(), lead.phone.clone());
        match queue.enqueue(Task::ProcessLead(lead)) {
            Ok(()) => {
                info!(lead = %name, phone = %phone, "Lead queued");
                enqueued += 1;
            }
            Err(e) => error!(message_id = %msg.message_id, error = %e, "Failed to queue lead"),
        }
    }

    Ok(enqueued)
}
