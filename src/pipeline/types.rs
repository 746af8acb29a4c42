//! Shared types for the lead pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::pipeline::qualification::{CallAnswers, Verdict};
use crate::store::CallFields;
use crate::store::traits::answer_field;
use crate::voice::Question;

// ── Lead ────────────────────────────────────────────────────────────

/// A validated lead from the intake source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// First name as submitted.
    pub name: String,
    pub email: String,
    pub phone: String,
    /// Office space category the lead asked about.
    pub interest: String,
    pub message: Option<String>,
    pub campaign_id: Option<String>,
    /// When the intake notification arrived.
    pub received_at: DateTime<Utc>,
    pub page_name: String,
    pub page_url: String,
}

/// Seconds from intake to dial. Never negative, even with clock skew.
pub fn speed_to_lead(received_at: DateTime<Utc>, initiated_at: DateTime<Utc>) -> f64 {
    let millis = (initiated_at - received_at).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

// ── Call state ──────────────────────────────────────────────────────

mod field {
    pub const NAME: &str = "name";
    pub const EMAIL: &str = "email";
    pub const PHONE: &str = "phone";
    pub const INTEREST: &str = "office_space_interest";
    pub const MESSAGE: &str = "message";
    pub const CAMPAIGN_ID: &str = "campaign_id";
    pub const RECEIVED_AT: &str = "email_received_at";
    pub const INITIATED_AT: &str = "call_initiated_at";
    pub const SPEED_TO_LEAD: &str = "speed_to_lead_seconds";
    pub const PAGE_NAME: &str = "page_name";
    pub const PAGE_URL: &str = "page_url";
}

/// Everything the webhooks and finalization need about one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallState {
    pub lead: Lead,
    pub call_initiated_at: DateTime<Utc>,
    pub speed_to_lead_seconds: f64,
    pub answers: CallAnswers,
}

impl CallState {
    pub fn new(lead: Lead, call_initiated_at: DateTime<Utc>) -> Self {
        let speed = speed_to_lead(lead.received_at, call_initiated_at);
        Self {
            lead,
            call_initiated_at,
            speed_to_lead_seconds: speed,
            answers: CallAnswers::default(),
        }
    }

    /// Flatten into store fields. Answers are written separately, one per callback.
    pub fn to_fields(&self) -> CallFields {
        let lead = &self.lead;
        let mut fields = CallFields::new();
        let mut put = |k: &str, v: String| {
            fields.insert(k.to_string(), v);
        };
        put(field::NAME, lead.name.clone());
        put(field::EMAIL, lead.email.clone());
        put(field::PHONE, lead.phone.clone());
        put(field::INTEREST, lead.interest.clone());
        put(field::MESSAGE, lead.message.clone().unwrap_or_default());
        put(field::CAMPAIGN_ID, lead.campaign_id.clone().unwrap_or_default());
        put(field::RECEIVED_AT, lead.received_at.to_rfc3339());
        put(field::INITIATED_AT, self.call_initiated_at.to_rfc3339());
        put(field::SPEED_TO_LEAD, self.speed_to_lead_seconds.to_string());
        put(field::PAGE_NAME, lead.page_name.clone());
        put(field::PAGE_URL, lead.page_url.clone());
        fields
    }

    /// Rebuild from store fields. Timestamps must parse; other fields default.
    pub fn from_fields(call_id: &str, fields: &CallFields) -> Result<Self, TaskError> {
        let text = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let optional = |k: &str| fields.get(k).filter(|v| !v.is_empty()).cloned();
        let timestamp = |k: &str| -> Result<DateTime<Utc>, TaskError> {
            let raw = fields.get(k).ok_or_else(|| TaskError::CorruptCallState {
                call_id: call_id.to_string(),
                reason: format!("missing {k}"),
            })?;
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| TaskError::CorruptCallState {
                    call_id: call_id.to_string(),
                    reason: format!("{k}: {e}"),
                })
        };

        let received_at = timestamp(field::RECEIVED_AT)?;
        let call_initiated_at = timestamp(field::INITIATED_AT)?;

        let mut answers = CallAnswers::default();
        for question in Question::ALL {
            if let Some(text) = fields.get(&answer_field(question.id())) {
                answers.set(question, text.clone());
            }
        }

        let interest = optional(field::INTEREST).unwrap_or_else(|| "Other".to_string());

        Ok(Self {
            lead: Lead {
                name: text(field::NAME),
                email: text(field::EMAIL),
                phone: text(field::PHONE),
                interest,
                message: optional(field::MESSAGE),
                campaign_id: optional(field::CAMPAIGN_ID),
                received_at,
                page_name: text(field::PAGE_NAME),
                page_url: text(field::PAGE_URL),
            },
            call_initiated_at,
            speed_to_lead_seconds: fields
                .get(field::SPEED_TO_LEAD)
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| speed_to_lead(received_at, call_initiated_at)),
            answers,
        })
    }

    /// Lead name for the greeting, without parsing the whole record.
    pub fn lead_name(fields: &CallFields) -> &str {
        fields.get(field::NAME).map(String::as_str).unwrap_or("there")
    }
}

// ── Finalized lead record ───────────────────────────────────────────

/// The row written to the CRM.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadRecord {
    pub lead: Lead,
    pub call_id: Option<String>,
    pub call_status: Option<String>,
    pub call_duration_secs: u32,
    pub answers: Option<CallAnswers>,
    pub verdict: Verdict,
    pub reason: String,
    pub call_initiated_at: Option<DateTime<Utc>>,
    pub call_completed_at: Option<DateTime<Utc>>,
    pub sms_sent_at: Option<DateTime<Utc>>,
    pub speed_to_lead_seconds: f64,
    pub created_at: DateTime<Utc>,
}

// ── Work items ──────────────────────────────────────────────────────

/// Follow-up message request produced by finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub phone: String,
    pub name: String,
    pub qualified: bool,
    /// CRM record to stamp with the send time, when the CRM write succeeded.
    pub record_id: Option<String>,
}

/// A unit of work for the pipeline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ProcessLead(Lead),
    FinalizeCall {
        call_id: String,
        call_status: String,
        duration_secs: u32,
    },
    SendFollowUp(FollowUp),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessLead(_) => "process_lead",
            Self::FinalizeCall { .. } => "finalize_call",
            Self::SendFollowUp(_) => "send_follow_up",
        }
    }

    /// Short identifier for logs.
    pub fn subject(&self) -> &str {
        match self {
            Self::ProcessLead(lead) => &lead.phone,
            Self::FinalizeCall { call_id, .. } => call_id,
            Self::SendFollowUp(f) => &f.phone,
        }
    }
}

/// Result of the intake task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Called { call_id: String },
    /// The call could not be placed. A `call_failed` CRM record was attempted.
    CallFailed,
}
