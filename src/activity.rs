//! Activity audit trail: append-only events written by every pipeline stage.
//!
//! The core never reads these back. Writes are best-effort: a failed audit
//! write is logged and the caller carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    CallMade,
    CallFailed,
    LeadProcessed,
    SmsSent,
    SmsStatus,
    TaskFailed,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallMade => "call_made",
            Self::CallFailed => "call_failed",
            Self::LeadProcessed => "lead_processed",
            Self::SmsSent => "sms_sent",
            Self::SmsStatus => "sms_status",
            Self::TaskFailed => "task_failed",
        }
    }
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub activity_type: ActivityType,
    pub lead_name: Option<String>,
    pub lead_phone: Option<String>,
    /// Outcome, e.g. "initiated", "success", "failed", "qualified".
    pub status: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(
        activity_type: ActivityType,
        status: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            activity_type,
            lead_name: None,
            lead_phone: None,
            status: status.into(),
            details: details.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the lead this event concerns.
    pub fn for_lead(mut self, name: impl Into<String>, phone: impl Into<String>) -> Self {
        self.lead_name = Some(name.into());
        self.lead_phone = Some(phone.into());
        self
    }
}

/// Write-only audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &ActivityEvent) -> Result<(), StoreError>;
}

/// Record an event, logging instead of propagating a failure.
pub async fn record_best_effort(sink: &dyn AuditSink, event: ActivityEvent) {
    if let Err(e) = sink.record(&event).await {
        warn!(
            activity = event.activity_type.as_str(),
            error = %e,
            "Failed to record activity"
        );
    }
}
