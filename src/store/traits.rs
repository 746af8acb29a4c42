//! `StateStore` trait: the ephemeral key-value store shared by the webhook
//! gateway and the pipeline workers.
//!
//! Holds three kinds of TTL-bounded data:
//! - call state: one field map per provider call id
//! - presence markers: dedup and claim keys
//! - lead timestamps: intake time per phone number, for speed-to-lead
//!
//! Every operation is atomic per key. Nothing here is transactional across keys.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Field map stored per call.
pub type CallFields = BTreeMap<String, String>;

/// Call state lives this long after the last `put_call`.
pub const CALL_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Intake dedup markers live for a week.
pub const DEDUP_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lead intake timestamps live for a day.
pub const LEAD_TIMESTAMP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Field name an answer for `question_id` is stored under.
pub fn answer_field(question_id: &str) -> String {
    format!("answer_{question_id}")
}

/// Marker key for an intake source message.
pub fn processed_message_key(message_id: &str) -> String {
    format!("processed_email:{message_id}")
}

/// Claim key guarding finalization of a call.
pub fn finalize_claim_key(call_id: &str) -> String {
    format!("finalize:{call_id}")
}

pub(crate) fn lead_timestamp_key(phone: &str) -> String {
    format!("lead_timestamp:{phone}")
}

/// Backend-agnostic TTL key-value store.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ── Call state ──────────────────────────────────────────────────

    /// Merge `fields` into the call's record and reset its expiry.
    ///
    /// An expired record is replaced rather than merged into.
    async fn put_call(&self, call_id: &str, fields: &CallFields) -> Result<(), StoreError>;

    /// Full field map for a live call, or `None` if unknown or expired.
    async fn get_call(&self, call_id: &str) -> Result<Option<CallFields>, StoreError>;

    /// Store one answer without touching the rest of the record or its expiry.
    ///
    /// Returns `false` when the call has no live record; no record is created.
    async fn set_answer(
        &self,
        call_id: &str,
        question_id: &str,
        text: &str,
    ) -> Result<bool, StoreError>;

    // ── Markers ─────────────────────────────────────────────────────

    /// Set (or refresh) a presence marker.
    async fn mark(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Whether a live marker exists.
    async fn is_marked(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a marker only if no live one exists. Returns `true` for the first caller.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop a marker so the next `claim` on it succeeds.
    async fn release(&self, key: &str) -> Result<(), StoreError>;

    // ── Lead timestamps ─────────────────────────────────────────────

    async fn store_lead_timestamp(&self, phone: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn lead_timestamp(&self, phone: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Delete expired entries. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers() {
        assert_eq!(answer_field("q3"), "answer_q3");
        assert_eq!(processed_message_key("42"), "processed_email:42");
        assert_eq!(finalize_claim_key("CA1"), "finalize:CA1");
        assert_eq!(lead_timestamp_key("+15550001111"), "lead_timestamp:+15550001111");
    }
}
