//! CRM persistence for finalized leads. Every write is best-effort.

pub mod airtable;

use std::fmt::Display;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::CrmError;
use crate::pipeline::types::LeadRecord;

pub use airtable::AirtableClient;

/// Column values for a partial update.
pub type RecordFields = Map<String, Value>;

#[async_trait]
pub trait Crm: Send + Sync {
    /// Create a lead row. Returns the CRM record id.
    async fn create_record(&self, record: &LeadRecord) -> Result<String, CrmError>;

    /// Patch selected columns of an existing row.
    async fn update_record(&self, record_id: &str, fields: RecordFields) -> Result<(), CrmError>;
}

/// Log-and-continue for writes whose failure must not stop the pipeline.
pub fn best_effort<T, E: Display>(result: Result<T, E>, action: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(action, error = %e, "Best-effort write failed, continuing");
            None
        }
    }
}
