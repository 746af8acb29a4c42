//! Error types for the lead agent.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Telephony error: {0}")]
    Telephony(#[from] TelephonyError),

    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Call state / marker store errors.
///
/// A missing call record is not an error; lookups return `Option`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Voice call and SMS provider errors.
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),
}

/// CRM write errors. Always consumed as best-effort by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("CRM rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response from CRM: {0}")]
    InvalidResponse(String),
}

/// Lead intake errors (boundary rejects and source I/O).
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Lead source fetch failed: {0}")]
    Fetch(String),
}

/// Pipeline task failures. Terminal for the unit of work that raised them.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No call state for {call_id} (expired or unknown)")]
    CallStateMissing { call_id: String },

    #[error("Call state for {call_id} is corrupt: {reason}")]
    CorruptCallState { call_id: String, reason: String },

    #[error("Task {task} timed out after {timeout:?}")]
    Timeout { task: String, timeout: Duration },

    #[error("Task {task} panicked: {reason}")]
    Panicked { task: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery failed: {0}")]
    Telephony(#[from] TelephonyError),
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,
}

/// Result type alias for the lead agent.
pub type Result<T> = std::result::Result<T, Error>;
