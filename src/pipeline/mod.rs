//! Lead pipeline: intake, qualification, and the task queue that drives calls
//! from first contact through follow-up.
//!
//! Flow:
//! 1. `intake::poll_once()` parses and dedups notifications, enqueues `ProcessLead`
//! 2. `LeadPipeline::process_lead()` dials and stores call state
//! 3. Webhooks collect answers; a terminal call status enqueues `FinalizeCall`
//! 4. `LeadPipeline::finalize_call()` scores, writes the CRM row, yields `SendFollowUp`

pub mod intake;
pub mod qualification;
pub mod queue;
pub mod tasks;
pub mod types;

pub use qualification::{CallAnswers, Decision, QualificationEngine, Verdict};
pub use queue::{TaskQueue, TaskReceiver, TaskRunner, WorkerSettings, spawn_workers};
pub use tasks::{LeadPipeline, PipelineServices};
pub use types::{CallState, FollowUp, Lead, LeadRecord, Task};
