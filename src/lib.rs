//! Lead Agent: outbound qualification calls for inbound leads.

pub mod activity;
pub mod channels;
pub mod config;
pub mod crm;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod voice;
pub mod webhooks;
