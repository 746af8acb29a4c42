//! Provider channels: outbound voice, SMS, and the lead-notification mailbox.

pub mod email;
pub mod twilio;

use async_trait::async_trait;

use crate::error::TelephonyError;

pub use twilio::{TwilioClient, format_phone};

/// Places outbound qualification calls.
#[async_trait]
pub trait Telephony: Send + Sync {
    /// Dial `to` and point the provider at the call-start webhook.
    ///
    /// Returns the provider-assigned call id.
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError>;
}

/// Sends text messages.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `body` to `to`. Returns the provider message id.
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, TelephonyError>;
}
