//! Twilio REST client for outbound calls and SMS.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::channels::{Messenger, Telephony};
use crate::config::TwilioConfig;
use crate::error::TelephonyError;

/// Lifecycle events we ask Twilio to report on the status callback.
const STATUS_CALLBACK_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

#[derive(Debug, Deserialize)]
struct CreatedResource {
    sid: String,
}

/// Twilio account client.
pub struct TwilioClient {
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
    api_base: String,
    /// Base URL Twilio calls back on, no trailing slash.
    webhook_base: String,
    client: reqwest::Client,
}

impl TwilioClient {
    pub fn new(config: &TwilioConfig, public_webhook_url: &str) -> Self {
        Self {
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            webhook_base: format!(
                "{}/webhooks/twilio",
                public_webhook_url.trim_end_matches('/')
            ),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{resource}.json",
            self.api_base, self.account_sid
        )
    }

    async fn create(
        &self,
        resource: &str,
        form: &[(&str, String)],
    ) -> Result<String, TelephonyError> {
        let resp = self
            .client
            .post(self.api_url(resource))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(form)
            .send()
            .await
            .map_err(|e| TelephonyError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreatedResource = resp
            .json()
            .await
            .map_err(|e| TelephonyError::InvalidResponse(e.to_string()))?;
        Ok(created.sid)
    }
}

#[async_trait]
impl Telephony for TwilioClient {
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError> {
        let to = format_phone(to)?;

        let mut form = vec![
            ("To", to.clone()),
            ("From", self.from_number.clone()),
            ("Url", format!("{}/call-start", self.webhook_base)),
            ("Method", "POST".to_string()),
            ("StatusCallback", format!("{}/call-status", self.webhook_base)),
            ("StatusCallbackMethod", "POST".to_string()),
            ("Record", "false".to_string()),
        ];
        form.extend(
            STATUS_CALLBACK_EVENTS
                .iter()
                .map(|e| ("StatusCallbackEvent", e.to_string())),
        );

        match self.create("Calls", &form).await {
            Ok(sid) => {
                info!(to = %to, call_id = %sid, "Call initiated");
                Ok(sid)
            }
            Err(e) => {
                warn!(to = %to, error = %e, "Failed to initiate call");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Messenger for TwilioClient {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, TelephonyError> {
        let to = format_phone(to)?;
        let form = [
            ("To", to.clone()),
            ("From", self.from_number.clone()),
            ("Body", body.to_string()),
            ("StatusCallback", format!("{}/sms-status", self.webhook_base)),
        ];

        let sid = self.create("Messages", &form).await?;
        info!(to = %to, message_id = %sid, "SMS sent");
        Ok(sid)
    }
}

/// Normalize a phone number to E.164, assuming US for bare 10-digit numbers.
pub fn format_phone(raw: &str) -> Result<String, TelephonyError> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(TelephonyError::InvalidNumber(raw.to_string()));
    }
    if digits.len() == 10 && !digits.starts_with('1') {
        digits.insert(0, '1');
    }
    Ok(format!("+{digits}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    #[test]
    fn formats_us_numbers() {
        assert_eq!(format_phone("(555) 123-4567").unwrap(), "+15551234567");
        assert_eq!(format_phone("+1 555 123 4567").unwrap(), "+15551234567");
        assert_eq!(format_phone("44 20 7946 0958").unwrap(), "+442079460958");
        assert!(matches!(
            format_phone("call me"),
            Err(TelephonyError::InvalidNumber(_))
        ));
    }

    #[derive(Default)]
    struct Captured {
        auth: Option<String>,
        body: Option<String>,
    }

    /// Spin up a fake Twilio API on an ephemeral port.
    async fn fake_twilio(status: StatusCode) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));

        async fn handler(
            State((captured, status)): State<(Arc<Mutex<Captured>>, StatusCode)>,
            headers: HeaderMap,
            body: String,
        ) -> (StatusCode, Json<serde_json::Value>) {
            let mut c = captured.lock().await;
            c.auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            c.body = Some(body);
            (status, Json(serde_json::json!({ "sid": "CA123" })))
        }

        let app = Router::new()
            .route("/2010-04-01/Accounts/AC1/Calls.json", post(handler))
            .route("/2010-04-01/Accounts/AC1/Messages.json", post(handler))
            .with_state((Arc::clone(&captured), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn client(api_base: String) -> TwilioClient {
        let config = TwilioConfig {
            account_sid: "AC1".into(),
            auth_token: SecretString::from("secret"),
            from_number: "+15550000000".into(),
            voice: crate::config::DEFAULT_VOICE.into(),
            api_base,
        };
        TwilioClient::new(&config, "https://agent.test/")
    }

    #[tokio::test]
    async fn place_call_posts_form_with_callbacks() {
        let (base, captured) = fake_twilio(StatusCode::CREATED).await;
        let sid = client(base).place_call("555-123-4567").await.unwrap();
        assert_eq!(sid, "CA123");

        let c = captured.lock().await;
        assert!(c.auth.as_deref().unwrap().starts_with("Basic "));
        let body = c.body.as_deref().unwrap();
        assert!(body.contains("To=%2B15551234567"));
        assert!(body.contains("Url=https%3A%2F%2Fagent.test%2Fwebhooks%2Ftwilio%2Fcall-start"));
        assert!(body.contains("StatusCallbackEvent=completed"));
    }

    #[tokio::test]
    async fn rejected_request_surfaces_status() {
        let (base, _) = fake_twilio(StatusCode::BAD_REQUEST).await;
        let err = client(base).send_sms("5551234567", "hi").await.unwrap_err();
        assert!(matches!(err, TelephonyError::Rejected { status: 400, .. }));
    }
}
