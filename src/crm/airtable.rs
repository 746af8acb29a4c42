//! Airtable REST client.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{Crm, RecordFields};
use crate::config::AirtableConfig;
use crate::error::CrmError;
use crate::pipeline::types::LeadRecord;

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: String,
}

pub struct AirtableClient {
    api_key: SecretString,
    api_base: String,
    base_id: String,
    table_name: String,
    client: reqwest::Client,
}

impl AirtableClient {
    pub fn new(config: &AirtableConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            base_id: config.base_id.clone(),
            table_name: config.table_name.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// `{base}/v0/{base_id}/{table}[/{record_id}]`, with segments percent-encoded.
    fn table_url(&self, record_id: Option<&str>) -> Result<reqwest::Url, CrmError> {
        let mut url = reqwest::Url::parse(&self.api_base)
            .map_err(|e| CrmError::Http(format!("invalid Airtable base URL: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| CrmError::Http("Airtable base URL cannot hold a path".into()))?;
            segments.pop_if_empty();
            segments.extend(["v0", self.base_id.as_str(), self.table_name.as_str()]);
            if let Some(id) = record_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, CrmError> {
        let resp = req
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| CrmError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CrmError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Crm for AirtableClient {
    async fn create_record(&self, record: &LeadRecord) -> Result<String, CrmError> {
        let url = self.table_url(None)?;
        let resp = self
            .send(
                self.client
                    .post(url)
                    .json(&json!({ "fields": record_fields(record) })),
            )
            .await?;

        let created: CreatedRecord = resp
            .json()
            .await
            .map_err(|e| CrmError::InvalidResponse(e.to_string()))?;
        info!(record_id = %created.id, lead = %record.lead.name, "Created CRM record");
        Ok(created.id)
    }

    async fn update_record(&self, record_id: &str, fields: RecordFields) -> Result<(), CrmError> {
        let url = self.table_url(Some(record_id))?;
        self.send(self.client.patch(url).json(&json!({ "fields": fields })))
            .await?;
        info!(record_id, "Updated CRM record");
        Ok(())
    }
}

fn opt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> Value {
    Value::String(t.map(|t| t.to_rfc3339()).unwrap_or_default())
}

/// Map a finalized lead onto the table's columns.
pub fn record_fields(record: &LeadRecord) -> RecordFields {
    let lead = &record.lead;
    let mut fields = RecordFields::new();
    let mut put = |k: &str, v: Value| {
        fields.insert(k.to_string(), v);
    };

    put("Name", json!(lead.name));
    put("Email", json!(lead.email));
    put("Phone", json!(lead.phone));
    put("Office Space Interest", json!(lead.interest));
    put("Message", json!(lead.message.clone().unwrap_or_default()));
    put("Campaign ID", json!(lead.campaign_id.clone().unwrap_or_default()));

    put("Call SID", json!(record.call_id.clone().unwrap_or_default()));
    put("Call Status", json!(record.call_status.clone().unwrap_or_default()));
    put("Call Duration (seconds)", json!(record.call_duration_secs));

    put("Qualification Status", json!(record.verdict.as_str()));
    put("Qualification Reason", json!(record.reason));

    put("Email Received At", json!(lead.received_at.to_rfc3339()));
    put("Call Initiated At", opt_time(record.call_initiated_at));
    put("Call Completed At", opt_time(record.call_completed_at));
    put("SMS Sent At", opt_time(record.sms_sent_at));
    put("Speed to Lead (seconds)", json!(record.speed_to_lead_seconds));

    put("Page Name", json!(lead.page_name));
    put("Page URL", json!(lead.page_url));
    put("Created At", json!(record.created_at.to_rfc3339()));

    if let Some(answers) = &record.answers {
        let answer = |a: &Option<String>| json!(a.clone().unwrap_or_default());
        put("Years in Business", answer(&answers.q1));
        put("Number of Employees", answer(&answers.q2));
        put("Has Clients", answer(&answers.q3));
        put("Budget", answer(&answers.q4));
        put("Office Preference", answer(&answers.q5));
    }

    fields
}
