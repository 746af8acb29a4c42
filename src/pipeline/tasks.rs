//! The three units of pipeline work: intake, finalization, follow-up.
//!
//! Each is safe to re-run. Downstream CRM writes are best-effort and never
//! block the follow-up message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::activity::{ActivityEvent, ActivityType, AuditSink, record_best_effort};
use crate::channels::{Messenger, Telephony};
use crate::config::PipelineConfig;
use crate::crm::{Crm, RecordFields, best_effort};
use crate::error::TaskError;
use crate::pipeline::qualification::{QualificationEngine, Verdict};
use crate::pipeline::queue::TaskRunner;
use crate::pipeline::types::{
    CallState, FollowUp, IntakeOutcome, Lead, LeadRecord, Task, speed_to_lead,
};
use crate::store::StateStore;

/// Follow-up message wording.
#[derive(Debug, Clone)]
pub struct FollowUpTemplates {
    pub business_name: String,
    pub scheduling_link: String,
}

impl FollowUpTemplates {
    pub fn render(&self, name: &str, qualified: bool) -> String {
        let (business, link) = (&self.business_name, &self.scheduling_link);
        if qualified {
            format!(
                "Hi {name}! Thanks for speaking with us. Book your tour at {business} here: {link} \
                 We look forward to meeting you!"
            )
        } else {
            format!(
                "Hi {name}! Thanks for your interest in {business}. While we may not be the \
                 perfect fit right now, feel free to reach out if your needs change. \
                 You can always book a tour: {link}"
            )
        }
    }
}

/// Service collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineServices {
    pub store: Arc<dyn StateStore>,
    pub telephony: Arc<dyn Telephony>,
    pub messenger: Arc<dyn Messenger>,
    pub crm: Arc<dyn Crm>,
    pub audit: Arc<dyn AuditSink>,
}

/// Executes pipeline tasks against injected services.
pub struct LeadPipeline {
    services: PipelineServices,
    engine: QualificationEngine,
    templates: FollowUpTemplates,
}

impl LeadPipeline {
    pub fn new(services: PipelineServices, config: &PipelineConfig) -> Self {
        Self {
            services,
            engine: QualificationEngine::new(config.red_flag_threshold),
            templates: FollowUpTemplates {
                business_name: config.business_name.clone(),
                scheduling_link: config.scheduling_link.clone(),
            },
        }
    }

    async fn audit(&self, event: ActivityEvent) {
        record_best_effort(self.services.audit.as_ref(), event).await;
    }

    fn audit_detached(&self, event: ActivityEvent) {
        let sink = Arc::clone(&self.services.audit);
        tokio::spawn(async move { record_best_effort(sink.as_ref(), event).await });
    }

    /// Record intake timing, dial the lead, and store call state under the call id.
    pub async fn process_lead(&self, lead: Lead) -> Result<IntakeOutcome, TaskError> {
        info!(lead = %lead.name, phone = %lead.phone, "Processing lead");
        let s = &self.services;

        best_effort(
            s.store.store_lead_timestamp(&lead.phone, lead.received_at).await,
            "store lead timestamp",
        );

        let placed = s.telephony.place_call(&lead.phone).await;
        let call_initiated_at = Utc::now();

        let call_id = match placed {
            Ok(call_id) => call_id,
            Err(e) => {
                error!(
                    lead = %lead.name,
                    phone = %lead.phone,
                    error = %e,
                    "Failed to initiate call"
                );
                let record = LeadRecord {
                    call_id: None,
                    call_status: None,
                    call_duration_secs: 0,
                    answers: None,
                    verdict: Verdict::CallFailed,
                    reason: "Failed to initiate call".to_string(),
                    call_initiated_at: Some(call_initiated_at),
                    call_completed_at: None,
                    sms_sent_at: None,
                    speed_to_lead_seconds: speed_to_lead(lead.received_at, call_initiated_at),
                    created_at: call_initiated_at,
                    lead: lead.clone(),
                };
                best_effort(s.crm.create_record(&record).await, "create call_failed record");
                self.audit(
                    ActivityEvent::new(ActivityType::CallFailed, "failed", e.to_string())
                        .for_lead(&lead.name, &lead.phone),
                )
                .await;
                return Ok(IntakeOutcome::CallFailed);
            }
        };

        let state = CallState::new(lead, call_initiated_at);
        s.store.put_call(&call_id, &state.to_fields()).await?;

        self.audit(
            ActivityEvent::new(
                ActivityType::CallMade,
                "initiated",
                format!("Call initiated: {call_id}"),
            )
            .for_lead(&state.lead.name, &state.lead.phone),
        )
        .await;

        info!(
            call_id = %call_id,
            speed_to_lead_secs = state.speed_to_lead_seconds,
            "Call initiated"
        );
        Ok(IntakeOutcome::Called { call_id })
    }

    /// Score a finished call, persist it, and hand back the follow-up work item.
    pub async fn finalize_call(
        &self,
        call_id: &str,
        call_status: &str,
        duration_secs: u32,
    ) -> Result<Task, TaskError> {
        let s = &self.services;
        let fields = s
            .store
            .get_call(call_id)
            .await?
            .ok_or_else(|| TaskError::CallStateMissing {
                call_id: call_id.to_string(),
            })?;
        let state = CallState::from_fields(call_id, &fields)?;

        let decision = self.engine.decide(&state.answers, call_status);
        let now = Utc::now();
        let record = LeadRecord {
            call_id: Some(call_id.to_string()),
            call_status: Some(call_status.to_string()),
            call_duration_secs: duration_secs,
            answers: Some(state.answers.clone()),
            verdict: decision.verdict,
            reason: decision.reason.clone(),
            call_initiated_at: Some(state.call_initiated_at),
            call_completed_at: Some(now),
            sms_sent_at: None,
            speed_to_lead_seconds: state.speed_to_lead_seconds,
            created_at: now,
            lead: state.lead,
        };

        let record_id = best_effort(s.crm.create_record(&record).await, "create lead record");
        if record_id.is_none() {
            warn!(call_id, "CRM save failed, continuing with follow-up");
        }

        let qualified = decision.verdict.is_qualified();
        let follow_up = FollowUp {
            phone: record.lead.phone.clone(),
            name: record.lead.name.clone(),
            qualified,
            record_id: record_id.clone(),
        };

        // The follow-up goes back to the worker without waiting on the audit write.
        self.audit_detached(
            ActivityEvent::new(
                ActivityType::LeadProcessed,
                if qualified { "qualified" } else { "not_qualified" },
                format!(
                    "Lead finalized: {}. CRM: {}",
                    decision.reason,
                    if record_id.is_some() { "saved" } else { "failed" }
                ),
            )
            .for_lead(&record.lead.name, &record.lead.phone),
        );

        info!(
            call_id,
            verdict = decision.verdict.as_str(),
            reason = %decision.reason,
            "Lead finalized"
        );
        Ok(Task::SendFollowUp(follow_up))
    }

    /// Send the follow-up text and stamp the CRM record on success.
    pub async fn send_follow_up(&self, follow_up: &FollowUp) -> Result<(), TaskError> {
        let s = &self.services;
        let body = self.templates.render(&follow_up.name, follow_up.qualified);

        match s.messenger.send_sms(&follow_up.phone, &body).await {
            Ok(_) => {
                self.audit(
                    ActivityEvent::new(ActivityType::SmsSent, "success", "Follow-up SMS sent")
                        .for_lead(&follow_up.name, &follow_up.phone),
                )
                .await;

                if let Some(record_id) = &follow_up.record_id {
                    let mut fields = RecordFields::new();
                    fields.insert("SMS Sent At".into(), json!(Utc::now().to_rfc3339()));
                    best_effort(
                        s.crm.update_record(record_id, fields).await,
                        "stamp SMS Sent At",
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.audit(
                    ActivityEvent::new(
                        ActivityType::SmsSent,
                        "failed",
                        format!("Follow-up SMS failed: {e}"),
                    )
                    .for_lead(&follow_up.name, &follow_up.phone),
                )
                .await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl TaskRunner for LeadPipeline {
    async fn run(&self, task: Task) -> Result<Option<Task>, TaskError> {
        match task {
            Task::ProcessLead(lead) => {
                self.process_lead(lead).await?;
                Ok(None)
            }
            Task::FinalizeCall {
                call_id,
                call_status,
                duration_secs,
            } => self
                .finalize_call(&call_id, &call_status, duration_secs)
                .await
                .map(Some),
            Task::SendFollowUp(follow_up) => {
                self.send_follow_up(&follow_up).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{CrmError, StoreError, TelephonyError};
    use crate::store::{MemoryActivityLog, MemoryStore};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeTwilio {
        fail: bool,
        sms: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Telephony for FakeTwilio {
        async fn place_call(&self, _to: &str) -> Result<String, TelephonyError> {
            if self.fail {
                Err(TelephonyError::Rejected {
                    status: 400,
                    body: "bad number".into(),
                })
            } else {
                Ok("CA100".into())
            }
        }
    }

    #[async_trait]
    impl Messenger for FakeTwilio {
        async fn send_sms(&self, to: &str, body: &str) -> Result<String, TelephonyError> {
            if self.fail {
                return Err(TelephonyError::Http("connection refused".into()));
            }
            self.sms.lock().await.push((to.into(), body.into()));
            Ok("SM1".into())
        }
    }

    #[derive(Default)]
    struct FakeCrm {
        down: bool,
        created: Mutex<Vec<LeadRecord>>,
        updated: Mutex<Vec<(String, RecordFields)>>,
    }

    #[async_trait]
    impl Crm for FakeCrm {
        async fn create_record(&self, record: &LeadRecord) -> Result<String, CrmError> {
            if self.down {
                return Err(CrmError::Http("timeout".into()));
            }
            self.created.lock().await.push(record.clone());
            Ok("rec1".into())
        }

        async fn update_record(&self, id: &str, fields: RecordFields) -> Result<(), CrmError> {
            self.updated.lock().await.push((id.into(), fields));
            Ok(())
        }
    }

    struct Harness {
        pipeline: LeadPipeline,
        store: Arc<MemoryStore>,
        twilio: Arc<FakeTwilio>,
        crm: Arc<FakeCrm>,
        audit: Arc<MemoryActivityLog>,
    }

    fn harness(twilio: FakeTwilio, crm: FakeCrm) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let twilio = Arc::new(twilio);
        let crm = Arc::new(crm);
        let audit = Arc::new(MemoryActivityLog::new());
        let services = PipelineServices {
            store: store.clone(),
            telephony: twilio.clone(),
            messenger: twilio.clone(),
            crm: crm.clone(),
            audit: audit.clone(),
        };
        Harness {
            pipeline: LeadPipeline::new(services, &PipelineConfig::default()),
            store,
            twilio,
            crm,
            audit,
        }
    }

    fn lead() -> Lead {
        Lead {
            name: "Dana".into(),
            email: "dana@example.com".into(),
            phone: "+15551234567".into(),
            interest: "Private Office".into(),
            message: None,
            campaign_id: None,
            received_at: Utc::now(),
            page_name: "Downtown".into(),
            page_url: "https://tour.test/".into(),
        }
    }

    #[test]
    fn templates() {
        let t = FollowUpTemplates {
            business_name: "Mesh Cowork".into(),
            scheduling_link: "https://cal.test/tour".into(),
        };
        assert_eq!(
            t.render("Dana", true),
            "Hi Dana! Thanks for speaking with us. Book your tour at Mesh Cowork here: \
             https://cal.test/tour We look forward to meeting you!"
        );
        let not = t.render("Dana", false);
        assert!(not.starts_with("Hi Dana! Thanks for your interest in Mesh Cowork."));
        assert!(not.ends_with("You can always book a tour: https://cal.test/tour"));
    }

    #[tokio::test]
    async fn process_lead_stores_call_state() {
        let h = harness(FakeTwilio::default(), FakeCrm::default());
        let outcome = h.pipeline.process_lead(lead()).await.unwrap();
        assert_eq!(outcome, IntakeOutcome::Called { call_id: "CA100".into() });

        let fields = h.store.get_call("CA100").await.unwrap().unwrap();
        assert_eq!(fields["name"], "Dana");
        assert!(h.store.lead_timestamp("+15551234567").await.unwrap().is_some());

        let events = h.audit.events().await;
        assert_eq!(events[0].activity_type, ActivityType::CallMade);
        assert_eq!(events[0].details, "Call initiated: CA100");
    }

    #[tokio::test]
    async fn failed_dial_writes_call_failed_record() {
        let h = harness(
            FakeTwilio {
                fail: true,
                ..Default::default()
            },
            FakeCrm::default(),
        );
        let outcome = h.pipeline.process_lead(lead()).await.unwrap();
        assert_eq!(outcome, IntakeOutcome::CallFailed);

        let created = h.crm.created.lock().await;
        assert_eq!(created[0].verdict, Verdict::CallFailed);
        assert_eq!(created[0].reason, "Failed to initiate call");
        assert_eq!(h.audit.events().await[0].activity_type, ActivityType::CallFailed);
    }

    #[tokio::test]
    async fn finalize_scores_answers_and_survives_crm_outage() {
        let h = harness(
            FakeTwilio::default(),
            FakeCrm {
                down: true,
                ..Default::default()
            },
        );
        h.pipeline.process_lead(lead()).await.unwrap();
        h.store
            .set_answer("CA100", "q1", "ten years")
            .await
            .unwrap();

        let next = h.pipeline.finalize_call("CA100", "completed", 60).await.unwrap();
        let Task::SendFollowUp(follow_up) = next else {
            panic!("expected follow-up, got {next:?}");
        };
        assert!(follow_up.qualified);
        assert_eq!(follow_up.record_id, None);

        let finalized = lead_processed_event(&h.audit).await;
        assert_eq!(finalized.status, "qualified");
        assert!(finalized.details.ends_with("CRM: failed"));
    }

    async fn lead_processed_event(audit: &MemoryActivityLog) -> ActivityEvent {
        loop {
            let events = audit.events().await;
            if let Some(e) = events
                .iter()
                .find(|e| e.activity_type == ActivityType::LeadProcessed)
            {
                return e.clone();
            }
            tokio::task::yield_now().await;
        }
    }

    /// Takes an hour to write each event.
    struct SlowAudit(MemoryActivityLog);

    #[async_trait]
    impl AuditSink for SlowAudit {
        async fn record(&self, event: &ActivityEvent) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.0.record(event).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_audit_does_not_hold_back_follow_up() {
        let store = Arc::new(MemoryStore::new());
        let twilio = Arc::new(FakeTwilio::default());
        let audit = Arc::new(SlowAudit(MemoryActivityLog::new()));
        let pipeline = LeadPipeline::new(
            PipelineServices {
                store: store.clone(),
                telephony: twilio.clone(),
                messenger: twilio,
                crm: Arc::new(FakeCrm::default()),
                audit: audit.clone(),
            },
            &PipelineConfig::default(),
        );
        let state = CallState::new(lead(), Utc::now());
        store.put_call("CA100", &state.to_fields()).await.unwrap();

        let next = tokio::time::timeout(
            Duration::from_secs(1),
            pipeline.finalize_call("CA100", "completed", 30),
        )
        .await
        .expect("follow-up waited on the audit write")
        .unwrap();
        assert!(matches!(next, Task::SendFollowUp(_)));

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(lead_processed_event(&audit.0).await.status, "not_qualified");
    }

    #[tokio::test]
    async fn finalize_without_state_fails() {
        let h = harness(FakeTwilio::default(), FakeCrm::default());
        assert!(matches!(
            h.pipeline.finalize_call("CA404", "completed", 0).await,
            Err(TaskError::CallStateMissing { .. })
        ));
    }

    #[tokio::test]
    async fn follow_up_stamps_crm_record() {
        let h = harness(FakeTwilio::default(), FakeCrm::default());
        let follow_up = FollowUp {
            phone: "+15551234567".into(),
            name: "Dana".into(),
            qualified: false,
            record_id: Some("rec1".into()),
        };
        h.pipeline.send_follow_up(&follow_up).await.unwrap();

        let sent = h.twilio.sms.lock().await;
        assert!(sent[0].1.contains("may not be the perfect fit"));
        let updated = h.crm.updated.lock().await;
        assert_eq!(updated[0].0, "rec1");
        assert!(updated[0].1.contains_key("SMS Sent At"));
    }

    #[tokio::test]
    async fn follow_up_failure_is_audited_and_returned() {
        let h = harness(
            FakeTwilio {
                fail: true,
                ..Default::default()
            },
            FakeCrm::default(),
        );
        let follow_up = FollowUp {
            phone: "+15551234567".into(),
            name: "Dana".into(),
            qualified: true,
            record_id: Some("rec1".into()),
        };
        assert!(matches!(
            h.pipeline.send_follow_up(&follow_up).await,
            Err(TaskError::Telephony(_))
        ));
        assert_eq!(h.audit.events().await[0].status, "failed");
        assert!(h.crm.updated.lock().await.is_empty());
    }
}
