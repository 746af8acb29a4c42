//! Drives the webhook router end to end against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use lead_agent::activity::ActivityType;
use lead_agent::error::TaskError;
use lead_agent::pipeline::{
    CallState, Lead, Task, TaskQueue, TaskRunner, WorkerSettings, spawn_workers,
};
use lead_agent::store::{MemoryActivityLog, MemoryStore, StateStore};
use lead_agent::voice::VoiceFlow;
use lead_agent::webhooks::{AppState, webhook_routes};

const BASE: &str = "https://agent.test/webhooks/twilio";

/// Forwards every dispatched task to the test.
struct Recorder(mpsc::UnboundedSender<Task>);

#[async_trait]
impl TaskRunner for Recorder {
    async fn run(&self, task: Task) -> Result<Option<Task>, TaskError> {
        let _ = self.0.send(task);
        Ok(None)
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    audit: Arc<MemoryActivityLog>,
    tasks: mpsc::UnboundedReceiver<Task>,
}

fn router(store: Arc<MemoryStore>, queue: TaskQueue, audit: Arc<MemoryActivityLog>) -> Router {
    webhook_routes(AppState {
        store,
        queue,
        audit,
        flow: Arc::new(VoiceFlow::new(
            "https://agent.test",
            "Polly.Matthew-Neural",
            "Mesh Cowork",
        )),
    })
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()))
}

fn harness_with(store: Arc<MemoryStore>) -> Harness {
    let audit = Arc::new(MemoryActivityLog::new());
    let (queue, receiver) = TaskQueue::channel();
    let (tx, tasks) = mpsc::unbounded_channel();
    spawn_workers(
        receiver,
        queue.clone(),
        Arc::new(Recorder(tx)),
        audit.clone(),
        WorkerSettings {
            workers: 1,
            time_limit: Duration::from_secs(5),
        },
    );

    let app = router(store.clone(), queue, audit.clone());
    Harness {
        app,
        store,
        audit,
        tasks,
    }
}

async fn seed_call(store: &MemoryStore, call_id: &str) {
    let lead = Lead {
        name: "Dana".into(),
        email: "dana@example.com".into(),
        phone: "+15551234567".into(),
        interest: "Private Office".into(),
        message: None,
        campaign_id: None,
        received_at: Utc::now(),
        page_name: "Downtown".into(),
        page_url: "https://tour.test/".into(),
    };
    let state = CallState::new(lead, Utc::now());
    store.put_call(call_id, &state.to_fields()).await.unwrap();
}

struct Reply {
    status: StatusCode,
    content_type: String,
    body: String,
}

async fn send(app: &Router, method: &str, uri: &str, form: &str) -> Reply {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    Reply {
        status,
        content_type,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

async fn post(app: &Router, uri: &str, form: &str) -> Reply {
    send(app, "POST", uri, form).await
}

#[tokio::test]
async fn call_start_greets_known_lead() {
    let h = harness();
    seed_call(&h.store, "CA1").await;

    let reply = post(&h.app, "/webhooks/twilio/call-start", "CallSid=CA1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.content_type, "text/xml");
    assert!(reply.body.contains("Hello Dana, this is Mesh Cowork"));
    assert!(reply.body.contains(&format!("{BASE}/question/q1</Redirect>")));
}

#[tokio::test]
async fn call_start_without_state_falls_back() {
    let h = harness();
    let reply = post(&h.app, "/webhooks/twilio/call-start", "CallSid=CA404").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.contains("experiencing technical difficulties"));
    assert!(reply.body.ends_with("<Hangup/></Response>"));
}

#[tokio::test]
async fn question_gathers_speech() {
    let h = harness();
    let reply = post(&h.app, "/webhooks/twilio/question/q3", "CallSid=CA1").await;
    assert!(reply.body.contains(&format!(
        "<Gather input=\"speech\" action=\"{BASE}/answer/q3?retry=0\""
    )));
    assert!(reply.body.contains("Do you currently have clients?"));
    assert!(reply.body.contains(&format!("{BASE}/question/q3?retry=1</Redirect>")));

    let retried = post(&h.app, "/webhooks/twilio/question/q3?retry=1", "CallSid=CA1").await;
    assert!(retried.body.contains(&format!("{BASE}/answer/q3?skip=true</Redirect>")));
}

#[tokio::test]
async fn answer_is_stored_and_flow_advances() {
    let h = harness();
    seed_call(&h.store, "CA1").await;

    let reply = post(
        &h.app,
        "/webhooks/twilio/answer/q1?retry=0",
        "CallSid=CA1&SpeechResult=About+ten+years&Confidence=0.91",
    )
    .await;
    assert!(reply.body.contains(&format!("{BASE}/question/q2</Redirect>")));

    let fields = h.store.get_call("CA1").await.unwrap().unwrap();
    assert_eq!(fields["answer_q1"], "About ten years");
    assert_eq!(fields["name"], "Dana");
}

#[tokio::test]
async fn silence_reprompts_once_then_skips() {
    let h = harness();
    seed_call(&h.store, "CA1").await;

    let first = post(
        &h.app,
        "/webhooks/twilio/answer/q2?retry=0",
        "CallSid=CA1&SpeechResult=",
    )
    .await;
    assert!(first.body.contains(&format!("{BASE}/question/q2?retry=1</Redirect>")));
    let fields = h.store.get_call("CA1").await.unwrap().unwrap();
    assert!(!fields.contains_key("answer_q2"));

    let second = post(&h.app, "/webhooks/twilio/answer/q2?retry=1", "CallSid=CA1").await;
    assert!(second.body.contains(&format!("{BASE}/question/q3</Redirect>")));
    let fields = h.store.get_call("CA1").await.unwrap().unwrap();
    assert_eq!(fields["answer_q2"], "");
}

#[tokio::test]
async fn explicit_skip_advances() {
    let h = harness();
    seed_call(&h.store, "CA1").await;
    let reply = post(&h.app, "/webhooks/twilio/answer/q4?skip=true", "CallSid=CA1").await;
    assert!(reply.body.contains(&format!("{BASE}/question/q5</Redirect>")));
}

#[tokio::test]
async fn last_answer_closes_call() {
    let h = harness();
    seed_call(&h.store, "CA1").await;
    let reply = post(
        &h.app,
        "/webhooks/twilio/answer/q5",
        "CallSid=CA1&SpeechResult=Private+office",
    )
    .await;
    assert!(reply.body.contains("Thank you for answering my questions."));
    assert!(reply.body.ends_with("<Hangup/></Response>"));
}

#[tokio::test]
async fn unknown_question_terminates() {
    let h = harness();
    let reply = post(&h.app, "/webhooks/twilio/answer/q9", "CallSid=CA1&SpeechResult=hi").await;
    assert!(reply.body.contains("Thank you for your time."));
    assert!(reply.body.contains("<Hangup/>"));

    let asked = post(&h.app, "/webhooks/twilio/question/q0", "CallSid=CA1").await;
    assert!(asked.body.contains("Thank you for your time."));
}

#[tokio::test]
async fn answer_without_state_keeps_caller_moving() {
    let h = harness();
    let reply = post(
        &h.app,
        "/webhooks/twilio/answer/q1",
        "CallSid=CA404&SpeechResult=Five+years",
    )
    .await;
    assert!(reply.body.contains(&format!("{BASE}/question/q2</Redirect>")));
    assert!(h.store.get_call("CA404").await.unwrap().is_none());
}

#[tokio::test]
async fn terminal_status_queues_one_finalization() {
    let mut h = harness();

    let ringing = post(
        &h.app,
        "/webhooks/twilio/call-status",
        "CallSid=CA1&CallStatus=ringing",
    )
    .await;
    assert_eq!(ringing.body, r#"{"status":"received"}"#);

    let form = "CallSid=CA1&CallStatus=completed&CallDuration=93";
    post(&h.app, "/webhooks/twilio/call-status", form).await;
    post(&h.app, "/webhooks/twilio/call-status", form).await;

    let task = tokio::time::timeout(Duration::from_secs(2), h.tasks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        task,
        Task::FinalizeCall {
            call_id: "CA1".into(),
            call_status: "completed".into(),
            duration_secs: 93,
        }
    );
    let extra = tokio::time::timeout(Duration::from_millis(200), h.tasks.recv()).await;
    assert!(extra.is_err(), "finalization queued twice");
}

#[tokio::test]
async fn finalization_retries_after_queue_outage() {
    let store = Arc::new(MemoryStore::new());
    let (closed, receiver) = TaskQueue::channel();
    drop(receiver);
    let down = router(store.clone(), closed, Arc::new(MemoryActivityLog::new()));

    let form = "CallSid=CA1&CallStatus=completed&CallDuration=41";
    let reply = post(&down, "/webhooks/twilio/call-status", form).await;
    assert_eq!(reply.status, StatusCode::OK);

    let mut h = harness_with(store);
    post(&h.app, "/webhooks/twilio/call-status", form).await;
    let task = tokio::time::timeout(Duration::from_secs(2), h.tasks.recv())
        .await
        .expect("finalization never queued after the outage")
        .unwrap();
    assert!(matches!(task, Task::FinalizeCall { ref call_id, .. } if call_id == "CA1"));
}

#[tokio::test]
async fn unanswered_call_is_finalized() {
    let mut h = harness();
    post(&h.app, "/webhooks/twilio/call-status", "CallSid=CA2&CallStatus=no-answer").await;

    let task = tokio::time::timeout(Duration::from_secs(2), h.tasks.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        task,
        Task::FinalizeCall { ref call_status, duration_secs: 0, .. } if call_status == "no-answer"
    ));
}

#[tokio::test]
async fn sms_status_is_audited() {
    let h = harness();
    let reply = post(
        &h.app,
        "/webhooks/twilio/sms-status",
        "MessageSid=SM1&MessageStatus=delivered&To=%2B15551234567",
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let events = h.audit.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].activity_type, ActivityType::SmsStatus);
    assert_eq!(events[0].status, "delivered");
    assert_eq!(events[0].lead_phone.as_deref(), Some("+15551234567"));
}

#[tokio::test]
async fn health_reports_store() {
    let h = harness();
    let reply = send(&h.app, "GET", "/health", "").await;
    assert_eq!(reply.status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "connected");
    assert!(body["timestamp"].is_string());
}
