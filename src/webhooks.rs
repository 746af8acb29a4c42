//! Telephony webhook gateway.
//!
//! Every voice endpoint answers with TwiML, including on errors: a call must
//! never hear a provider error page. Handlers touch only the state store and
//! the task queue.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{
        Path, Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEvent, ActivityType, AuditSink, record_best_effort};
use crate::pipeline::TaskQueue;
use crate::pipeline::types::{CallState, Task};
use crate::store::StateStore;
use crate::store::traits::{DEDUP_MARKER_TTL, finalize_claim_key};
use crate::voice::{Capture, Question, VoiceFlow};

/// Call statuses after which no further callbacks arrive for the call.
pub const TERMINAL_STATUSES: [&str; 5] =
    ["completed", "busy", "no-answer", "failed", "canceled"];

/// Shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: TaskQueue,
    pub audit: Arc<dyn AuditSink>,
    pub flow: Arc<VoiceFlow>,
}

/// Build the router: Twilio callbacks under `/webhooks/twilio`, plus `/health`.
pub fn webhook_routes(state: AppState) -> Router {
    let twilio = Router::new()
        .route("/call-start", post(call_start))
        .route("/question/{id}", post(question))
        .route("/answer/{id}", post(answer))
        .route("/call-status", post(call_status))
        .route("/sms-status", post(sms_status));

    Router::new()
        .nest("/webhooks/twilio", twilio)
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// A TwiML document.
struct Twiml(String);

impl IntoResponse for Twiml {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, "text/xml")], self.0).into_response()
    }
}

// ── Request shapes ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnswerForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "SpeechResult")]
    speech_result: Option<String>,
    #[serde(rename = "Confidence")]
    confidence: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatusForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
    #[serde(rename = "CallDuration")]
    call_duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmsStatusForm {
    #[serde(rename = "MessageSid")]
    message_sid: String,
    #[serde(rename = "MessageStatus")]
    message_status: String,
    #[serde(rename = "To")]
    to: Option<String>,
}

/// Flow position carried between callbacks.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FlowQuery {
    retry: u32,
    skip: bool,
}

fn flow_query(query: Result<Query<FlowQuery>, QueryRejection>) -> FlowQuery {
    match query {
        Ok(Query(q)) => q,
        Err(e) => {
            warn!(error = %e, "Malformed flow query, starting from retry 0");
            FlowQuery::default()
        }
    }
}

// ── Voice ───────────────────────────────────────────────────────────────

async fn call_start(
    State(state): State<AppState>,
    form: Result<Form<CallForm>, FormRejection>,
) -> Twiml {
    let Ok(Form(form)) = form else {
        warn!("call-start without a readable form");
        return Twiml(state.flow.fallback());
    };

    match state.store.get_call(&form.call_sid).await {
        Ok(Some(fields)) => {
            info!(call_id = %form.call_sid, "Call answered");
            Twiml(state.flow.greeting(CallState::lead_name(&fields)))
        }
        Ok(None) => {
            warn!(call_id = %form.call_sid, "No call state for answered call");
            Twiml(state.flow.fallback())
        }
        Err(e) => {
            error!(call_id = %form.call_sid, error = %e, "Call state lookup failed");
            Twiml(state.flow.fallback())
        }
    }
}

async fn question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<FlowQuery>, QueryRejection>,
) -> Twiml {
    let q = flow_query(query);
    debug!(question = %id, retry = q.retry, "Asking question");
    Twiml(state.flow.ask(&id, q.retry))
}

async fn answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<FlowQuery>, QueryRejection>,
    form: Result<Form<AnswerForm>, FormRejection>,
) -> Twiml {
    let Some(question) = Question::parse(&id) else {
        warn!(question = %id, "Answer for unknown question");
        return Twiml(state.flow.terminate());
    };
    let Ok(Form(form)) = form else {
        warn!(question = %id, "Answer without a readable form");
        return Twiml(state.flow.fallback());
    };
    let q = flow_query(query);

    let capture = Capture::classify(form.speech_result.as_deref(), q.retry, q.skip);
    info!(
        call_id = %form.call_sid,
        %question,
        confidence = form.confidence.as_deref().unwrap_or(""),
        ?capture,
        "Answer received"
    );

    if let Some(text) = capture.stored_text() {
        match state.store.set_answer(&form.call_sid, question.id(), text).await {
            Ok(true) => {}
            // Partial calls are valid; keep the caller moving.
            Ok(false) => {
                warn!(call_id = %form.call_sid, %question, "No call state, answer dropped")
            }
            Err(e) => {
                error!(call_id = %form.call_sid, %question, error = %e, "Answer not stored");
                return Twiml(state.flow.fallback());
            }
        }
    }

    Twiml(state.flow.after_capture(question, &capture))
}

// ── Status callbacks ────────────────────────────────────────────────────

async fn call_status(State(state): State<AppState>, Form(form): Form<StatusForm>) -> Json<Value> {
    let duration_secs = form
        .call_duration
        .as_deref()
        .and_then(|d| d.parse::<u32>().ok())
        .unwrap_or(0);
    info!(
        call_id = %form.call_sid,
        status = %form.call_status,
        duration_secs,
        "Call status"
    );

    if TERMINAL_STATUSES.contains(&form.call_status.as_str()) && !form.call_sid.is_empty() {
        schedule_finalization(&state, form.call_sid, form.call_status, duration_secs).await;
    }

    Json(json!({ "status": "received" }))
}

/// Enqueue finalization at most once per call id.
///
/// The claim is released when the task cannot be queued, so a later status
/// callback can try again. If the claim itself cannot be checked the task is
/// queued anyway.
async fn schedule_finalization(
    state: &AppState,
    call_id: String,
    call_status: String,
    duration_secs: u32,
) {
    let claim_key = finalize_claim_key(&call_id);
    let claimed = match state.store.claim(&claim_key, DEDUP_MARKER_TTL).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(call_id = %call_id, "Finalization already queued");
            return;
        }
        Err(e) => {
            error!(call_id = %call_id, error = %e, "Finalization claim failed, queueing anyway");
            false
        }
    };

    let task = Task::FinalizeCall {
        call_id: call_id.clone(),
        call_status,
        duration_secs,
    };
    if let Err(e) = state.queue.enqueue(task) {
        error!(call_id = %call_id, error = %e, "Failed to queue finalization");
        if claimed {
            if let Err(e) = state.store.release(&claim_key).await {
                error!(call_id = %call_id, error = %e, "Failed to release finalization claim");
            }
        }
    }
}

async fn sms_status(State(state): State<AppState>, Form(form): Form<SmsStatusForm>) -> Json<Value> {
    info!(message_id = %form.message_sid, status = %form.message_status, "SMS status");

    let mut event = ActivityEvent::new(
        ActivityType::SmsStatus,
        form.message_status.clone(),
        format!("SMS {}: {}", form.message_sid, form.message_status),
    );
    event.lead_phone = form.to;
    record_best_effort(state.audit.as_ref(), event).await;

    Json(json!({ "status": "received" }))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    let connected = match state.store.health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    };
    Json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "store": if connected { "connected" } else { "disconnected" },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
