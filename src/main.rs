use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use lead_agent::activity::AuditSink;
use lead_agent::channels::email::ImapLeadSource;
use lead_agent::channels::TwilioClient;
use lead_agent::config::Settings;
use lead_agent::crm::AirtableClient;
use lead_agent::pipeline::intake::{self, PageDefaults};
use lead_agent::pipeline::{
    Lead, LeadPipeline, PipelineServices, Task, TaskQueue, WorkerSettings, spawn_workers,
};
use lead_agent::store::{self, LibSqlBackend, StateStore};
use lead_agent::voice::VoiceFlow;
use lead_agent::webhooks::{AppState, webhook_routes};

/// `--test-call <phone> <name>`: dial one synthetic lead once the service is up.
fn test_call_args() -> anyhow::Result<Option<(String, String)>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => Ok(None),
        [flag, phone, name] if flag == "--test-call" => Ok(Some((phone.clone(), name.clone()))),
        _ => anyhow::bail!("usage: lead-agent [--test-call <phone> <name>]"),
    }
}

fn test_lead(phone: String, name: String, defaults: &PageDefaults) -> Lead {
    Lead {
        name,
        email: "test@meshcowork.com".to_string(),
        phone,
        interest: "Private Office".to_string(),
        message: Some("This is a test call".to_string()),
        campaign_id: Some("TEST123".to_string()),
        received_at: Utc::now(),
        page_name: defaults.page_name.clone(),
        page_url: defaults.page_url.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let test_call = test_call_args()?;
    let settings = Settings::from_env().context("loading configuration")?;

    // Initialize tracing: stderr plus a daily-rolling file
    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, "lead-agent.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    eprintln!("📞 Lead Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Webhooks: {}/webhooks/twilio",
        settings.server.public_webhook_url
    );
    eprintln!("   Database: {}", settings.db_path.display());

    // ── Store ───────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&settings.db_path)
            .await
            .with_context(|| format!("opening database at {}", settings.db_path.display()))?,
    );
    let state_store: Arc<dyn StateStore> = backend.clone();
    let audit: Arc<dyn AuditSink> = backend;
    let _sweeper = store::spawn_expiry_task(Arc::clone(&state_store), store::EXPIRY_SWEEP_INTERVAL);

    // ── Providers ───────────────────────────────────────────────────────
    let twilio = Arc::new(TwilioClient::new(
        &settings.twilio,
        &settings.server.public_webhook_url,
    ));
    let crm = Arc::new(AirtableClient::new(&settings.airtable));

    // ── Pipeline ────────────────────────────────────────────────────────
    let (queue, receiver) = TaskQueue::channel();
    let pipeline = Arc::new(LeadPipeline::new(
        PipelineServices {
            store: Arc::clone(&state_store),
            telephony: twilio.clone(),
            messenger: twilio,
            crm,
            audit: Arc::clone(&audit),
        },
        &settings.pipeline,
    ));
    let _workers = spawn_workers(
        receiver,
        queue.clone(),
        pipeline,
        Arc::clone(&audit),
        WorkerSettings {
            workers: settings.pipeline.workers,
            time_limit: settings.pipeline.task_time_limit,
        },
    );
    eprintln!(
        "   Workers: {} (limit {}s per task)",
        settings.pipeline.workers,
        settings.pipeline.task_time_limit.as_secs()
    );

    let page_defaults = PageDefaults {
        page_name: settings.pipeline.default_page_name.clone(),
        page_url: settings.pipeline.default_page_url.clone(),
    };

    // ── Lead intake ─────────────────────────────────────────────────────
    let _poller = match settings.intake.clone() {
        Some(intake_config) => {
            let interval = Duration::from_secs(intake_config.poll_interval_secs);
            eprintln!(
                "   Intake: {} (every {}s)",
                intake_config.imap_host, intake_config.poll_interval_secs
            );
            Some(intake::spawn_lead_poller(
                Arc::new(ImapLeadSource::new(intake_config)),
                Arc::clone(&state_store),
                queue.clone(),
                page_defaults.clone(),
                interval,
            ))
        }
        None => {
            eprintln!("   Intake: disabled (LEAD_IMAP_HOST not set)");
            None
        }
    };

    // ── Webhook server ──────────────────────────────────────────────────
    let flow = VoiceFlow::new(
        &settings.server.public_webhook_url,
        settings.twilio.voice.clone(),
        settings.pipeline.business_name.clone(),
    );
    let app = webhook_routes(AppState {
        store: state_store,
        queue: queue.clone(),
        audit,
        flow: Arc::new(flow),
    });

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "Webhook server listening");

    if let Some((phone, name)) = test_call {
        tracing::info!(%phone, %name, "Queueing test call");
        queue.enqueue(Task::ProcessLead(test_lead(phone, name, &page_defaults)))?;
    }

    axum::serve(listener, app).await.context("webhook server")?;
    Ok(())
}
