//! Configuration types, built from environment variables at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default text-to-speech voice for call prompts.
pub const DEFAULT_VOICE: &str = "Polly.Matthew-Neural";

/// Default landing page metadata for leads whose notification omits it.
pub const DEFAULT_PAGE_NAME: &str = "Mesh Cowork - Private Offices";
pub const DEFAULT_PAGE_URL: &str = "http://tour.meshcowork.com/private-offices/";

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub airtable: AirtableConfig,
    pub pipeline: PipelineConfig,
    /// `None` when `LEAD_IMAP_HOST` is unset (poller disabled).
    pub intake: Option<IntakeConfig>,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
}

/// HTTP listener and the public base URL the telephony provider calls back on.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, no trailing slash.
    pub public_webhook_url: String,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    pub voice: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_key: SecretString,
    pub base_id: String,
    pub table_name: String,
    pub api_base: String,
}

/// Pipeline and qualification settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of queue workers. Each processes one task at a time.
    pub workers: usize,
    /// Hard cap on a single task's execution time.
    pub task_time_limit: Duration,
    /// Red flags at or above this count disqualify a lead.
    pub red_flag_threshold: usize,
    /// Scheduling link included in every follow-up message.
    pub scheduling_link: String,
    pub business_name: String,
    pub default_page_name: String,
    pub default_page_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_time_limit: Duration::from_secs(300), // 5 minutes
            red_flag_threshold: 3,
            scheduling_link: "https://calendly.com/example/tour".to_string(),
            business_name: "Mesh Cowork".to_string(),
            default_page_name: DEFAULT_PAGE_NAME.to_string(),
            default_page_url: DEFAULT_PAGE_URL.to_string(),
        }
    }
}

/// IMAP lead-notification mailbox.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub poll_interval_secs: u64,
    /// Only unseen messages whose subject contains this text are fetched.
    pub subject_filter: String,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let server = ServerConfig {
            host: env.or("LEAD_AGENT_HOST", "0.0.0.0"),
            port: env.parse_or("LEAD_AGENT_PORT", 8000)?,
            public_webhook_url: env
                .required("PUBLIC_WEBHOOK_URL")?
                .trim_end_matches('/')
                .to_string(),
        };

        let twilio = TwilioConfig {
            account_sid: env.required("TWILIO_ACCOUNT_SID")?,
            auth_token: SecretString::from(env.required("TWILIO_AUTH_TOKEN")?),
            from_number: env.required("TWILIO_PHONE_NUMBER")?,
            voice: env.or("TWILIO_VOICE", DEFAULT_VOICE),
            api_base: env.or("TWILIO_API_BASE", "https://api.twilio.com"),
        };

        let airtable = AirtableConfig {
            api_key: SecretString::from(env.required("AIRTABLE_API_KEY")?),
            base_id: env.required("AIRTABLE_BASE_ID")?,
            table_name: env.or("AIRTABLE_TABLE_NAME", "Leads"),
            api_base: env.or("AIRTABLE_API_BASE", "https://api.airtable.com"),
        };

        let defaults = PipelineConfig::default();
        let workers: usize = env.parse_or("PIPELINE_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_WORKERS".into(),
                message: "must be at least 1".into(),
            });
        }
        let threshold: usize =
            env.parse_or("QUALIFICATION_RED_FLAG_THRESHOLD", defaults.red_flag_threshold)?;
        if threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUALIFICATION_RED_FLAG_THRESHOLD".into(),
                message: "must be at least 1".into(),
            });
        }
        let pipeline = PipelineConfig {
            workers,
            task_time_limit: Duration::from_secs(
                env.parse_or("TASK_TIME_LIMIT_SECS", defaults.task_time_limit.as_secs())?,
            ),
            red_flag_threshold: threshold,
            scheduling_link: env.required("CALENDLY_LINK")?,
            business_name: env.or("BUSINESS_NAME", &defaults.business_name),
            default_page_name: env.or("DEFAULT_PAGE_NAME", DEFAULT_PAGE_NAME),
            default_page_url: env.or("DEFAULT_PAGE_URL", DEFAULT_PAGE_URL),
        };

        let intake = match env.get("LEAD_IMAP_HOST") {
            Some(imap_host) => Some(IntakeConfig {
                imap_host,
                imap_port: env.parse_or("LEAD_IMAP_PORT", 993)?,
                username: env.or("LEAD_IMAP_USERNAME", ""),
                password: SecretString::from(env.or("LEAD_IMAP_PASSWORD", "")),
                poll_interval_secs: env.parse_or("LEAD_POLL_INTERVAL_SECS", 30)?,
                subject_filter: env.or("LEAD_EMAIL_SUBJECT", "new lead has been captured"),
            }),
            None => None,
        };

        Ok(Self {
            server,
            twilio,
            airtable,
            pipeline,
            intake,
            db_path: PathBuf::from(env.or("LEAD_AGENT_DB_PATH", "./data/lead-agent.db")),
            log_dir: PathBuf::from(env.or("LEAD_AGENT_LOG_DIR", "./logs")),
        })
    }
}

/// Thin wrapper over a lookup function; empty values count as unset.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}
