//! libSQL backend for `StateStore` and `AuditSink`.
//!
//! Call state is a JSON object per row, merged in place with `json_patch` so
//! concurrent webhook writes to different fields never clobber each other.
//! Expiry is an absolute unix-millis column checked on every read.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::activity::{ActivityEvent, AuditSink};
use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    CALL_STATE_TTL, CallFields, LEAD_TIMESTAMP_TTL, StateStore, answer_field, lead_timestamp_key,
};

/// libSQL store.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    call_ttl: Duration,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            call_ttl: CALL_STATE_TTL,
        })
    }

    /// Override the call state retention window.
    pub fn with_call_ttl(mut self, ttl: Duration) -> Self {
        self.call_ttl = ttl;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// JSON path for a top-level key, quoted so arbitrary ids stay literal.
fn json_key_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

#[async_trait]
impl StateStore for LibSqlBackend {
    async fn put_call(&self, call_id: &str, fields: &CallFields) -> Result<(), StoreError> {
        let json = serde_json::to_string(fields)
            .map_err(|e| StoreError::Serialization(format!("call fields: {e}")))?;
        let now = now_millis();

        self.conn()
            .execute(
                "INSERT INTO call_states (call_id, fields, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(call_id) DO UPDATE SET
                    fields = CASE
                        WHEN call_states.expires_at <= ?4 THEN excluded.fields
                        ELSE json_patch(call_states.fields, excluded.fields)
                    END,
                    expires_at = excluded.expires_at",
                params![call_id, json, expiry_millis(self.call_ttl), now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_call: {e}")))?;

        debug!(call_id, fields = fields.len(), "Call state stored");
        Ok(())
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallFields>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT fields FROM call_states WHERE call_id = ?1 AND expires_at > ?2",
                params![call_id, now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_call: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_call: {e}")))?
        else {
            return Ok(None);
        };

        let raw: String = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("get_call: {e}")))?;
        let fields = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Serialization(format!("call {call_id}: {e}")))?;
        Ok(Some(fields))
    }

    async fn set_answer(
        &self,
        call_id: &str,
        question_id: &str,
        text: &str,
    ) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE call_states SET fields = json_set(fields, ?1, ?2)
                 WHERE call_id = ?3 AND expires_at > ?4",
                params![
                    json_key_path(&answer_field(question_id)),
                    text,
                    call_id,
                    now_millis()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_answer: {e}")))?;

        Ok(changed > 0)
    }

    async fn mark(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO kv_entries (key, value, expires_at) VALUES (?1, '1', ?2)",
                params![key, expiry_millis(ttl)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark: {e}")))?;
        Ok(())
    }

    async fn is_marked(&self, key: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("is_marked: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("is_marked: {e}")))?;
        Ok(row.is_some())
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, '1', ?2)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at
                 WHERE kv_entries.expires_at <= ?3",
                params![key, expiry_millis(ttl), now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim: {e}")))?;

        Ok(changed > 0)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("release: {e}")))?;
        Ok(())
    }

    async fn store_lead_timestamp(&self, phone: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![
                    lead_timestamp_key(phone),
                    at.to_rfc3339(),
                    expiry_millis(LEAD_TIMESTAMP_TTL)
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("store_lead_timestamp: {e}")))?;
        Ok(())
    }

    async fn lead_timestamp(&self, phone: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                params![lead_timestamp_key(phone), now_millis()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("lead_timestamp: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("lead_timestamp: {e}")))?
        else {
            return Ok(None);
        };

        let raw: String = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("lead_timestamp: {e}")))?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| StoreError::Serialization(format!("lead timestamp for {phone}: {e}")))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let calls = self
            .conn()
            .execute(
                "DELETE FROM call_states WHERE expires_at <= ?1",
                params![now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("purge call_states: {e}")))?;
        let entries = self
            .conn()
            .execute("DELETE FROM kv_entries WHERE expires_at <= ?1", params![now])
            .await
            .map_err(|e| StoreError::Query(format!("purge kv_entries: {e}")))?;

        Ok((calls + entries) as usize)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| StoreError::Connection(format!("health check: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for LibSqlBackend {
    async fn record(&self, event: &ActivityEvent) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO activity
                    (id, activity_type, lead_name, lead_phone, status, details, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id.to_string(),
                    event.activity_type.as_str(),
                    opt_text(event.lead_name.as_deref()),
                    opt_text(event.lead_phone.as_deref()),
                    event.status.as_str(),
                    event.details.as_str(),
                    event.timestamp.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record activity: {e}")))?;
        Ok(())
    }
}
