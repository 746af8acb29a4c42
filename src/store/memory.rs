//! In-memory `StateStore` and audit log.
//!
//! Expiry uses the tokio clock, so tests can drive TTLs with a paused runtime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::traits::{
    CALL_STATE_TTL, CallFields, LEAD_TIMESTAMP_TTL, StateStore, answer_field, lead_timestamp_key,
};
use crate::activity::{ActivityEvent, AuditSink};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Process-local store backed by hash maps behind tokio `RwLock`s.
pub struct MemoryStore {
    calls: RwLock<HashMap<String, Entry<CallFields>>>,
    kv: RwLock<HashMap<String, Entry<String>>>,
    call_ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            kv: RwLock::new(HashMap::new()),
            call_ttl: CALL_STATE_TTL,
        }
    }

    /// Override the call state retention window.
    pub fn with_call_ttl(mut self, ttl: Duration) -> Self {
        self.call_ttl = ttl;
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_call(&self, call_id: &str, fields: &CallFields) -> Result<(), StoreError> {
        let mut calls = self.calls.write().await;
        let entry = calls
            .entry(call_id.to_string())
            .and_modify(|e| {
                if !e.is_live() {
                    e.value.clear();
                }
            })
            .or_insert_with(|| Entry::new(CallFields::new(), self.call_ttl));

        entry
            .value
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        entry.expires_at = Instant::now() + self.call_ttl;
        Ok(())
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallFields>, StoreError> {
        let calls = self.calls.read().await;
        Ok(calls
            .get(call_id)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set_answer(
        &self,
        call_id: &str,
        question_id: &str,
        text: &str,
    ) -> Result<bool, StoreError> {
        let mut calls = self.calls.write().await;
        match calls.get_mut(call_id).filter(|e| e.is_live()) {
            Some(entry) => {
                entry.value.insert(answer_field(question_id), text.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.kv
            .write()
            .await
            .insert(key.to_string(), Entry::new("1".to_string(), ttl));
        Ok(())
    }

    async fn is_marked(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.kv.read().await.get(key).is_some_and(Entry::is_live))
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut kv = self.kv.write().await;
        if kv.get(key).is_some_and(Entry::is_live) {
            return Ok(false);
        }
        kv.insert(key.to_string(), Entry::new("1".to_string(), ttl));
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.kv.write().await.remove(key);
        Ok(())
    }

    async fn store_lead_timestamp(&self, phone: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.kv.write().await.insert(
            lead_timestamp_key(phone),
            Entry::new(at.to_rfc3339(), LEAD_TIMESTAMP_TTL),
        );
        Ok(())
    }

    async fn lead_timestamp(&self, phone: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let kv = self.kv.read().await;
        let Some(entry) = kv.get(&lead_timestamp_key(phone)).filter(|e| e.is_live()) else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&entry.value)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| StoreError::Serialization(format!("lead timestamp: {e}")))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut calls = self.calls.write().await;
        let mut kv = self.kv.write().await;
        let before = calls.len() + kv.len();
        calls.retain(|_, e| e.is_live());
        kv.retain(|_, e| e.is_live());
        Ok(before - calls.len() - kv.len())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Audit sink that keeps events in memory.
#[derive(Default)]
pub struct MemoryActivityLog {
    events: RwLock<Vec<ActivityEvent>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn events(&self) -> Vec<ActivityEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryActivityLog {
    async fn record(&self, event: &ActivityEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
