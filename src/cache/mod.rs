//! Response cache for clean, validated model output.
//!
//! Keys combine the task, the current task and patient version counters,
//! and a SHA-256 of the context with volatile fields removed. Serde JSON
//! objects serialize with sorted keys, so the hash is independent of
//! field order. Bumping a version counter orphans every key built on the
//! old value; orphaned entries age out through their store TTL.

use crate::config::CacheConfig;
use crate::store::CounterStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Version counters must outlive every entry keyed on them.
const VERSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const PREFIX: &str = "cache:";

/// What gets memoized for a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePayload {
    /// Validated, framed response text.
    pub response: String,
    pub model: String,
    pub warnings: Vec<String>,
    /// Error responses are never stored.
    pub error: bool,
    /// Safety-modified responses are never stored.
    pub was_modified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    payload: CachePayload,
    created_at: i64,
    ttl_secs: u64,
}

/// A hit served past its TTL but inside the grace window.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleHit {
    pub payload: CachePayload,
    pub age_secs: u64,
}

pub struct ResponseCache {
    store: Arc<dyn CounterStore>,
    config: CacheConfig,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn task_version_key(task: &str) -> String {
    format!("{PREFIX}ver:task:{task}")
}

fn patient_version_key(patient_id: &str) -> String {
    format!("{PREFIX}ver:patient:{patient_id}")
}

/// Patient id from the context, accepting either naming convention.
pub fn patient_id(context: &Value) -> Option<String> {
    ["patient_id", "patientId"]
        .iter()
        .find_map(|key| context.get(*key))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn strip_volatile(value: &Value, volatile: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !volatile.iter().any(|v| v == *key))
                .map(|(key, item)| (key.clone(), strip_volatile(item, volatile)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| strip_volatile(item, volatile)).collect())
        }
        other => other.clone(),
    }
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CounterStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn is_cacheable(&self, task: &str) -> bool {
        self.config.enabled && !self.config.non_cacheable_tasks.iter().any(|t| t == task)
    }

    fn ttl_for(&self, task: &str) -> u64 {
        self.config
            .task_ttl_secs
            .get(task)
            .copied()
            .unwrap_or(self.config.default_ttl_secs)
    }

    /// Order-independent hash of the non-volatile context.
    pub fn context_hash(&self, context: &Value) -> String {
        let canonical = strip_volatile(context, &self.config.volatile_fields).to_string();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Full key at the current task/patient versions.
    pub async fn key_for(&self, task: &str, context: &Value) -> anyhow::Result<String> {
        let task_version = self.store.counter(&task_version_key(task)).await?;
        let (patient, patient_version) = match patient_id(context) {
            Some(id) => {
                let version = self.store.counter(&patient_version_key(&id)).await?;
                (id, version)
            }
            None => ("-".to_string(), 0),
        };
        Ok(format!(
            "{PREFIX}entry:{task}:t{task_version}:{patient}:p{patient_version}:{}",
            self.context_hash(context)
        ))
    }

    async fn load(&self, task: &str, context: &Value) -> anyhow::Result<Option<CacheEntry>> {
        if !self.is_cacheable(task) {
            return Ok(None);
        }
        let key = self.key_for(task, context).await?;
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(task, "Dropping unreadable cache entry: {e}");
                self.store.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Fresh entry for this task and context, if any.
    pub async fn get(&self, task: &str, context: &Value) -> anyhow::Result<Option<CachePayload>> {
        let Some(entry) = self.load(task, context).await? else {
            return Ok(None);
        };
        let age = now_secs().saturating_sub(entry.created_at).max(0) as u64;
        Ok((age < entry.ttl_secs).then_some(entry.payload))
    }

    /// Entry past its TTL but within `stale_grace_secs`; used only when
    /// the provider is unavailable.
    pub async fn get_stale(&self, task: &str, context: &Value) -> anyhow::Result<Option<StaleHit>> {
        let Some(entry) = self.load(task, context).await? else {
            return Ok(None);
        };
        let age = now_secs().saturating_sub(entry.created_at).max(0) as u64;
        if age < entry.ttl_secs.saturating_add(self.config.stale_grace_secs) {
            Ok(Some(StaleHit {
                payload: entry.payload,
                age_secs: age,
            }))
        } else {
            Ok(None)
        }
    }

    /// Store a clean payload. Returns false for non-cacheable tasks, error
    /// payloads and safety-modified payloads.
    pub async fn put(
        &self,
        task: &str,
        context: &Value,
        payload: &CachePayload,
    ) -> anyhow::Result<bool> {
        if !self.is_cacheable(task) || payload.error || payload.was_modified {
            return Ok(false);
        }
        let ttl_secs = self.ttl_for(task);
        let entry = CacheEntry {
            payload: payload.clone(),
            created_at: now_secs(),
            ttl_secs,
        };
        let key = self.key_for(task, context).await?;
        let stored_for = Duration::from_secs(ttl_secs.saturating_add(self.config.stale_grace_secs));
        self.store
            .set(&key, serde_json::to_string(&entry)?, stored_for)
            .await?;
        tracing::debug!(task, ttl_secs, "Cached response");
        Ok(true)
    }

    /// Orphan every entry for a patient. Returns the new version.
    pub async fn invalidate_patient(&self, patient_id: &str) -> anyhow::Result<i64> {
        let version = self
            .store
            .incr_by(&patient_version_key(patient_id), 1, VERSION_TTL)
            .await?;
        tracing::info!(version, "Patient cache scope invalidated");
        Ok(version)
    }

    /// Orphan every entry for a task. Returns the new version.
    pub async fn invalidate_task(&self, task: &str) -> anyhow::Result<i64> {
        let version = self
            .store
            .incr_by(&task_version_key(task), 1, VERSION_TTL)
            .await?;
        tracing::info!(task, version, "Task cache scope invalidated");
        Ok(version)
    }

    /// Full flush (admin/test reset).
    pub async fn clear_all(&self) -> anyhow::Result<usize> {
        let removed = self.store.delete_prefix(PREFIX).await?;
        tracing::info!(removed, "Response cache flushed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn cache_with(config: CacheConfig) -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryStore::new()), config)
    }

    fn cache() -> ResponseCache {
        cache_with(CacheConfig::default())
    }

    fn payload(text: &str) -> CachePayload {
        CachePayload {
            response: text.into(),
            model: "test-model".into(),
            ..CachePayload::default()
        }
    }

    #[tokio::test]
    async fn volatile_fields_do_not_change_key() {
        let cache = cache();
        let first = json!({"patient_id": "p1", "symptoms": ["cough"], "timestamp": "2026-01-01T00:00:00Z", "user_id": "u1"});
        let second = json!({"user_id": "u2", "symptoms": ["cough"], "patient_id": "p1", "timestamp": "2026-02-02T10:00:00Z"});
        assert!(cache.put("explain_triage", &first, &payload("A")).await.unwrap());
        assert_eq!(
            cache.get("explain_triage", &second).await.unwrap(),
            Some(payload("A"))
        );
    }

    #[tokio::test]
    async fn non_volatile_differences_miss() {
        let cache = cache();
        let base = json!({"patient_id": "p1", "symptoms": ["cough"]});
        cache.put("explain_triage", &base, &payload("A")).await.unwrap();

        let other_patient = json!({"patient_id": "p2", "symptoms": ["cough"]});
        let other_symptoms = json!({"patient_id": "p1", "symptoms": ["fever"]});
        assert!(cache.get("explain_triage", &other_patient).await.unwrap().is_none());
        assert!(cache.get("explain_triage", &other_symptoms).await.unwrap().is_none());
        assert!(cache.get("summarize_history", &base).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nested_key_order_is_irrelevant() {
        let cache = cache();
        let a = json!({"vitals": {"rr": 52, "temp": 38.5}, "patient_id": "p1"});
        let b = json!({"patient_id": "p1", "vitals": {"temp": 38.5, "rr": 52}});
        assert_eq!(cache.context_hash(&a), cache.context_hash(&b));
    }

    #[tokio::test]
    async fn refuses_non_cacheable_error_and_modified() {
        let cache = cache();
        let ctx = json!({"patient_id": "p1"});
        assert!(!cache.put("critical_alert", &ctx, &payload("A")).await.unwrap());
        assert!(cache.get("critical_alert", &ctx).await.unwrap().is_none());

        let mut error = payload("E");
        error.error = true;
        assert!(!cache.put("explain_triage", &ctx, &error).await.unwrap());

        let mut modified = payload("M");
        modified.was_modified = true;
        assert!(!cache.put("explain_triage", &ctx, &modified).await.unwrap());
        assert!(cache.get("explain_triage", &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patient_version_bump_orphans_entries() {
        let cache = cache();
        let p1 = json!({"patient_id": "p1"});
        let p2 = json!({"patient_id": "p2"});
        cache.put("explain_triage", &p1, &payload("A")).await.unwrap();
        cache.put("explain_triage", &p2, &payload("B")).await.unwrap();

        assert_eq!(cache.invalidate_patient("p1").await.unwrap(), 1);
        assert!(cache.get("explain_triage", &p1).await.unwrap().is_none());
        assert!(cache.get_stale("explain_triage", &p1).await.unwrap().is_none());
        assert_eq!(cache.get("explain_triage", &p2).await.unwrap(), Some(payload("B")));
    }

    #[tokio::test]
    async fn task_version_bump_orphans_entries() {
        let cache = cache();
        let ctx = json!({"patient_id": "p1"});
        cache.put("explain_triage", &ctx, &payload("A")).await.unwrap();
        cache.put("patient_education", &ctx, &payload("B")).await.unwrap();
        cache.invalidate_task("explain_triage").await.unwrap();
        assert!(cache.get("explain_triage", &ctx).await.unwrap().is_none());
        assert!(cache.get("patient_education", &ctx).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_served_only_as_stale() {
        let mut config = CacheConfig::default();
        config.default_ttl_secs = 0;
        config.task_ttl_secs.clear();
        let cache = cache_with(config);
        let ctx = json!({"patient_id": "p1"});
        cache.put("suggest_questions", &ctx, &payload("A")).await.unwrap();
        assert!(cache.get("suggest_questions", &ctx).await.unwrap().is_none());
        let stale = cache.get_stale("suggest_questions", &ctx).await.unwrap().unwrap();
        assert_eq!(stale.payload, payload("A"));
    }

    #[tokio::test]
    async fn clear_all_flushes() {
        let cache = cache();
        let ctx = json!({"patient_id": "p1"});
        cache.put("explain_triage", &ctx, &payload("A")).await.unwrap();
        assert!(cache.clear_all().await.unwrap() >= 1);
        assert!(cache.get("explain_triage", &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_cache_is_inert() {
        let mut config = CacheConfig::default();
        config.enabled = false;
        let cache = cache_with(config);
        let ctx = json!({});
        assert!(!cache.put("explain_triage", &ctx, &payload("A")).await.unwrap());
        assert!(cache.get("explain_triage", &ctx).await.unwrap().is_none());
    }

    #[test]
    fn patient_id_accepts_both_spellings() {
        assert_eq!(patient_id(&json!({"patientId": 42})), Some("42".into()));
        assert_eq!(patient_id(&json!({"patient_id": " p9 "})), Some("p9".into()));
        assert_eq!(patient_id(&json!({"patient_id": ""})), None);
    }
}
