//! Append-only audit trail of AI requests.
//!
//! Every terminal pipeline state writes exactly one [`AiRequestRecord`].
//! Records are immutable once appended; stores expose only append and
//! read paths.

pub mod sqlite;

pub use sqlite::SqliteAuditStore;

use crate::clinical::RiskScore;
use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Record ───────────────────────────────────────────────────────

/// Terminal state a request reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Blocked,
    CacheHit,
    Rejected,
    Failed,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::CacheHit => "cache_hit",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "allowed" => Self::Allowed,
            "blocked" => Self::Blocked,
            "cache_hit" => Self::CacheHit,
            "rejected" => Self::Rejected,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequestRecord {
    pub request_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    pub task: String,
    /// SHA-256 of the sanitized request context.
    pub input_hash: String,
    /// Guarded prompt sent to the provider; empty when the request never
    /// reached the provider.
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub raw_response: Option<String>,
    /// Text actually delivered to the caller.
    #[serde(default)]
    pub sanitized_response: Option<String>,
    #[serde(default)]
    pub model: String,
    pub latency_ms: u64,
    pub was_overridden: bool,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub risk_score: Option<RiskScore>,
    pub outcome: Outcome,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ── Store trait ──────────────────────────────────────────────────

#[async_trait]
pub trait AuditStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, record: &AiRequestRecord) -> Result<()>;

    /// Records for one session, oldest first.
    async fn for_session(&self, session_id: &str, limit: usize) -> Result<Vec<AiRequestRecord>>;

    /// Most recent records, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<AiRequestRecord>>;

    async fn count(&self) -> Result<u64>;
}

/// Build the audit store named by `[audit] backend`.
pub fn create_audit_store(config: &Config) -> Result<Arc<dyn AuditStore>> {
    match config.audit.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryAuditStore::new())),
        "sqlite" => Ok(Arc::new(SqliteAuditStore::open(&config.audit_db_path())?)),
        other => anyhow::bail!("Unknown audit backend '{other}'. Supported: sqlite, memory"),
    }
}

// ── In-memory store ──────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AiRequestRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn snapshot(&self) -> Vec<AiRequestRecord> {
        self.records.read().clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &AiRequestRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn for_session(&self, session_id: &str, limit: usize) -> Result<Vec<AiRequestRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.session_id.as_deref() == Some(session_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AiRequestRecord>> {
        Ok(self.records.read().iter().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().len() as u64)
    }
}

#[cfg(test)]
pub(crate) fn sample_record(request_id: &str, session: Option<&str>, outcome: Outcome) -> AiRequestRecord {
    let now = Utc::now();
    AiRequestRecord {
        request_id: request_id.into(),
        session_id: session.map(str::to_string),
        user_id: "u-1".into(),
        role: "nurse".into(),
        task: "explain_triage".into(),
        input_hash: "ab".repeat(32),
        prompt: "prompt".into(),
        raw_response: Some("raw".into()),
        sanitized_response: Some("delivered".into()),
        model: "llama3.2:3b".into(),
        latency_ms: 42,
        was_overridden: outcome == Outcome::Blocked,
        risk_flags: vec!["dosage".into()],
        risk_score: None,
        outcome,
        created_at: now,
        completed_at: now,
    }
}
