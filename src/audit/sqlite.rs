use super::{AiRequestRecord, AuditStore, Outcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;

const SELECT_COLUMNS: &str = "request_id, session_id, user_id, role, task, input_hash, prompt,
     raw_response, sanitized_response, model, latency_ms, was_overridden,
     risk_flags, risk_score, outcome, created_at, completed_at";

/// SQLite-backed audit trail (WAL mode, append-only table).
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit dir: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open audit DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ai_request_records (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id         TEXT NOT NULL UNIQUE,
                session_id         TEXT,
                user_id            TEXT NOT NULL,
                role               TEXT NOT NULL DEFAULT '',
                task               TEXT NOT NULL,
                input_hash         TEXT NOT NULL,
                prompt             TEXT NOT NULL DEFAULT '',
                raw_response       TEXT,
                sanitized_response TEXT,
                model              TEXT NOT NULL DEFAULT '',
                latency_ms         INTEGER NOT NULL,
                was_overridden     INTEGER NOT NULL DEFAULT 0,
                risk_flags         TEXT NOT NULL DEFAULT '[]',
                risk_score         TEXT,
                outcome            TEXT NOT NULL,
                created_at         TEXT NOT NULL,
                completed_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_session ON ai_request_records(session_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created_at ON ai_request_records(created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_outcome ON ai_request_records(outcome);",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .context("audit worker panicked")?
    }
}

fn parse_time(raw: Option<String>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AiRequestRecord> {
    let latency: i64 = row.get(10)?;
    Ok(AiRequestRecord {
        request_id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        role: row.get(3)?,
        task: row.get(4)?,
        input_hash: row.get(5)?,
        prompt: row.get(6)?,
        raw_response: row.get(7)?,
        sanitized_response: row.get(8)?,
        model: row.get(9)?,
        latency_ms: u64::try_from(latency).unwrap_or(0),
        was_overridden: row.get::<_, i64>(11)? != 0,
        risk_flags: row
            .get::<_, String>(12)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        risk_score: row
            .get::<_, Option<String>>(13)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        outcome: Outcome::from_str_lossy(&row.get::<_, String>(14).unwrap_or_default()),
        created_at: parse_time(row.get(15).ok()),
        completed_at: parse_time(row.get(16).ok()),
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, record: &AiRequestRecord) -> Result<()> {
        let record = record.clone();
        let risk_flags = serde_json::to_string(&record.risk_flags)?;
        let risk_score = record
            .risk_score
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ai_request_records
                    (request_id, session_id, user_id, role, task, input_hash, prompt,
                     raw_response, sanitized_response, model, latency_ms, was_overridden,
                     risk_flags, risk_score, outcome, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    record.request_id,
                    record.session_id,
                    record.user_id,
                    record.role,
                    record.task,
                    record.input_hash,
                    record.prompt,
                    record.raw_response,
                    record.sanitized_response,
                    record.model,
                    i64::try_from(record.latency_ms).unwrap_or(i64::MAX),
                    i64::from(record.was_overridden),
                    risk_flags,
                    risk_score,
                    record.outcome.as_str(),
                    record.created_at.to_rfc3339(),
                    record.completed_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to append audit record {}", record.request_id))?;
            Ok(())
        })
        .await
    }

    async fn for_session(&self, session_id: &str, limit: usize) -> Result<Vec<AiRequestRecord>> {
        let session_id = session_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM ai_request_records
                 WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![session_id, limit], record_from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AiRequestRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM ai_request_records ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], record_from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM ai_request_records", [], |row| {
                    row.get(0)
                })?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::sample_record;
    use crate::clinical::{RiskLevel, RiskScore};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteAuditStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteAuditStore::open(&dir.path().join("nested").join("audit.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let (_dir, store) = open_temp();
        let mut record = sample_record("r1", Some("s1"), Outcome::Blocked);
        record.risk_score = Some(RiskScore {
            total: 10,
            breakdown: BTreeMap::from([("critical_conflict".to_string(), 3)]),
            level: RiskLevel::Red,
            should_block: true,
            should_warn: true,
        });
        store.append(&record).await.unwrap();

        let loaded = store.for_session("s1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.request_id, "r1");
        assert_eq!(got.outcome, Outcome::Blocked);
        assert!(got.was_overridden);
        assert_eq!(got.risk_flags, vec!["dosage".to_string()]);
        assert_eq!(got.risk_score, record.risk_score);
        assert_eq!(got.created_at.timestamp(), record.created_at.timestamp());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let (_dir, store) = open_temp();
        let record = sample_record("dup", None, Outcome::Allowed);
        store.append(&record).await.unwrap();
        assert!(store.append(&record).await.is_err());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let (_dir, store) = open_temp();
        for id in ["a", "b", "c"] {
            store
                .append(&sample_record(id, Some("s"), Outcome::Allowed))
                .await
                .unwrap();
        }
        let recent = store.recent(2).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
            ["c", "b"]
        );
        let session = store.for_session("s", 10).await.unwrap();
        assert_eq!(session.first().unwrap().request_id, "a");
    }

    #[tokio::test]
    async fn reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = SqliteAuditStore::open(&path).unwrap();
            store
                .append(&sample_record("persisted", None, Outcome::Failed))
                .await
                .unwrap();
        }
        let store = SqliteAuditStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.recent(1).await.unwrap()[0].outcome, Outcome::Failed);
    }
}
