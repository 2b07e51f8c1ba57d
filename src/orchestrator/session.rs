//! Per-session warning counters.
//!
//! A session that collects `escalation_threshold` warnings is escalated:
//! the UI must stop offering AI suggestions until the session ends or an
//! administrator resets it. The warning counter ages out after `ttl_secs`
//! of the session's first warning; the escalation flag has no expiry and
//! only [`SessionTracker::reset`] removes it.

use crate::config::SessionConfig;
use crate::store::{CounterStore, NO_EXPIRY};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub warnings: u32,
    pub threshold: u32,
    pub escalated: bool,
}

pub struct SessionTracker {
    store: Arc<dyn CounterStore>,
    threshold: u32,
    ttl: Duration,
}

fn key_part(session_id: &str) -> String {
    session_id.replace('%', "%25").replace(':', "%3A")
}

fn session_key(session_id: &str) -> String {
    format!("session:warn:{}", key_part(session_id))
}

fn escalated_key(session_id: &str) -> String {
    format!("session:escalated:{}", key_part(session_id))
}

impl SessionTracker {
    pub fn new(store: Arc<dyn CounterStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            threshold: config.escalation_threshold.max(1),
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    fn state_for(&self, session_id: &str, count: i64, flagged: bool) -> SessionState {
        let warnings = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        SessionState {
            session_id: session_id.to_string(),
            warnings,
            threshold: self.threshold,
            escalated: flagged || warnings >= self.threshold,
        }
    }

    async fn is_flagged(&self, session_id: &str) -> Result<bool> {
        Ok(self.store.get(&escalated_key(session_id)).await?.is_some())
    }

    /// Count one delivered warning (single atomic increment). Reaching the
    /// threshold sets the non-expiring escalation flag.
    pub async fn record_warning(&self, session_id: &str) -> Result<SessionState> {
        let count = self.store.incr_by(&session_key(session_id), 1, self.ttl).await?;
        let mut state = self.state_for(session_id, count, false);
        if state.escalated {
            self.store
                .set(&escalated_key(session_id), count.to_string(), NO_EXPIRY)
                .await?;
            if state.warnings == self.threshold {
                tracing::warn!(session_id, warnings = state.warnings, "Session escalated");
            }
        } else {
            state.escalated = self.is_flagged(session_id).await?;
        }
        Ok(state)
    }

    pub async fn state(&self, session_id: &str) -> Result<SessionState> {
        let count = self.store.counter(&session_key(session_id)).await?;
        let flagged = self.is_flagged(session_id).await?;
        Ok(self.state_for(session_id, count, flagged))
    }

    /// Explicit session end or administrative reset.
    pub async fn reset(&self, session_id: &str) -> Result<bool> {
        let counter = self.store.delete(&session_key(session_id)).await?;
        let flag = self.store.delete(&escalated_key(session_id)).await?;
        let removed = counter || flag;
        if removed {
            tracing::info!(session_id, "Session escalation reset");
        }
        Ok(removed)
    }
}
