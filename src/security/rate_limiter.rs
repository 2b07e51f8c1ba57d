//! Admission control over three nested fixed windows.
//!
//! - Global: all requests, per clock minute
//! - Task: per user per task, per clock minute
//! - Quota: per user, per UTC day (limit depends on role)
//!
//! Admission reserves a slot in each window with one atomic `incr_by`
//! and compares the returned value with the limit, so concurrent requests
//! can never all pass on the same stale read. A window pushed past its
//! limit is rolled back together with the windows reserved before it.
//! A reservation that ends without a dispatch (cache hit, prompt failure)
//! is handed back with [`RateLimiter::release_at`], so only dispatched
//! requests stay counted. [`RateLimiter::get_remaining`] only reads.

use crate::config::RateLimitConfig;
use crate::store::CounterStore;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Minute counters outlive their window so late reads still see them.
const MINUTE_COUNTER_TTL: Duration = Duration::from_secs(2 * 60);

/// Daily counters are kept past midnight for the same reason.
const DAY_COUNTER_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Success/failure tallies are kept a week for monitoring.
const STATS_TTL: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    TaskLimitExceeded,
    GlobalLimitExceeded,
    QuotaExceeded,
}

impl RateLimitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskLimitExceeded => "task_limit_exceeded",
            Self::GlobalLimitExceeded => "global_limit_exceeded",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }
}

impl std::fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage of one window. `remaining` never goes below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    /// Seconds until the window rolls over.
    pub reset_secs: u64,
}

impl WindowUsage {
    fn new(limit: u32, used: i64, reset_secs: u64) -> Self {
        let used = u32::try_from(used.max(0)).unwrap_or(u32::MAX);
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_secs,
        }
    }
}

/// Usage across all three windows for one (task, user, role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub global: WindowUsage,
    pub task: WindowUsage,
    pub quota: WindowUsage,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
    pub limits: RateLimits,
    /// Seconds the caller should wait; zero when allowed.
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// The window that rejected the request, for response headers.
    pub fn binding_window(&self) -> &WindowUsage {
        match self.reason {
            Some(RateLimitReason::GlobalLimitExceeded) => &self.limits.global,
            Some(RateLimitReason::QuotaExceeded) => &self.limits.quota,
            Some(RateLimitReason::TaskLimitExceeded) | None => &self.limits.task,
        }
    }
}

/// Per-task per-day dispatch outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeStats {
    pub success: i64,
    pub failure: i64,
}

/// Three-window limiter backed by a [`CounterStore`].
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RwLock<RateLimitConfig>,
}

fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

fn secs_to_next_minute(now: DateTime<Utc>) -> u64 {
    u64::from(60 - now.second().min(59))
}

fn secs_to_next_day(now: DateTime<Utc>) -> u64 {
    let next_midnight = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc());
    next_midnight
        .map(|midnight| (midnight - now).num_seconds().max(1) as u64)
        .unwrap_or(24 * 60 * 60)
}

/// User ids are embedded in keys; escape the separator so one user's
/// prefix can never cover another's.
fn key_part(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

fn user_prefix(user_id: &str) -> String {
    format!("rl:user:{}:", key_part(user_id))
}

fn global_key(now: DateTime<Utc>) -> String {
    format!("rl:global:{}", minute_bucket(now))
}

fn task_key(task: &str, user_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}task:{}:{}",
        user_prefix(user_id),
        key_part(task),
        minute_bucket(now)
    )
}

fn quota_key(user_id: &str, now: DateTime<Utc>) -> String {
    format!("{}quota:{}", user_prefix(user_id), day_bucket(now))
}

fn stats_key(task: &str, now: DateTime<Utc>, outcome: &str) -> String {
    format!("rl:stats:{}:{}:{outcome}", key_part(task), day_bucket(now))
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config),
        }
    }

    /// Snapshot of the active limits.
    pub fn limits_config(&self) -> RateLimitConfig {
        self.config.read().clone()
    }

    /// Replace limits at runtime; counters are kept.
    pub fn update_limits(&self, config: RateLimitConfig) {
        tracing::info!(
            global_per_minute = config.global_per_minute,
            enabled = config.enabled,
            "Rate limits updated"
        );
        *self.config.write() = config;
    }

    pub async fn get_remaining(
        &self,
        task: &str,
        user_id: &str,
        role: &str,
    ) -> anyhow::Result<RateLimits> {
        self.remaining_at(task, user_id, role, Utc::now()).await
    }

    pub async fn check(
        &self,
        task: &str,
        user_id: &str,
        role: &str,
    ) -> anyhow::Result<RateLimitDecision> {
        self.check_at(task, user_id, role, Utc::now()).await
    }

    /// Admission check at `now`. Reserves one slot in every window, in
    /// admission order, and denies with the first window over its limit.
    pub async fn check_at(
        &self,
        task: &str,
        user_id: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RateLimitDecision> {
        let (enabled, global_limit, task_limit, quota_limit) = {
            let config = self.config.read();
            (
                config.enabled,
                config.global_per_minute,
                task_limit(&config, task),
                quota_limit(&config, role),
            )
        };
        let windows = [
            (
                RateLimitReason::TaskLimitExceeded,
                task_key(task, user_id, now),
                task_limit,
                MINUTE_COUNTER_TTL,
            ),
            (
                RateLimitReason::GlobalLimitExceeded,
                global_key(now),
                global_limit,
                MINUTE_COUNTER_TTL,
            ),
            (
                RateLimitReason::QuotaExceeded,
                quota_key(user_id, now),
                quota_limit,
                DAY_COUNTER_TTL,
            ),
        ];

        let mut used = [0i64; 3];
        for (index, (reason, key, limit, ttl)) in windows.iter().enumerate() {
            let value = self.store.incr_by(key, 1, *ttl).await?;
            if enabled && value > i64::from(*limit) {
                for (_, reserved, _, ttl) in &windows[..=index] {
                    self.store.incr_by(reserved, -1, *ttl).await?;
                }
                let limits = self.remaining_at(task, user_id, role, now).await?;
                return Ok(denied(task, *reason, limits));
            }
            used[index] = value;
        }

        let minute_reset = secs_to_next_minute(now);
        Ok(RateLimitDecision {
            allowed: true,
            reason: None,
            limits: RateLimits {
                task: WindowUsage::new(task_limit, used[0], minute_reset),
                global: WindowUsage::new(global_limit, used[1], minute_reset),
                quota: WindowUsage::new(quota_limit, used[2], secs_to_next_day(now)),
            },
            retry_after_secs: 0,
        })
    }

    /// Hand back a slot taken by [`Self::check_at`] at the same `now`.
    pub async fn release_at(
        &self,
        task: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .incr_by(&task_key(task, user_id, now), -1, MINUTE_COUNTER_TTL)
            .await?;
        self.store
            .incr_by(&global_key(now), -1, MINUTE_COUNTER_TTL)
            .await?;
        self.store
            .incr_by(&quota_key(user_id, now), -1, DAY_COUNTER_TTL)
            .await?;
        Ok(())
    }

    /// `{limit, used, remaining}` for every window at `now`.
    pub async fn remaining_at(
        &self,
        task: &str,
        user_id: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RateLimits> {
        let (global_limit, task_limit, quota_limit) = {
            let config = self.config.read();
            (
                config.global_per_minute,
                task_limit(&config, task),
                quota_limit(&config, role),
            )
        };

        let global_used = self.store.counter(&global_key(now)).await?;
        let task_used = self.store.counter(&task_key(task, user_id, now)).await?;
        let quota_used = self.store.counter(&quota_key(user_id, now)).await?;

        let minute_reset = secs_to_next_minute(now);
        Ok(RateLimits {
            global: WindowUsage::new(global_limit, global_used, minute_reset),
            task: WindowUsage::new(task_limit, task_used, minute_reset),
            quota: WindowUsage::new(quota_limit, quota_used, secs_to_next_day(now)),
        })
    }

    /// Tally a finished dispatch as success or failure for the task.
    /// Usage was already counted when [`Self::check`] admitted it.
    pub async fn record(&self, task: &str, user_id: &str, success: bool) -> anyhow::Result<()> {
        self.record_outcome_at(task, success, Utc::now()).await?;
        tracing::debug!(task, user_id, success, "Dispatch outcome recorded");
        Ok(())
    }

    pub async fn record_outcome_at(
        &self,
        task: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let outcome = if success { "success" } else { "failure" };
        self.store
            .incr_by(&stats_key(task, now, outcome), 1, STATS_TTL)
            .await?;
        Ok(())
    }

    pub async fn outcome_stats_at(
        &self,
        task: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<OutcomeStats> {
        Ok(OutcomeStats {
            success: self.store.counter(&stats_key(task, now, "success")).await?,
            failure: self.store.counter(&stats_key(task, now, "failure")).await?,
        })
    }

    /// Clear every task and quota counter for `user_id`.
    pub async fn reset_user(&self, user_id: &str) -> anyhow::Result<usize> {
        let removed = self.store.delete_prefix(&user_prefix(user_id)).await?;
        tracing::info!(removed, "Rate-limit counters reset for user");
        Ok(removed)
    }
}

fn denied(task: &str, reason: RateLimitReason, limits: RateLimits) -> RateLimitDecision {
    let retry_after_secs = match reason {
        RateLimitReason::TaskLimitExceeded => limits.task.reset_secs,
        RateLimitReason::GlobalLimitExceeded => limits.global.reset_secs,
        RateLimitReason::QuotaExceeded => limits.quota.reset_secs,
    };
    tracing::warn!(task, reason = reason.as_str(), retry_after_secs, "Request rate limited");
    RateLimitDecision {
        allowed: false,
        reason: Some(reason),
        limits,
        retry_after_secs,
    }
}

fn task_limit(config: &RateLimitConfig, task: &str) -> u32 {
    config
        .task_per_minute
        .get(task)
        .copied()
        .unwrap_or(config.default_task_per_minute)
}

fn quota_limit(config: &RateLimitConfig, role: &str) -> u32 {
    config
        .role_daily_quota
        .get(&role.to_ascii_lowercase())
        .copied()
        .unwrap_or(config.default_daily_quota)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::YieldingStore;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), config)
    }

    fn small_config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            global_per_minute: 100,
            default_task_per_minute: 5,
            default_daily_quota: 50,
            task_per_minute: HashMap::from([("explain_triage".to_string(), 3)]),
            role_daily_quota: HashMap::from([("chw".to_string(), 4)]),
        }
    }

    async fn admit(limiter: &RateLimiter, task: &str, user: &str, role: &str, now: DateTime<Utc>) -> RateLimitDecision {
        limiter.check_at(task, user, role, now).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_exceed_limit() {
        let mut config = small_config();
        config.task_per_minute.insert("critical_alert".into(), 1);
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(YieldingStore(MemoryStore::new())),
            config,
        ));
        let now = at(16, 0, 0);

        let attempts = (0..10).map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .check_at("critical_alert", "u1", "nurse", now)
                    .await
                    .unwrap()
            })
        });
        let decisions = futures_util::future::join_all(attempts).await;
        let admitted = decisions
            .into_iter()
            .map(|d| d.unwrap())
            .filter(|d| d.allowed)
            .count();
        assert_eq!(admitted, 1);

        let limits = limiter
            .remaining_at("critical_alert", "u1", "nurse", now)
            .await
            .unwrap();
        assert_eq!(limits.task.used, 1);
        assert_eq!(limits.global.used, 1);
        assert_eq!(limits.quota.used, 1);
    }

    #[tokio::test]
    async fn rejected_check_rolls_back_earlier_windows() {
        let mut config = small_config();
        config.global_per_minute = 1;
        let limiter = limiter_with(config);
        let now = at(17, 0, 0);
        assert!(admit(&limiter, "patient_education", "a", "nurse", now).await.allowed);
        let rejected = admit(&limiter, "patient_education", "b", "nurse", now).await;
        assert_eq!(rejected.reason, Some(RateLimitReason::GlobalLimitExceeded));

        let limits = limiter
            .remaining_at("patient_education", "b", "nurse", now)
            .await
            .unwrap();
        assert_eq!(limits.task.used, 0);
        assert_eq!(limits.global.used, 1);
        assert_eq!(limits.quota.used, 0);
    }

    #[tokio::test]
    async fn release_returns_the_slot() {
        let limiter = limiter_with(small_config());
        let now = at(18, 0, 0);
        for _ in 0..3 {
            assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
        }
        limiter.release_at("explain_triage", "u1", now).await.unwrap();
        let limits = limiter.remaining_at("explain_triage", "u1", "nurse", now).await.unwrap();
        assert_eq!(limits.task.used, 2);
        assert_eq!(limits.quota.used, 2);
        assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
    }

    #[tokio::test]
    async fn exactly_limit_requests_succeed_then_task_limit() {
        let limiter = limiter_with(small_config());
        let now = at(10, 0, 5);
        for _ in 0..3 {
            assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
        }
        let rejected = admit(&limiter, "explain_triage", "u1", "nurse", now).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.reason, Some(RateLimitReason::TaskLimitExceeded));
        assert_eq!(rejected.retry_after_secs, 55);
    }

    #[tokio::test]
    async fn new_minute_resets_task_window() {
        let limiter = limiter_with(small_config());
        for _ in 0..3 {
            admit(&limiter, "explain_triage", "u1", "nurse", at(10, 0, 30)).await;
        }
        assert!(!admit(&limiter, "explain_triage", "u1", "nurse", at(10, 0, 59)).await.allowed);
        assert!(admit(&limiter, "explain_triage", "u1", "nurse", at(10, 1, 0)).await.allowed);
    }

    #[tokio::test]
    async fn global_limit_applies_across_users() {
        let mut config = small_config();
        config.global_per_minute = 2;
        let limiter = limiter_with(config);
        let now = at(11, 0, 0);
        assert!(admit(&limiter, "patient_education", "a", "nurse", now).await.allowed);
        assert!(admit(&limiter, "patient_education", "b", "nurse", now).await.allowed);
        let rejected = admit(&limiter, "patient_education", "c", "nurse", now).await;
        assert_eq!(rejected.reason, Some(RateLimitReason::GlobalLimitExceeded));
    }

    #[tokio::test]
    async fn task_limit_checked_before_global() {
        let mut config = small_config();
        config.global_per_minute = 3;
        let limiter = limiter_with(config);
        let now = at(11, 0, 0);
        for _ in 0..3 {
            admit(&limiter, "explain_triage", "u1", "nurse", now).await;
        }
        let rejected = admit(&limiter, "explain_triage", "u1", "nurse", now).await;
        assert_eq!(rejected.reason, Some(RateLimitReason::TaskLimitExceeded));
    }

    #[tokio::test]
    async fn daily_quota_by_role() {
        let limiter = limiter_with(small_config());
        for minute in 0..4 {
            assert!(admit(&limiter, "patient_education", "chw1", "CHW", at(8, minute, 0)).await.allowed);
        }
        let rejected = admit(&limiter, "patient_education", "chw1", "chw", at(8, 10, 0)).await;
        assert_eq!(rejected.reason, Some(RateLimitReason::QuotaExceeded));
        assert!(rejected.retry_after_secs > 15 * 60 * 60);
        assert!(admit(&limiter, "patient_education", "nurse1", "nurse", at(8, 10, 0)).await.allowed);
    }

    #[tokio::test]
    async fn unknown_task_and_role_use_defaults() {
        let limiter = limiter_with(small_config());
        let limits = limiter
            .remaining_at("brand_new_task", "u", "volunteer", at(1, 0, 0))
            .await
            .unwrap();
        assert_eq!(limits.task.limit, 5);
        assert_eq!(limits.quota.limit, 50);
    }

    #[tokio::test]
    async fn remaining_never_negative() {
        let limiter = limiter_with(small_config());
        let now = at(12, 0, 0);
        let key = task_key("explain_triage", "u1", now);
        for _ in 0..6 {
            limiter.store.incr_by(&key, 1, MINUTE_COUNTER_TTL).await.unwrap();
        }
        let limits = limiter.remaining_at("explain_triage", "u1", "nurse", now).await.unwrap();
        assert_eq!(limits.task.used, 6);
        assert_eq!(limits.task.remaining, 0);
        assert_eq!(limits.global.remaining, 100);
    }

    #[tokio::test]
    async fn outcomes_tracked_per_task_per_day() {
        let limiter = limiter_with(small_config());
        let now = at(12, 0, 0);
        limiter.record_outcome_at("explain_triage", true, now).await.unwrap();
        limiter.record_outcome_at("explain_triage", true, now).await.unwrap();
        limiter.record_outcome_at("explain_triage", false, now).await.unwrap();
        let stats = limiter.outcome_stats_at("explain_triage", now).await.unwrap();
        assert_eq!(stats, OutcomeStats { success: 2, failure: 1 });
    }

    #[tokio::test]
    async fn reset_user_clears_only_that_user() {
        let limiter = limiter_with(small_config());
        let now = at(13, 0, 0);
        for _ in 0..3 {
            admit(&limiter, "explain_triage", "u1", "nurse", now).await;
            admit(&limiter, "explain_triage", "u1:x", "nurse", now).await;
        }
        assert!(limiter.reset_user("u1").await.unwrap() >= 2);
        assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
        assert!(!admit(&limiter, "explain_triage", "u1:x", "nurse", now).await.allowed);
    }

    #[tokio::test]
    async fn update_limits_hot_swaps() {
        let limiter = limiter_with(small_config());
        let now = at(14, 0, 0);
        for _ in 0..3 {
            admit(&limiter, "explain_triage", "u1", "nurse", now).await;
        }
        assert!(!admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);

        let mut relaxed = small_config();
        relaxed.task_per_minute.insert("explain_triage".into(), 10);
        limiter.update_limits(relaxed);
        assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
    }

    #[tokio::test]
    async fn disabled_limiter_allows_all() {
        let mut config = small_config();
        config.enabled = false;
        let limiter = limiter_with(config);
        let now = at(15, 0, 0);
        for _ in 0..20 {
            assert!(admit(&limiter, "explain_triage", "u1", "nurse", now).await.allowed);
        }
    }
}
