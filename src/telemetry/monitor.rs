//! Rolling request metrics and health score.
//!
//! Every sample is folded into three buckets (current minute, hour and
//! day) through the counter store's atomic primitives, so concurrent
//! recorders never lose updates and several gateway processes can share
//! one remote store.

use crate::config::MonitorConfig;
use crate::store::CounterStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const UNKNOWN_TASK: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Minute,
    Hour,
    Day,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Minute, Period::Hour, Period::Day];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    fn bucket(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Minute => now.format("%Y%m%d%H%M").to_string(),
            Self::Hour => now.format("%Y%m%d%H").to_string(),
            Self::Day => now.format("%Y%m%d").to_string(),
        }
    }

    /// How long a bucket outlives its period.
    fn retention(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(2 * 3600),
            Self::Hour => Duration::from_secs(2 * 86_400),
            Self::Day => Duration::from_secs(8 * 86_400),
        }
    }
}

impl std::str::FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => anyhow::bail!("Unknown period '{other}'. Supported: minute, hour, day"),
        }
    }
}

/// One completed request. Missing fields default (`task` to `"unknown"`,
/// no latency sample, not overridden).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSample {
    pub task: String,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub was_overridden: bool,
}

// ── Snapshot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub overridden: u64,
    pub override_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub failure: u64,
    pub error_rate: f64,
    pub latency: LatencyStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Healthy
        } else if score >= 70.0 {
            Self::Degraded
        } else if score >= 40.0 {
            Self::Unhealthy
        } else {
            Self::Critical
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub score: f64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub period: Period,
    pub bucket: String,
    pub requests: RequestStats,
    pub validation: ValidationStats,
    pub latency: LatencyStats,
    pub by_task: BTreeMap<String, TaskStats>,
    pub health: Health,
}

// ── Monitor ──────────────────────────────────────────────────────

pub struct Monitor {
    store: Arc<dyn CounterStore>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(store: Arc<dyn CounterStore>, config: MonitorConfig) -> Self {
        Self { store, config }
    }

    pub async fn record_request(&self, sample: &RequestSample) -> Result<()> {
        self.record_request_at(sample, Utc::now()).await
    }

    pub async fn record_request_at(&self, sample: &RequestSample, now: DateTime<Utc>) -> Result<()> {
        let task = if sample.task.trim().is_empty() {
            UNKNOWN_TASK.to_string()
        } else {
            key_part(sample.task.trim())
        };

        for period in Period::ALL {
            let ttl = period.retention();
            let prefix = bucket_prefix(period, now);
            let task_prefix = format!("{prefix}task:{task}:");

            self.store.incr_by(&format!("{prefix}total"), 1, ttl).await?;
            self.store
                .incr_by(&format!("{task_prefix}total"), 1, ttl)
                .await?;
            let outcome = if sample.success { "success" } else { "failure" };
            self.store
                .incr_by(&format!("{prefix}{outcome}"), 1, ttl)
                .await?;
            if !sample.success {
                self.store
                    .incr_by(&format!("{task_prefix}failure"), 1, ttl)
                    .await?;
            }
            if sample.was_overridden {
                self.store
                    .incr_by(&format!("{prefix}overridden"), 1, ttl)
                    .await?;
            }
            if let Some(latency) = sample.latency_ms {
                let latency = i64::try_from(latency).unwrap_or(i64::MAX);
                for scope in [&prefix, &task_prefix] {
                    self.store
                        .incr_by(&format!("{scope}lat_sum"), latency, ttl)
                        .await?;
                    self.store
                        .incr_by(&format!("{scope}lat_count"), 1, ttl)
                        .await?;
                    self.store
                        .fetch_min(&format!("{scope}lat_min"), latency, ttl)
                        .await?;
                    self.store
                        .fetch_max(&format!("{scope}lat_max"), latency, ttl)
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn get_metrics(&self, period: Period) -> Result<MetricsSnapshot> {
        self.get_metrics_at(period, Utc::now()).await
    }

    pub async fn get_metrics_at(&self, period: Period, now: DateTime<Utc>) -> Result<MetricsSnapshot> {
        let prefix = bucket_prefix(period, now);
        let counters = self.store.counters_with_prefix(&prefix).await?;

        let mut overall = BTreeMap::new();
        let mut tasks: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        for (key, value) in counters {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.strip_prefix("task:").and_then(|t| t.rsplit_once(':')) {
                Some((task, field)) => {
                    tasks
                        .entry(unescape(task))
                        .or_default()
                        .insert(field.to_string(), value);
                }
                None => {
                    overall.insert(rest.to_string(), value);
                }
            }
        }

        let total = read(&overall, "total");
        let success = read(&overall, "success");
        let failure = read(&overall, "failure");
        let overridden = read(&overall, "overridden");
        let requests = RequestStats {
            total,
            success,
            failure,
            error_rate: ratio(failure, total),
        };
        let latency = latency_stats(&overall);

        let by_task = tasks
            .into_iter()
            .map(|(task, fields)| {
                let total = read(&fields, "total");
                let failure = read(&fields, "failure");
                let stats = TaskStats {
                    total,
                    failure,
                    error_rate: ratio(failure, total),
                    latency: latency_stats(&fields),
                };
                (task, stats)
            })
            .collect();

        let health = self.health_for(&requests, &latency);
        Ok(MetricsSnapshot {
            period,
            bucket: period.bucket(now),
            validation: ValidationStats {
                overridden,
                override_rate: ratio(overridden, total),
            },
            requests,
            latency,
            by_task,
            health,
        })
    }

    /// Score starts at 100; an error rate above the warning level costs
    /// `error_rate_penalty_per_point` per percentage point over it, and a
    /// slow average costs a flat `latency_penalty`.
    pub fn health_for(&self, requests: &RequestStats, latency: &LatencyStats) -> Health {
        let mut score = 100.0;
        let excess = requests.error_rate - self.config.error_rate_warning;
        if excess > 0.0 {
            score -= excess * 100.0 * self.config.error_rate_penalty_per_point;
        }
        if latency.samples > 0 && latency.avg_ms > self.config.latency_warning_ms as f64 {
            score -= self.config.latency_penalty;
        }
        let score: f64 = score.clamp(0.0, 100.0);
        Health {
            score: (score * 10.0).round() / 10.0,
            status: HealthStatus::from_score(score),
        }
    }
}

fn bucket_prefix(period: Period, now: DateTime<Utc>) -> String {
    format!("mon:{}:{}:", period.as_str(), period.bucket(now))
}

fn key_part(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

fn unescape(part: &str) -> String {
    part.replace("%3A", ":").replace("%25", "%")
}

fn read(fields: &BTreeMap<String, i64>, name: &str) -> u64 {
    fields
        .get(name)
        .copied()
        .map_or(0, |v| u64::try_from(v).unwrap_or(0))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn latency_stats(fields: &BTreeMap<String, i64>) -> LatencyStats {
    let samples = read(fields, "lat_count");
    if samples == 0 {
        return LatencyStats::default();
    }
    LatencyStats {
        samples,
        min_ms: read(fields, "lat_min"),
        max_ms: read(fields, "lat_max"),
        avg_ms: read(fields, "lat_sum") as f64 / samples as f64,
    }
}
