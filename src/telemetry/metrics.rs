//! Prometheus exposition for the gateway.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `cag_requests_total` | Counter | `task`, `outcome` |
//! | `cag_request_latency_seconds` | Histogram | `task` |
//! | `cag_blocked_total` | Counter | `reason` |
//! | `cag_cache_events_total` | Counter | `event` |

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Label values longer than this are truncated so a caller cannot grow
/// label cardinality with arbitrary task names.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Provider round-trips range from tens of milliseconds (cache hits) to
/// the provider timeout.
pub const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Registered gateway metric families. Cheap to clone; every handle
/// shares the underlying counters.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: CounterVec,
    request_latency: HistogramVec,
    blocked_total: CounterVec,
    cache_events_total: CounterVec,
}

impl GatewayMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("cag_requests_total", "AI requests by task and terminal outcome"),
            &["task", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "cag_request_latency_seconds",
                "End-to-end pipeline latency by task",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["task"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        let blocked_total = CounterVec::new(
            Opts::new("cag_blocked_total", "Responses replaced by the safety fallback"),
            &["reason"],
        )?;
        registry.register(Box::new(blocked_total.clone()))?;

        let cache_events_total = CounterVec::new(
            Opts::new("cag_cache_events_total", "Response cache hits, misses and writes"),
            &["event"],
        )?;
        registry.register(Box::new(cache_events_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency,
            blocked_total,
            cache_events_total,
        })
    }

    // ── Requests ─────────────────────────────────────────────────

    pub fn request_finished(&self, task: &str, outcome: &str, latency_secs: f64) {
        let task = truncate_label(task);
        self.requests_total
            .with_label_values(&[task, truncate_label(outcome)])
            .inc();
        self.request_latency
            .with_label_values(&[task])
            .observe(latency_secs);
    }

    #[must_use]
    pub fn request_count(&self, task: &str, outcome: &str) -> f64 {
        self.requests_total
            .with_label_values(&[truncate_label(task), truncate_label(outcome)])
            .get()
    }

    // ── Safety ───────────────────────────────────────────────────

    pub fn blocked(&self, reason: &str) {
        self.blocked_total
            .with_label_values(&[truncate_label(reason)])
            .inc();
    }

    #[must_use]
    pub fn blocked_count(&self, reason: &str) -> f64 {
        self.blocked_total
            .with_label_values(&[truncate_label(reason)])
            .get()
    }

    // ── Cache ────────────────────────────────────────────────────

    pub fn cache_event(&self, event: &str) {
        self.cache_events_total
            .with_label_values(&[truncate_label(event)])
            .inc();
    }

    #[must_use]
    pub fn cache_event_count(&self, event: &str) -> f64 {
        self.cache_events_total
            .with_label_values(&[truncate_label(event)])
            .get()
    }

    /// Text exposition format for `GET /metrics`.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.request_finished("explain_triage", "allowed", 0.2);
        metrics.request_finished("explain_triage", "allowed", 0.4);
        metrics.request_finished("explain_triage", "blocked", 0.3);
        metrics.blocked("critical_contradiction");
        metrics.cache_event("miss");

        assert_eq!(metrics.request_count("explain_triage", "allowed"), 2.0);
        assert_eq!(metrics.request_count("explain_triage", "blocked"), 1.0);
        assert_eq!(metrics.blocked_count("critical_contradiction"), 1.0);
        assert_eq!(metrics.cache_event_count("miss"), 1.0);
        assert_eq!(metrics.cache_event_count("hit"), 0.0);
    }

    #[test]
    fn encode_text_contains_families() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.request_finished("critical_alert", "allowed", 1.5);
        metrics.cache_event("write");
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("cag_requests_total"));
        assert!(text.contains("cag_request_latency_seconds_bucket"));
        assert!(text.contains("task=\"critical_alert\""));
        assert!(text.contains("cag_cache_events_total{event=\"write\"} 1"));
    }

    #[test]
    fn long_labels_are_truncated() {
        let long = "t".repeat(200);
        assert_eq!(truncate_label(&long).len(), MAX_LABEL_VALUE_LEN);
        let multibyte = "é".repeat(40);
        assert!(truncate_label(&multibyte).len() <= MAX_LABEL_VALUE_LEN);
    }
}
