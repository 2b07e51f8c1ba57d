pub mod metrics;
pub mod monitor;

pub use metrics::{GatewayMetrics, MetricsError};
pub use monitor::{
    Health, HealthStatus, LatencyStats, MetricsSnapshot, Monitor, Period, RequestSample,
    RequestStats, TaskStats, ValidationStats,
};
