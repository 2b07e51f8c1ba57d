//! Gateway error types, classification and retry policy.

pub mod handler;

pub use handler::{
    ErrorCategory, ErrorContext, ErrorDetail, ErrorHandler, ErrorSeverity, HandledError, Recovery,
    RecoveryStrategy,
};

use std::time::Duration;
use thiserror::Error;

/// Failures raised by the pipeline itself. Foreign errors (I/O, HTTP,
/// storage) travel as `anyhow::Error` and are classified by message.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("provider call timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("rate limit exceeded: {reason}")]
    RateLimited { reason: String, retry_after_secs: u64 },

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("request cancelled")]
    Cancelled,
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
