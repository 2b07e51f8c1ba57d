//! Input hygiene and admission control.

pub mod rate_limiter;
pub mod sanitizer;

pub use rate_limiter::{
    OutcomeStats, RateLimitDecision, RateLimitReason, RateLimiter, RateLimits, WindowUsage,
};
pub use sanitizer::{InputSanitizer, SanitizeOptions, SanitizeResult};
