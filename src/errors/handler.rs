//! Error classification and recovery selection.
//!
//! Pipeline errors are matched by type; anything else is classified by
//! message patterns. The user-facing message is always a fixed string for
//! the category. Raw error text goes to `metadata` only.

use super::GatewayError;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    Safety,
    Configuration,
    Provider,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Safety => "safety",
            Self::Configuration => "configuration",
            Self::Provider => "provider",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Timeout => "AI_TIMEOUT",
            Self::RateLimit => "AI_RATE_LIMITED",
            Self::Safety => "AI_SAFETY_VIOLATION",
            Self::Configuration => "AI_CONFIG_ERROR",
            Self::Provider => "AI_PROVIDER_ERROR",
            Self::Validation => "AI_VALIDATION_ERROR",
            Self::Unknown => "AI_UNKNOWN_ERROR",
        }
    }

    fn base_severity(self) -> ErrorSeverity {
        match self {
            Self::Safety => ErrorSeverity::Critical,
            Self::Configuration => ErrorSeverity::High,
            Self::Timeout | Self::Provider | Self::Unknown => ErrorSeverity::Medium,
            Self::RateLimit | Self::Validation => ErrorSeverity::Low,
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::RateLimit => 429,
            Self::Timeout => 504,
            Self::Provider => 503,
            Self::Validation => 400,
            Self::Safety | Self::Configuration | Self::Unknown => 500,
        }
    }

    fn summary(self) -> &'static str {
        match self {
            Self::Timeout => "AI provider call timed out",
            Self::RateLimit => "AI request rate limit reached",
            Self::Safety => "AI output failed safety enforcement",
            Self::Configuration => "AI gateway is misconfigured",
            Self::Provider => "AI provider failed or is unreachable",
            Self::Validation => "AI request failed validation",
            Self::Unknown => "Unclassified AI gateway failure",
        }
    }

    fn user_message(self) -> &'static str {
        match self {
            Self::Timeout => {
                "The AI assistant took too long to respond. Please try again shortly."
            }
            Self::RateLimit => {
                "Too many AI requests right now. Please wait a moment before trying again."
            }
            Self::Safety => {
                "The AI response could not be shown because it did not pass safety checks. \
                 Please rely on the triage system's guidance."
            }
            Self::Configuration => {
                "The AI assistant is not available right now. Please continue with the \
                 standard workflow."
            }
            Self::Provider => {
                "The AI assistant is temporarily unavailable. Please continue with the \
                 standard workflow."
            }
            Self::Validation => {
                "The request could not be processed. Please check the input and try again."
            }
            Self::Unknown => {
                "Something went wrong with the AI assistant. Please continue with the \
                 standard workflow."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// One level up, saturating at critical.
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Degrade,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub strategy: RecoveryStrategy,
    pub max_retries: u32,
    pub retry_after_seconds: u64,
    pub suggestions: Vec<String>,
}

impl Recovery {
    pub fn for_category(category: ErrorCategory) -> Self {
        let (strategy, max_retries, retry_after_seconds, suggestions) =
            match category {
                ErrorCategory::Timeout => (
                    RecoveryStrategy::Retry,
                    2,
                    2,
                    vec!["Retry the request", "Shorten the input if the problem persists"],
                ),
                ErrorCategory::RateLimit => (
                    RecoveryStrategy::Degrade,
                    0,
                    60,
                    vec!["Wait before sending another request", "Continue without AI assistance"],
                ),
                ErrorCategory::Safety => (
                    RecoveryStrategy::Abort,
                    0,
                    0,
                    vec!["Follow the triage system's priority and recommended actions"],
                ),
                ErrorCategory::Configuration => (
                    RecoveryStrategy::Fallback,
                    0,
                    0,
                    vec!["Contact the system administrator"],
                ),
                ErrorCategory::Provider => (
                    RecoveryStrategy::Retry,
                    3,
                    5,
                    vec!["Retry shortly", "Continue with the standard workflow"],
                ),
                ErrorCategory::Validation => (
                    RecoveryStrategy::Fallback,
                    0,
                    0,
                    vec!["Check the task name and request fields"],
                ),
                ErrorCategory::Unknown => (
                    RecoveryStrategy::Fallback,
                    1,
                    5,
                    vec!["Retry once", "Continue with the standard workflow"],
                ),
            };
        Self {
            strategy,
            max_retries,
            retry_after_seconds,
            suggestions: suggestions.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub user_message: String,
    pub recovery: Recovery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status_code: u16,
}

/// Structured failure body. `metadata` carries internal diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandledError {
    pub success: bool,
    pub error: ErrorDetail,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorContext<'a> {
    pub task: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded", "etimedout"];
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate-limit", "too many requests", "429", "quota"];
const SAFETY_PATTERNS: &[&str] = &["safety", "unsafe", "guardrail", "blocked content", "policy violation"];
const CONFIGURATION_PATTERNS: &[&str] = &[
    "config",
    "not configured",
    "missing api key",
    "unknown provider",
    "invalid model",
];
const PROVIDER_PATTERNS: &[&str] = &[
    "provider",
    "connection refused",
    "econnrefused",
    "connection reset",
    "unavailable",
    "502",
    "503",
    "model not found",
    "error sending request",
    "dns",
];
const VALIDATION_PATTERNS: &[&str] = &["validation", "invalid", "missing field", "malformed", "parse"];

fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    let table: [(&[&str], ErrorCategory); 6] = [
        (TIMEOUT_PATTERNS, ErrorCategory::Timeout),
        (RATE_LIMIT_PATTERNS, ErrorCategory::RateLimit),
        (SAFETY_PATTERNS, ErrorCategory::Safety),
        (CONFIGURATION_PATTERNS, ErrorCategory::Configuration),
        (PROVIDER_PATTERNS, ErrorCategory::Provider),
        (VALIDATION_PATTERNS, ErrorCategory::Validation),
    ];
    table
        .into_iter()
        .find(|(patterns, _)| patterns.iter().any(|p| lower.contains(p)))
        .map_or(ErrorCategory::Unknown, |(_, category)| category)
}

fn classify_typed(err: &anyhow::Error) -> Option<(ErrorCategory, Option<u64>)> {
    for cause in err.chain() {
        if let Some(gateway) = cause.downcast_ref::<GatewayError>() {
            return Some(match gateway {
                GatewayError::Timeout { .. } => (ErrorCategory::Timeout, None),
                GatewayError::RateLimited {
                    retry_after_secs, ..
                } => (ErrorCategory::RateLimit, Some(*retry_after_secs)),
                GatewayError::SafetyViolation(_) => (ErrorCategory::Safety, None),
                GatewayError::Configuration(_) => (ErrorCategory::Configuration, None),
                GatewayError::Provider(_) => (ErrorCategory::Provider, None),
                GatewayError::Validation(_) | GatewayError::Cancelled => {
                    (ErrorCategory::Validation, None)
                }
            });
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return Some((ErrorCategory::Timeout, None));
        }
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() {
                return Some((ErrorCategory::Timeout, None));
            }
            if http.is_connect() || http.is_request() || http.is_status() {
                return Some((ErrorCategory::Provider, None));
            }
        }
    }
    None
}

/// Classifies failures and picks a recovery strategy.
pub struct ErrorHandler {
    clinical_tasks: HashSet<String>,
}

impl ErrorHandler {
    pub fn new<I, S>(clinical_tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clinical_tasks: clinical_tasks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_clinical(&self, task: &str) -> bool {
        self.clinical_tasks.contains(task)
    }

    pub fn categorize(&self, err: &anyhow::Error) -> ErrorCategory {
        classify_typed(err)
            .map(|(category, _)| category)
            .unwrap_or_else(|| classify_message(&format!("{err:#}")))
    }

    pub fn severity(&self, category: ErrorCategory, task: Option<&str>) -> ErrorSeverity {
        let base = category.base_severity();
        if task.is_some_and(|t| self.is_clinical(t)) {
            base.escalate()
        } else {
            base
        }
    }

    pub fn handle(&self, err: &anyhow::Error, ctx: &ErrorContext<'_>) -> HandledError {
        let raw = format!("{err:#}");
        let (category, retry_after) = classify_typed(err)
            .unwrap_or_else(|| (classify_message(&raw), None));
        let severity = self.severity(category, ctx.task);

        let mut recovery = Recovery::for_category(category);
        if let Some(secs) = retry_after {
            recovery.retry_after_seconds = secs;
        }

        tracing::warn!(
            code = category.code(),
            category = category.as_str(),
            severity = severity.as_str(),
            request_id = ctx.request_id.unwrap_or("-"),
            task = ctx.task.unwrap_or("-"),
            "AI request failed"
        );
        tracing::debug!(request_id = ctx.request_id.unwrap_or("-"), "Raw failure: {raw}");

        HandledError {
            success: false,
            error: ErrorDetail {
                code: category.code(),
                category,
                severity,
                message: category.summary().to_string(),
                user_message: category.user_message().to_string(),
                recovery,
                request_id: ctx.request_id.map(str::to_string),
                status_code: category.status_code(),
            },
            metadata: json!({
                "raw_message": raw,
                "task": ctx.task,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ErrorHandler {
        ErrorHandler::new(["explain_triage", "critical_alert"])
    }

    fn handle(message: &str, task: Option<&str>) -> HandledError {
        handler().handle(
            &anyhow::anyhow!(message.to_string()),
            &ErrorContext {
                task,
                request_id: Some("req-1"),
            },
        )
    }

    #[test]
    fn timeout_messages_are_medium_or_high_when_clinical() {
        for message in ["Request timeout", "operation timed out", "ETIMEDOUT on socket"] {
            let plain = handle(message, Some("patient_education"));
            assert_eq!(plain.error.category, ErrorCategory::Timeout, "{message}");
            assert_eq!(plain.error.severity, ErrorSeverity::Medium);

            let clinical = handle(message, Some("explain_triage"));
            assert_eq!(clinical.error.severity, ErrorSeverity::High);
        }
    }

    #[test]
    fn user_message_never_leaks_raw_text() {
        let raw = "SQLSTATE[42P01]: relation \"ai_request_records\" does not exist at db.rs:42";
        let handled = handle(raw, None);
        assert!(!handled.error.user_message.contains("SQLSTATE"));
        assert!(!handled.error.user_message.contains("db.rs"));
        assert!(!handled.error.message.contains("SQLSTATE"));
        assert_eq!(handled.metadata["raw_message"], raw);
    }

    #[test]
    fn categories_by_message() {
        let cases = [
            ("429 Too Many Requests", ErrorCategory::RateLimit),
            ("guardrail tripped", ErrorCategory::Safety),
            ("unknown provider 'foo'", ErrorCategory::Configuration),
            ("connection refused (os error 111)", ErrorCategory::Provider),
            ("missing field `task`", ErrorCategory::Validation),
            ("the flux capacitor broke", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(handle(message, None).error.category, expected, "{message}");
        }
    }

    #[test]
    fn severity_table() {
        let h = handler();
        assert_eq!(h.severity(ErrorCategory::Safety, None), ErrorSeverity::Critical);
        assert_eq!(h.severity(ErrorCategory::Configuration, None), ErrorSeverity::High);
        assert_eq!(h.severity(ErrorCategory::RateLimit, None), ErrorSeverity::Low);
        assert_eq!(
            h.severity(ErrorCategory::RateLimit, Some("critical_alert")),
            ErrorSeverity::Medium
        );
        assert_eq!(
            h.severity(ErrorCategory::Safety, Some("explain_triage")),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn typed_errors_win_over_message() {
        let h = handler();
        let err = anyhow::Error::new(GatewayError::RateLimited {
            reason: "task_limit_exceeded".into(),
            retry_after_secs: 17,
        });
        let handled = h.handle(&err, &ErrorContext::default());
        assert_eq!(handled.error.category, ErrorCategory::RateLimit);
        assert_eq!(handled.error.recovery.strategy, RecoveryStrategy::Degrade);
        assert_eq!(handled.error.recovery.retry_after_seconds, 17);
        assert_eq!(handled.error.status_code, 429);

        let wrapped = anyhow::Error::new(GatewayError::Timeout { after_secs: 5 })
            .context("calling provider");
        assert_eq!(h.categorize(&wrapped), ErrorCategory::Timeout);
    }

    #[test]
    fn recovery_policy() {
        let safety = handle("safety violation", None);
        assert_eq!(safety.error.recovery.strategy, RecoveryStrategy::Abort);
        assert_eq!(safety.error.recovery.max_retries, 0);

        let timeout = handle("timeout", None);
        assert_eq!(timeout.error.recovery.strategy, RecoveryStrategy::Retry);
        assert!(timeout.error.recovery.max_retries > 0);
        assert!(!timeout.error.recovery.suggestions.is_empty());

        let provider = handle("provider returned 503", None);
        assert_eq!(provider.error.recovery.strategy, RecoveryStrategy::Retry);
        assert_eq!(provider.error.status_code, 503);
    }

    #[test]
    fn codes_are_namespaced() {
        let handled = handle("timeout", None);
        assert_eq!(handled.error.code, "AI_TIMEOUT");
        assert_eq!(handled.error.request_id.as_deref(), Some("req-1"));
        assert!(!handled.success);
    }
}
