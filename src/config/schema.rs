use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ── Top-level config ────────────────────────────────────────────

/// Complete gateway configuration (`config.toml`).
///
/// Every section carries `#[serde(default)]`, so a partial file is valid
/// and an absent file yields the built-in policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub provider: ProviderConfig,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub sanitizer: SanitizerConfig,
    pub rules: RulesConfig,
    pub risk: RiskConfig,
    pub monitor: MonitorConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
    /// Per-task policy keyed by task name (e.g. `explain_triage`).
    pub tasks: TaskTable,
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Admin token for `/api/admin/*`. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
    /// Whole-request HTTP timeout. Raised at startup when shorter than the
    /// provider's worst-case retry chain.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8088,
            admin_token: None,
            request_timeout_secs: 120,
        }
    }
}

// ── Provider ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider backend. Supported: `ollama`.
    pub kind: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    /// Upper bound for a single provider call, including streaming.
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "ollama".into(),
            base_url: "http://127.0.0.1:11434".into(),
            model: "llama3.2:3b".into(),
            temperature: 0.2,
            timeout_secs: 60,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
        }
    }
}

// ── Rate limits ─────────────────────────────────────────────────

/// Limits for the three admission windows. Hot-updatable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Ceiling across all users and tasks, per minute.
    pub global_per_minute: u32,
    /// Per-user per-task limit for tasks without an explicit entry.
    pub default_task_per_minute: u32,
    /// Per-user daily quota for roles without an explicit entry.
    pub default_daily_quota: u32,
    pub task_per_minute: HashMap<String, u32>,
    pub role_daily_quota: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_per_minute: 120,
            default_task_per_minute: 10,
            task_per_minute: HashMap::from([
                ("explain_triage".into(), 10),
                ("summarize_history".into(), 10),
                ("suggest_questions".into(), 20),
                ("patient_education".into(), 20),
                ("documentation_help".into(), 15),
                ("critical_alert".into(), 30),
            ]),
            default_daily_quota: 100,
            role_daily_quota: HashMap::from([
                ("admin".into(), 1_000),
                ("clinician".into(), 500),
                ("nurse".into(), 300),
                ("chw".into(), 150),
            ]),
        }
    }
}

// ── Cache ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    /// How long past its TTL an entry may still serve as a failure fallback.
    pub stale_grace_secs: u64,
    /// Tasks that are never memoized regardless of payload.
    pub non_cacheable_tasks: Vec<String>,
    /// Context fields excluded from the cache key.
    pub volatile_fields: Vec<String>,
    pub task_ttl_secs: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 900,
            task_ttl_secs: HashMap::from([
                ("explain_triage".into(), 3_600),
                ("summarize_history".into(), 1_800),
                ("patient_education".into(), 86_400),
                ("documentation_help".into(), 600),
            ]),
            non_cacheable_tasks: vec![
                "critical_alert".into(),
                "emergency_triage".into(),
                "danger_sign_alert".into(),
            ],
            volatile_fields: vec![
                "timestamp".into(),
                "created_at".into(),
                "updated_at".into(),
                "user_id".into(),
                "request_id".into(),
                "session_id".into(),
                "nonce".into(),
            ],
            stale_grace_secs: 600,
        }
    }
}

// ── Sanitizer ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SanitizerConfig {
    pub max_length: usize,
    pub strip_injection: bool,
    pub redact_phi: bool,
    pub escape_markup: bool,
    pub injection_placeholder: String,
    pub redaction_marker: String,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_length: 4_000,
            strip_injection: true,
            redact_phi: true,
            escape_markup: true,
            injection_placeholder: "[filtered]".into(),
            redaction_marker: "[REDACTED]".into(),
        }
    }
}

// ── Rule tables ─────────────────────────────────────────────────

/// Phrase and keyword tables driving the output validator, the
/// contradiction detector and the risk scorer. All matching is
/// case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RulesConfig {
    /// Directive/diagnostic/prescriptive language that is redacted and blocks.
    pub deny_phrases: Vec<String>,
    /// Hedging language that is recorded but allowed.
    pub warning_phrases: Vec<String>,
    /// Overconfident absolutes.
    pub absolute_phrases: Vec<String>,
    /// Explicit admissions that data is missing.
    pub missing_data_phrases: Vec<String>,
    /// Language recommending a treatment course.
    pub treatment_phrases: Vec<String>,
    pub red_keywords: Vec<String>,
    pub yellow_keywords: Vec<String>,
    pub green_keywords: Vec<String>,
    pub home_care_phrases: Vec<String>,
    pub no_antibiotic_phrases: Vec<String>,
    pub no_follow_up_phrases: Vec<String>,
    pub deny_marker: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            deny_phrases: strings(&[
                "you must",
                "i recommend",
                "i prescribe",
                "take this medication",
                "take this medicine",
                "the diagnosis is",
                "i diagnose",
                "you should take",
                "administer",
                "override the triage",
                "ignore the triage",
                "stop the medication",
            ]),
            warning_phrases: strings(&[
                "consider",
                "may indicate",
                "possible",
                "possibly",
                "might suggest",
                "could be",
                "cannot rule out",
            ]),
            absolute_phrases: strings(&[
                "definitely",
                "certainly",
                "always",
                "never",
                "guaranteed",
                "without a doubt",
                "100%",
            ]),
            missing_data_phrases: strings(&[
                "unable to determine",
                "cannot determine",
                "insufficient data",
                "not enough information",
                "data is missing",
                "missing data",
            ]),
            treatment_phrases: strings(&[
                "home care",
                "treat with",
                "should be given",
                "give the child",
                "start treatment",
                "course of",
            ]),
            red_keywords: strings(&[
                "emergency",
                "urgent referral",
                "refer urgently",
                "immediately",
                "life-threatening",
                "critical condition",
                "severe",
                "danger sign",
                "red priority",
            ]),
            yellow_keywords: strings(&[
                "urgent",
                "needs attention soon",
                "within 24 hours",
                "moderate",
                "yellow priority",
                "follow up in 2 days",
            ]),
            green_keywords: strings(&[
                "mild",
                "routine",
                "home care",
                "manage at home",
                "not serious",
                "not severe",
                "nothing to worry",
                "not urgent",
                "not an emergency",
                "no danger signs",
                "green priority",
                "is fine",
            ]),
            home_care_phrases: strings(&[
                "home care",
                "manage at home",
                "treat at home",
                "no need to refer",
                "no referral needed",
                "can stay home",
            ]),
            no_antibiotic_phrases: strings(&[
                "no antibiotics",
                "antibiotics are not needed",
                "antibiotics are not necessary",
                "does not need antibiotics",
                "avoid antibiotics",
            ]),
            no_follow_up_phrases: strings(&[
                "no follow-up",
                "no follow up",
                "no need for follow-up",
                "no need to return",
                "follow-up is not needed",
            ]),
            deny_marker: "[REMOVED: outside advisory scope]".into(),
        }
    }
}

// ── Risk ────────────────────────────────────────────────────────

/// Additive signal weights.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RiskWeights {
    pub rule_conflict: u32,
    pub critical_conflict: u32,
    pub dosage: u32,
    pub diagnosis_claim: u32,
    pub absolute_language: u32,
    pub missing_data: u32,
    pub treatment_recommendation: u32,
    pub injection_attempt: u32,
    pub malformed_explainability: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            rule_conflict: 5,
            critical_conflict: 3,
            dosage: 5,
            diagnosis_claim: 3,
            absolute_language: 2,
            missing_data: 1,
            treatment_recommendation: 2,
            injection_attempt: 3,
            malformed_explainability: 3,
        }
    }
}

/// Two independent threshold systems: reporting tiers for badges and a
/// separate block/warn gate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RiskConfig {
    /// Lowest total reported as `yellow`.
    pub yellow_min: u32,
    /// Lowest total reported as `red`.
    pub red_min: u32,
    /// Totals above this block the response.
    pub block_threshold: u32,
    /// Totals at or above this count as a delivered warning.
    pub warn_threshold: u32,
    pub weights: RiskWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            yellow_min: 3,
            red_min: 6,
            block_threshold: 7,
            warn_threshold: 3,
            weights: RiskWeights::default(),
        }
    }
}

// ── Monitor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MonitorConfig {
    /// Error rate above which the health score starts degrading.
    pub error_rate_warning: f64,
    /// Health points lost per percentage point above the warning rate.
    pub error_rate_penalty_per_point: f64,
    /// Average latency above which a fixed penalty applies.
    pub latency_warning_ms: u64,
    pub latency_penalty: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_rate_warning: 0.05,
            error_rate_penalty_per_point: 2.0,
            latency_warning_ms: 10_000,
            latency_penalty: 10.0,
        }
    }
}

// ── Session ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    pub escalation_threshold: u32,
    /// Lifetime of a session's warning counter, counted from its first
    /// warning. Escalation itself does not expire.
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
            ttl_secs: 24 * 3_600,
        }
    }
}

// ── Audit ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AuditConfig {
    /// `sqlite` or `memory`.
    pub backend: String,
    /// SQLite file. Defaults to `<data_dir>/audit.db`.
    pub db_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".into(),
            db_path: None,
        }
    }
}

// ── Logging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────

/// Policy for one AI task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TaskPolicy {
    /// Roles allowed to invoke the task.
    pub roles: Vec<String>,
    /// Clinical tasks escalate error severity one level.
    pub clinical: bool,
    pub max_words: u32,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Task-specific instruction appended after the safety constraints.
    pub instruction: String,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            roles: strings(&["admin", "clinician", "nurse"]),
            clinical: false,
            max_words: 150,
            max_tokens: 300,
            temperature: None,
            instruction: "Provide brief, factual decision support.".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TaskTable(pub HashMap<String, TaskPolicy>);

impl Default for TaskTable {
    fn default() -> Self {
        let all_roles = strings(&["admin", "clinician", "nurse", "chw"]);
        let clinical_roles = strings(&["admin", "clinician", "nurse"]);
        Self(HashMap::from([
            (
                "explain_triage".into(),
                TaskPolicy {
                    roles: all_roles.clone(),
                    clinical: true,
                    max_words: 150,
                    max_tokens: 300,
                    temperature: Some(0.1),
                    instruction: "Explain, in plain language, why the triage system assigned \
                                  the given priority. Refer only to the listed triggers and \
                                  recommended actions."
                        .into(),
                },
            ),
            (
                "summarize_history".into(),
                TaskPolicy {
                    roles: clinical_roles.clone(),
                    clinical: true,
                    max_words: 200,
                    max_tokens: 400,
                    temperature: Some(0.2),
                    instruction: "Summarize the recorded visit history. Do not infer findings \
                                  that are not recorded."
                        .into(),
                },
            ),
            (
                "suggest_questions".into(),
                TaskPolicy {
                    roles: all_roles.clone(),
                    clinical: false,
                    max_words: 100,
                    max_tokens: 200,
                    temperature: Some(0.3),
                    instruction: "Suggest follow-up questions the health worker could ask to \
                                  complete the assessment."
                        .into(),
                },
            ),
            (
                "patient_education".into(),
                TaskPolicy {
                    roles: all_roles.clone(),
                    clinical: false,
                    max_words: 150,
                    max_tokens: 300,
                    temperature: Some(0.3),
                    instruction: "Write caregiver-friendly education text about the recorded \
                                  condition category, without treatment instructions."
                        .into(),
                },
            ),
            (
                "documentation_help".into(),
                TaskPolicy {
                    roles: clinical_roles.clone(),
                    clinical: false,
                    max_words: 120,
                    max_tokens: 250,
                    temperature: Some(0.2),
                    instruction: "Help phrase the clinical note clearly using only the \
                                  recorded facts."
                        .into(),
                },
            ),
            (
                "critical_alert".into(),
                TaskPolicy {
                    roles: all_roles,
                    clinical: true,
                    max_words: 80,
                    max_tokens: 160,
                    temperature: Some(0.0),
                    instruction: "State which recorded danger signs triggered the alert and \
                                  restate the system's recommended actions verbatim."
                        .into(),
                },
            ),
        ]))
    }
}

impl TaskTable {
    pub fn get(&self, task: &str) -> Option<&TaskPolicy> {
        self.0.get(task)
    }

    pub fn contains(&self, task: &str) -> bool {
        self.0.contains_key(task)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
