//! Clinical-safety analysis of model output against the rule engine.
//!
//! The deterministic triage engine is the ground truth. Its output arrives
//! in the request context as an [`ExplainabilityRecord`]; the
//! [`ContradictionDetector`] compares model text against it and the
//! [`RiskScorer`] turns the findings into a block/warn decision.

pub mod contradiction;
pub mod risk;

pub use contradiction::{ContradictionDetector, DetectionInput, DetectionReport};
pub use risk::{RiskLevel, RiskScore, RiskScorer, RiskSignals, ScoreInput};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Triage priority ──────────────────────────────────────────────

/// Triage priority computed by the rule engine (or implied by text).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Red,
    Yellow,
    Green,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Unknown => "unknown",
        }
    }

    /// Case-insensitive `red` / `yellow` / `green`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "red" => Some(Self::Red),
            "yellow" => Some(Self::Yellow),
            "green" => Some(Self::Green),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Red => "RED (emergency)",
            Self::Yellow => "YELLOW (urgent)",
            Self::Green => "GREEN (routine)",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Explainability record ────────────────────────────────────────

/// One finding that drove the classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    #[serde(alias = "field")]
    pub field_id: String,
    pub value: Value,
    #[serde(alias = "meaning")]
    pub clinical_meaning: String,
}

impl Trigger {
    /// Whether the finding was recorded as present (`true`, `"yes"`,
    /// a non-zero number, or any other non-negative string).
    pub fn is_present(&self) -> bool {
        match &self.value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => !matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "" | "no" | "false" | "absent" | "none" | "0" | "not present" | "negative"
            ),
            Value::Array(items) => !items.is_empty(),
            Value::Object(_) => true,
            Value::Null => false,
        }
    }

    /// Numeric value, when the finding is a measurement.
    pub fn numeric_value(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Action the rule engine recommends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendedAction {
    pub code: String,
    pub justification: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub priority: Priority,
}

/// Rule-engine output consumed read-only by the gateway.
///
/// Accepts the priority either nested (`classification.priority`) or
/// flat (`priority`); the nested form wins when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainabilityRecord {
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    pub triggers: Vec<Trigger>,
    #[serde(alias = "actions")]
    pub recommended_actions: Vec<RecommendedAction>,
}

/// Lenient read of the `explainability` member.
#[derive(Debug, Clone, Default)]
pub struct ParsedExplainability {
    /// Whatever could be read; `None` when the member is absent or not an
    /// object.
    pub record: Option<ExplainabilityRecord>,
    /// Fields that were present but unreadable.
    pub issues: Vec<String>,
}

impl ParsedExplainability {
    pub fn is_malformed(&self) -> bool {
        !self.issues.is_empty()
    }
}

impl ExplainabilityRecord {
    /// Parse from a request context's `explainability` member, if any.
    pub fn from_context(context: &Value) -> Option<Self> {
        Self::parse(context).record
    }

    /// Field-by-field parse that keeps every readable part and reports
    /// the rest, so a bad `triggers` entry does not hide the priority.
    pub fn parse(context: &Value) -> ParsedExplainability {
        let Some(raw) = context.get("explainability").filter(|v| !v.is_null()) else {
            return ParsedExplainability::default();
        };
        let Some(fields) = raw.as_object() else {
            return ParsedExplainability {
                record: None,
                issues: vec![format!("explainability: expected an object, got {}", json_kind(raw))],
            };
        };

        let mut issues = Vec::new();
        let mut record = Self::default();
        match fields.get("classification") {
            None | Some(Value::Null) => {}
            Some(Value::Object(classification)) => {
                if let Some(value) = classification.get("priority") {
                    record.classification.priority =
                        read_priority(value, "classification.priority", &mut issues)
                            .unwrap_or_default();
                }
            }
            Some(other) => issues.push(format!(
                "classification: expected an object, got {}",
                json_kind(other)
            )),
        }
        if let Some(value) = fields.get("priority") {
            record.priority = read_priority(value, "priority", &mut issues);
        }
        record.triggers = read_list(fields, &["triggers"], &mut issues);
        record.recommended_actions =
            read_list(fields, &["recommended_actions", "actions"], &mut issues);

        ParsedExplainability {
            record: Some(record),
            issues,
        }
    }

    pub fn priority(&self) -> Priority {
        match (self.classification.priority, self.priority) {
            (Priority::Unknown, Some(flat)) => flat,
            (nested, _) => nested,
        }
    }

    pub fn has_action(&self, needle: &str) -> bool {
        self.recommended_actions
            .iter()
            .any(|a| a.code.to_ascii_lowercase().contains(needle))
    }

    /// Present trigger whose field id contains `needle`.
    pub fn present_trigger(&self, needle: &str) -> Option<&Trigger> {
        self.triggers
            .iter()
            .find(|t| t.field_id.to_ascii_lowercase().contains(needle) && t.is_present())
    }

    pub fn trigger(&self, needle: &str) -> Option<&Trigger> {
        self.triggers
            .iter()
            .find(|t| t.field_id.to_ascii_lowercase().contains(needle))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn read_priority(value: &Value, field: &str, issues: &mut Vec<String>) -> Option<Priority> {
    match value {
        Value::Null => None,
        Value::String(raw) => {
            let parsed = Priority::parse(raw);
            if parsed.is_none() {
                issues.push(format!("{field}: unrecognised priority '{raw}'"));
            }
            parsed
        }
        other => {
            issues.push(format!("{field}: expected a string, got {}", json_kind(other)));
            None
        }
    }
}

/// First present key of `keys`, read element by element.
fn read_list<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    keys: &[&str],
    issues: &mut Vec<String>,
) -> Vec<T> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|key| fields.get(*key).map(|value| (*key, value)))
    else {
        return Vec::new();
    };
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match serde_json::from_value(item.clone()) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    issues.push(format!("{key}[{i}]: {e}"));
                    None
                }
            })
            .collect(),
        other => {
            issues.push(format!("{key}: expected an array, got {}", json_kind(other)));
            Vec::new()
        }
    }
}

// ── Contradictions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ContradictionSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionKind {
    PriorityMismatch,
    ActionConflict,
    DataInconsistency,
    ScopeViolation,
    ClinicalError,
}

impl ContradictionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorityMismatch => "priority_mismatch",
            Self::ActionConflict => "action_conflict",
            Self::DataInconsistency => "data_inconsistency",
            Self::ScopeViolation => "scope_violation",
            Self::ClinicalError => "clinical_error",
        }
    }
}

/// A conflict between model text and the rule engine's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contradiction {
    #[serde(rename = "type")]
    pub kind: ContradictionKind,
    pub severity: ContradictionSeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl Contradiction {
    pub fn new(
        kind: ContradictionKind,
        severity: ContradictionSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            resolution: None,
        }
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_priority_wins() {
        let record: ExplainabilityRecord = serde_json::from_value(json!({
            "classification": {"priority": "red"},
            "priority": "green"
        }))
        .unwrap();
        assert_eq!(record.priority(), Priority::Red);
    }

    #[test]
    fn flat_priority_and_aliases() {
        let record: ExplainabilityRecord = serde_json::from_value(json!({
            "priority": "yellow",
            "triggers": [{"field": "cyanosis", "value": "yes", "meaning": "low oxygen"}],
            "actions": [{"code": "urgent_referral"}]
        }))
        .unwrap();
        assert_eq!(record.priority(), Priority::Yellow);
        assert!(record.present_trigger("cyanosis").is_some());
        assert!(record.has_action("referral"));
    }

    #[test]
    fn unrecognised_priority_is_unknown() {
        let record: ExplainabilityRecord =
            serde_json::from_value(json!({"priority": "purple"})).unwrap();
        assert_eq!(record.priority(), Priority::Unknown);
    }

    #[test]
    fn trigger_presence() {
        let t = |value: Value| Trigger {
            field_id: "x".into(),
            value,
            clinical_meaning: String::new(),
        };
        assert!(t(json!(true)).is_present());
        assert!(t(json!("present")).is_present());
        assert!(t(json!(52)).is_present());
        assert!(!t(json!("no")).is_present());
        assert!(!t(json!(false)).is_present());
        assert!(!t(Value::Null).is_present());
        assert_eq!(t(json!("48")).numeric_value(), Some(48.0));
    }

    #[test]
    fn contradiction_serializes_type_field() {
        let c = Contradiction::new(
            ContradictionKind::PriorityMismatch,
            ContradictionSeverity::Critical,
            "downplayed",
        );
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "priority_mismatch");
        assert_eq!(v["severity"], "critical");
        assert!(v.get("resolution").is_none());
    }

    #[test]
    fn from_context_reads_member() {
        let ctx = json!({"explainability": {"classification": {"priority": "green"}}});
        let record = ExplainabilityRecord::from_context(&ctx).unwrap();
        assert_eq!(record.priority(), Priority::Green);
        assert!(ExplainabilityRecord::from_context(&json!({})).is_none());
    }

    #[test]
    fn priority_spelling_is_case_insensitive() {
        let parsed = ExplainabilityRecord::parse(&json!({
            "explainability": {"classification": {"priority": " RED "}}
        }));
        assert!(!parsed.is_malformed());
        assert_eq!(parsed.record.unwrap().priority(), Priority::Red);
    }

    #[test]
    fn malformed_fields_are_reported_not_dropped() {
        let parsed = ExplainabilityRecord::parse(&json!({
            "explainability": {
                "classification": {"priority": "red"},
                "triggers": "chest_indrawing",
                "recommended_actions": [{"code": "urgent_referral"}, {"code": 7}]
            }
        }));
        assert!(parsed.is_malformed());
        assert_eq!(parsed.issues.len(), 2);
        assert!(parsed.issues[0].starts_with("triggers: expected an array"));
        assert!(parsed.issues[1].starts_with("recommended_actions[1]"));

        let record = parsed.record.unwrap();
        assert_eq!(record.priority(), Priority::Red);
        assert!(record.triggers.is_empty());
        assert!(record.has_action("referral"));
    }

    #[test]
    fn unknown_priority_spelling_is_an_issue() {
        let parsed = ExplainabilityRecord::parse(&json!({
            "explainability": {"priority": "amber"}
        }));
        assert_eq!(parsed.issues, vec!["priority: unrecognised priority 'amber'"]);
        assert_eq!(parsed.record.unwrap().priority(), Priority::Unknown);
    }

    #[test]
    fn non_object_record_is_an_issue() {
        let parsed = ExplainabilityRecord::parse(&json!({"explainability": "red"}));
        assert!(parsed.record.is_none());
        assert_eq!(parsed.issues, vec!["explainability: expected an object, got a string"]);
        assert!(!ExplainabilityRecord::parse(&json!({"explainability": null})).is_malformed());
    }
}
