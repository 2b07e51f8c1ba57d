//! Detects model statements that conflict with the triage engine.

use super::{
    Contradiction, ContradictionKind, ContradictionSeverity, ExplainabilityRecord, Priority,
};
use crate::guardrails::rules::{self, RuleSet};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

static CYANOSIS_DENIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:no|without|absence\s+of|denies|not)\s+(?:\w+\s+){0,3}?(?:cyanosis|cyanotic|blue\s+lips)\b",
    )
    .unwrap()
});

static RESPIRATORY_DISTRESS_DENIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:no|without|absence\s+of|not\s+in)\s+(?:\w+\s+){0,3}?(?:respiratory|breathing)\s+distress\b|\bbreathing\s+(?:is\s+)?(?:comfortable|unlaboured|unlabored)\b",
    )
    .unwrap()
});

static DANGER_SIGNS_DENIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:no|without\s+(?:any\s+)?)\s*(?:general\s+)?danger\s+signs?\b|\bdanger\s+signs?\s+(?:are|is)\s+(?:absent|not\s+present)\b",
    )
    .unwrap()
});

static RATE_CALLED_NORMAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:respiratory\s+rate|breathing\s+rate|breathing|rr)\s+(?:is|was|seems|looks|appears)\s+(?:(?P<q>\w+)\s+)?normal\b",
    )
    .unwrap()
});

/// Fast-breathing cut-offs (breaths/min) by age in months.
fn fast_breathing_threshold(age_months: f64) -> Option<f64> {
    if age_months < 2.0 {
        Some(60.0)
    } else if age_months < 12.0 {
        Some(50.0)
    } else if age_months < 60.0 {
        Some(40.0)
    } else {
        None
    }
}

pub struct DetectionInput<'a> {
    pub ai_output: &'a str,
    pub explainability: Option<&'a ExplainabilityRecord>,
    pub context: &'a Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub contradictions: Vec<Contradiction>,
    pub has_critical: bool,
    pub has_errors: bool,
    pub summary: String,
}

impl DetectionReport {
    fn from_contradictions(contradictions: Vec<Contradiction>) -> Self {
        let count = |severity| {
            contradictions
                .iter()
                .filter(|c| c.severity == severity)
                .count()
        };
        let summary = if contradictions.is_empty() {
            "no contradictions".to_string()
        } else {
            let parts: Vec<String> = [
                ContradictionSeverity::Critical,
                ContradictionSeverity::Error,
                ContradictionSeverity::Warning,
                ContradictionSeverity::Info,
            ]
            .into_iter()
            .filter_map(|severity| {
                let n = count(severity);
                (n > 0).then(|| format!("{n} {}", severity.as_str()))
            })
            .collect();
            format!(
                "{} contradiction(s): {}",
                contradictions.len(),
                parts.join(", ")
            )
        };
        Self {
            has_critical: contradictions
                .iter()
                .any(|c| c.severity == ContradictionSeverity::Critical),
            has_errors: contradictions
                .iter()
                .any(|c| c.severity >= ContradictionSeverity::Error),
            contradictions,
            summary,
        }
    }

    pub fn count(&self, kind: ContradictionKind) -> usize {
        self.contradictions.iter().filter(|c| c.kind == kind).count()
    }
}

pub struct ContradictionDetector {
    rules: Arc<RuleSet>,
}

impl ContradictionDetector {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn detect(&self, input: &DetectionInput<'_>) -> DetectionReport {
        let text = input.ai_output;
        let mut found = Vec::new();

        if let Some(record) = input.explainability {
            self.priority_mismatch(text, record, &mut found);
            self.action_conflicts(text, record, &mut found);
            data_inconsistencies(text, record, &mut found);
        }
        scope_violations(text, &mut found);
        clinical_errors(text, input.explainability, input.context, &mut found);

        DetectionReport::from_contradictions(found)
    }

    fn priority_mismatch(
        &self,
        text: &str,
        record: &ExplainabilityRecord,
        found: &mut Vec<Contradiction>,
    ) {
        let system = record.priority();
        if system == Priority::Unknown {
            return;
        }
        let tiers = self.rules.priority.tiers_in(text);
        let mentions = |tier: Priority| tiers.contains(&tier);
        // A lower tier anywhere in the text is a downplay, even next to a
        // higher-tier keyword; it outranks any escalation.
        let (implied, severity) = match system {
            Priority::Red if mentions(Priority::Green) => {
                (Priority::Green, ContradictionSeverity::Critical)
            }
            Priority::Red if mentions(Priority::Yellow) && !mentions(Priority::Red) => {
                (Priority::Yellow, ContradictionSeverity::Critical)
            }
            Priority::Yellow if mentions(Priority::Green) => {
                (Priority::Green, ContradictionSeverity::Error)
            }
            Priority::Yellow | Priority::Green if mentions(Priority::Red) => {
                (Priority::Red, ContradictionSeverity::Warning)
            }
            Priority::Green if mentions(Priority::Yellow) => {
                (Priority::Yellow, ContradictionSeverity::Error)
            }
            _ => return,
        };
        found.push(
            Contradiction::new(
                ContradictionKind::PriorityMismatch,
                severity,
                format!(
                    "Output implies {} priority but the triage system assigned {}",
                    implied.as_str(),
                    system.as_str()
                ),
            )
            .with_resolution(format!(
                "Defer to the triage system's {} classification",
                system.label()
            )),
        );
    }

    fn action_conflicts(
        &self,
        text: &str,
        record: &ExplainabilityRecord,
        found: &mut Vec<Contradiction>,
    ) {
        if record.has_action("referral") && self.rules.home_care.is_match(text) {
            found.push(
                Contradiction::new(
                    ContradictionKind::ActionConflict,
                    ContradictionSeverity::Critical,
                    "Output suggests home care while the triage system requires referral",
                )
                .with_resolution("Follow the referral action listed by the triage system"),
            );
        }
        if record.has_action("antibiotic") && self.rules.no_antibiotic.is_match(text) {
            found.push(
                Contradiction::new(
                    ContradictionKind::ActionConflict,
                    ContradictionSeverity::Error,
                    "Output advises against antibiotics while the triage system lists an antibiotic action",
                )
                .with_resolution("Follow the antibiotic action listed by the triage system"),
            );
        }
        if record.has_action("follow") && self.rules.no_follow_up.is_match(text) {
            found.push(Contradiction::new(
                ContradictionKind::ActionConflict,
                ContradictionSeverity::Warning,
                "Output says no follow-up is needed while the triage system schedules one",
            ));
        }
    }
}

fn data_inconsistencies(text: &str, record: &ExplainabilityRecord, found: &mut Vec<Contradiction>) {
    let checks: [(&str, &str, &Regex, ContradictionSeverity); 3] = [
        ("cyanosis", "cyanosis", &*CYANOSIS_DENIED, ContradictionSeverity::Error),
        (
            "respiratory_distress",
            "respiratory distress",
            &*RESPIRATORY_DISTRESS_DENIED,
            ContradictionSeverity::Error,
        ),
        ("danger", "danger signs", &*DANGER_SIGNS_DENIED, ContradictionSeverity::Critical),
    ];
    for (field, label, denial, severity) in checks {
        if record.present_trigger(field).is_some() && denial.is_match(text) {
            found.push(
                Contradiction::new(
                    ContradictionKind::DataInconsistency,
                    severity,
                    format!("Output denies {label}, which was recorded as present"),
                )
                .with_resolution(format!("Treat {label} as present, as recorded")),
            );
        }
    }
}

fn scope_violations(text: &str, found: &mut Vec<Contradiction>) {
    if rules::has_diagnosis_claim(text) {
        found.push(Contradiction::new(
            ContradictionKind::ScopeViolation,
            ContradictionSeverity::Error,
            "Output makes a diagnosis claim",
        ));
    }
    if rules::has_prescription(text) || rules::has_dosage(text) {
        found.push(Contradiction::new(
            ContradictionKind::ScopeViolation,
            ContradictionSeverity::Error,
            "Output contains prescription or dosage language",
        ));
    }
}

fn numeric_field(context: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match context.get(*key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn clinical_errors(
    text: &str,
    record: Option<&ExplainabilityRecord>,
    context: &Value,
    found: &mut Vec<Contradiction>,
) {
    let called_normal = RATE_CALLED_NORMAL.captures_iter(text).any(|caps| {
        caps.name("q")
            .is_none_or(|q| !q.as_str().eq_ignore_ascii_case("not"))
    });
    if !called_normal {
        return;
    }

    let rate = numeric_field(context, &["respiratory_rate", "resp_rate", "rr"]).or_else(|| {
        record
            .and_then(|r| r.trigger("respiratory_rate"))
            .and_then(|t| t.numeric_value())
    });
    let age = numeric_field(context, &["age_months", "ageMonths"]);
    let (Some(rate), Some(age)) = (rate, age) else {
        return;
    };
    let Some(threshold) = fast_breathing_threshold(age) else {
        return;
    };
    if rate >= threshold {
        found.push(
            Contradiction::new(
                ContradictionKind::ClinicalError,
                ContradictionSeverity::Error,
                format!(
                    "Output calls a respiratory rate of {rate} normal; {threshold} or more is fast breathing at {age} months"
                ),
            )
            .with_resolution("Describe the recorded rate as fast breathing"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RulesConfig;
    use serde_json::json;

    fn detector() -> ContradictionDetector {
        ContradictionDetector::new(Arc::new(RuleSet::from_config(&RulesConfig::default()).unwrap()))
    }

    fn record(value: Value) -> ExplainabilityRecord {
        serde_json::from_value(value).unwrap()
    }

    fn detect(text: &str, explain: &ExplainabilityRecord, context: &Value) -> DetectionReport {
        detector().detect(&DetectionInput {
            ai_output: text,
            explainability: Some(explain),
            context,
        })
    }

    fn kinds_with(report: &DetectionReport, kind: ContradictionKind) -> Vec<ContradictionSeverity> {
        report
            .contradictions
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.severity)
            .collect()
    }

    #[test]
    fn red_downplayed_to_green_is_critical() {
        let explain = record(json!({"classification": {"priority": "red"}}));
        let report = detect("This is a mild case, home care is fine", &explain, &json!({}));
        assert_eq!(
            kinds_with(&report, ContradictionKind::PriorityMismatch),
            vec![ContradictionSeverity::Critical]
        );
        assert!(report.has_critical);
        assert!(report.has_errors);
    }

    #[test]
    fn downplay_hidden_behind_red_keyword_is_critical() {
        let explain = record(json!({"classification": {"priority": "red"}}));
        let report = detect(
            "This is a mild case; no emergency transport is needed, manage at home.",
            &explain,
            &json!({}),
        );
        assert_eq!(
            kinds_with(&report, ContradictionKind::PriorityMismatch),
            vec![ContradictionSeverity::Critical]
        );
        assert!(report.has_critical);
    }

    #[test]
    fn urgent_wording_in_red_case_is_not_a_downplay() {
        let explain = record(json!({"priority": "red"}));
        let report = detect(
            "Danger sign present: this is an emergency and needs urgent care.",
            &explain,
            &json!({}),
        );
        assert!(kinds_with(&report, ContradictionKind::PriorityMismatch).is_empty());
    }

    #[test]
    fn yellow_case_called_routine_is_error() {
        let explain = record(json!({"priority": "yellow"}));
        let report = detect("Moderate symptoms, a routine review is enough.", &explain, &json!({}));
        assert_eq!(
            kinds_with(&report, ContradictionKind::PriorityMismatch),
            vec![ContradictionSeverity::Error]
        );
    }

    #[test]
    fn escalating_to_red_is_warning() {
        let explain = record(json!({"priority": "yellow"}));
        let report = detect("This looks like an emergency.", &explain, &json!({}));
        assert_eq!(
            kinds_with(&report, ContradictionKind::PriorityMismatch),
            vec![ContradictionSeverity::Warning]
        );
        assert!(!report.has_critical);
        assert!(!report.has_errors);
    }

    #[test]
    fn green_versus_yellow_is_error() {
        let explain = record(json!({"priority": "green"}));
        let report = detect("The child needs attention soon.", &explain, &json!({}));
        assert_eq!(
            kinds_with(&report, ContradictionKind::PriorityMismatch),
            vec![ContradictionSeverity::Error]
        );
    }

    #[test]
    fn agreement_and_unknown_produce_nothing() {
        let red = record(json!({"priority": "red"}));
        assert!(detect("Refer urgently, this is an emergency.", &red, &json!({}))
            .contradictions
            .is_empty());
        let unknown = record(json!({}));
        assert!(detect("mild", &unknown, &json!({})).contradictions.is_empty());
    }

    #[test]
    fn action_conflicts_by_severity() {
        let explain = record(json!({
            "priority": "yellow",
            "recommended_actions": [
                {"code": "urgent_referral"},
                {"code": "oral_antibiotic"},
                {"code": "follow_up_2_days"}
            ]
        }));
        let report = detect(
            "You can manage at home. No antibiotics are required. No follow-up needed.",
            &explain,
            &json!({}),
        );
        let mut severities = kinds_with(&report, ContradictionKind::ActionConflict);
        severities.sort();
        assert_eq!(
            severities,
            vec![
                ContradictionSeverity::Warning,
                ContradictionSeverity::Error,
                ContradictionSeverity::Critical
            ]
        );
    }

    #[test]
    fn denied_findings_are_inconsistent() {
        let explain = record(json!({
            "priority": "red",
            "triggers": [
                {"field_id": "cyanosis", "value": true},
                {"field_id": "respiratory_distress", "value": "yes"},
                {"field_id": "general_danger_signs", "value": true}
            ]
        }));
        let report = detect(
            "There is no cyanosis, no respiratory distress and no danger signs.",
            &explain,
            &json!({}),
        );
        let mut severities = kinds_with(&report, ContradictionKind::DataInconsistency);
        severities.sort();
        assert_eq!(
            severities,
            vec![
                ContradictionSeverity::Error,
                ContradictionSeverity::Error,
                ContradictionSeverity::Critical
            ]
        );
    }

    #[test]
    fn absent_findings_may_be_denied() {
        let explain = record(json!({
            "priority": "green",
            "triggers": [{"field_id": "cyanosis", "value": false}]
        }));
        let report = detect("No cyanosis was seen.", &explain, &json!({}));
        assert_eq!(report.count(ContradictionKind::DataInconsistency), 0);
    }

    #[test]
    fn scope_violations_without_explainability() {
        let report = detector().detect(&DetectionInput {
            ai_output: "The diagnosis is pneumonia. Give 250 mg amoxicillin.",
            explainability: None,
            context: &json!({}),
        });
        assert_eq!(report.count(ContradictionKind::ScopeViolation), 2);
        assert!(report.has_errors);
        assert!(!report.has_critical);
    }

    #[test]
    fn elevated_rate_called_normal() {
        let explain = record(json!({"priority": "yellow"}));
        let context = json!({"age_months": 8, "respiratory_rate": 56});
        let report = detect("The breathing rate is normal for age.", &explain, &context);
        assert_eq!(report.count(ContradictionKind::ClinicalError), 1);

        let negated = detect("The breathing rate is not normal.", &explain, &context);
        assert_eq!(negated.count(ContradictionKind::ClinicalError), 0);

        let calm = json!({"age_months": 30, "respiratory_rate": 32});
        let fine = detect("The breathing rate is normal.", &explain, &calm);
        assert_eq!(fine.count(ContradictionKind::ClinicalError), 0);
    }

    #[test]
    fn rate_from_trigger_when_context_lacks_it() {
        let explain = record(json!({
            "priority": "yellow",
            "triggers": [{"field_id": "respiratory_rate", "value": 65}]
        }));
        let report = detect("Respiratory rate is normal.", &explain, &json!({"age_months": 1}));
        assert_eq!(report.count(ContradictionKind::ClinicalError), 1);
    }

    #[test]
    fn summary_tallies_by_severity() {
        let explain = record(json!({
            "priority": "red",
            "recommended_actions": [{"code": "urgent_referral"}]
        }));
        let report = detect("Mild. Home care. The diagnosis is a cold.", &explain, &json!({}));
        assert_eq!(report.summary, "3 contradiction(s): 2 critical, 1 error");
        assert_eq!(detect("", &explain, &json!({})).summary, "no contradictions");
    }
}
