//! Additive risk scoring.
//!
//! Each signal is a yes/no fact about one response; the score is the sum
//! of configured weights for the signals present. Tiering (for badges) and
//! the block/warn gates use separate thresholds and are tuned
//! independently. A response blocks only when its total exceeds
//! `block_threshold`; it warns from `warn_threshold` upward.

use super::{Contradiction, ContradictionKind, ContradictionSeverity};
use crate::config::{RiskConfig, RiskWeights};
use crate::guardrails::rules::{self, RuleSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }
}

/// Facts that contribute to the score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSignals {
    /// Any contradiction with the rule engine other than a scope violation.
    pub rule_conflict: bool,
    pub critical_conflict: bool,
    pub dosage: bool,
    pub diagnosis_claim: bool,
    pub absolute_language: bool,
    pub missing_data: bool,
    pub treatment_recommendation: bool,
    /// Prompt-injection pattern found in the request.
    pub injection_attempt: bool,
    /// The rule engine's explainability record was present but unreadable.
    pub malformed_explainability: bool,
}

impl RiskSignals {
    fn weighted(&self, weights: &RiskWeights) -> [(&'static str, bool, u32); 9] {
        [
            ("rule_conflict", self.rule_conflict, weights.rule_conflict),
            ("critical_conflict", self.critical_conflict, weights.critical_conflict),
            ("dosage", self.dosage, weights.dosage),
            ("diagnosis_claim", self.diagnosis_claim, weights.diagnosis_claim),
            ("absolute_language", self.absolute_language, weights.absolute_language),
            ("missing_data", self.missing_data, weights.missing_data),
            (
                "treatment_recommendation",
                self.treatment_recommendation,
                weights.treatment_recommendation,
            ),
            ("injection_attempt", self.injection_attempt, weights.injection_attempt),
            (
                "malformed_explainability",
                self.malformed_explainability,
                weights.malformed_explainability,
            ),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScore {
    pub total: u32,
    /// Contributing signal name to weight; absent signals are omitted.
    pub breakdown: BTreeMap<String, u32>,
    pub level: RiskLevel,
    pub should_block: bool,
    pub should_warn: bool,
}

pub struct ScoreInput<'a> {
    /// Raw model output.
    pub output: &'a str,
    pub contradictions: &'a [Contradiction],
    pub injection_detected: bool,
    pub explainability_malformed: bool,
}

pub struct RiskScorer {
    rules: Arc<RuleSet>,
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(rules: Arc<RuleSet>, config: RiskConfig) -> Self {
        Self { rules, config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn signals(&self, input: &ScoreInput<'_>) -> RiskSignals {
        let text = input.output;
        RiskSignals {
            rule_conflict: input
                .contradictions
                .iter()
                .any(|c| c.kind != ContradictionKind::ScopeViolation),
            critical_conflict: input
                .contradictions
                .iter()
                .any(|c| c.severity == ContradictionSeverity::Critical),
            dosage: rules::has_dosage(text),
            diagnosis_claim: rules::has_diagnosis_claim(text),
            absolute_language: self.rules.absolute.is_match(text),
            missing_data: self.rules.missing_data.is_match(text),
            treatment_recommendation: self.rules.treatment.is_match(text),
            injection_attempt: input.injection_detected,
            malformed_explainability: input.explainability_malformed,
        }
    }

    pub fn score(&self, input: &ScoreInput<'_>) -> RiskScore {
        self.score_signals(&self.signals(input))
    }

    pub fn score_signals(&self, signals: &RiskSignals) -> RiskScore {
        let mut breakdown = BTreeMap::new();
        let mut total = 0u32;
        for (name, present, weight) in signals.weighted(&self.config.weights) {
            if present && weight > 0 {
                breakdown.insert(name.to_string(), weight);
                total = total.saturating_add(weight);
            }
        }
        RiskScore {
            total,
            breakdown,
            level: self.level_for(total),
            should_block: total > self.config.block_threshold,
            should_warn: total >= self.config.warn_threshold,
        }
    }

    pub fn level_for(&self, total: u32) -> RiskLevel {
        if total >= self.config.red_min {
            RiskLevel::Red
        } else if total >= self.config.yellow_min {
            RiskLevel::Yellow
        } else {
            RiskLevel::Green
        }
    }
}
