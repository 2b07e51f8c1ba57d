//! Output validation: redact directive language, flag hedging and likely
//! hallucination, cut the text at the task's word limit, then frame it as
//! decision support.

use super::rules::{self, RuleSet};
use serde::Serialize;
use std::sync::Arc;

pub const SAFETY_HEADER: &str = "AI decision support (advisory only)";

/// Appended where text was cut at the word limit.
pub const TRUNCATION_MARKER: &str = "[truncated at word limit]";

pub const SAFETY_FOOTER: &str = "This text was generated by an AI assistant to support, not \
replace, clinical judgement. Verify it with qualified staff and follow the triage system's \
priority and recommended actions.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// False when any deny phrase was redacted.
    pub valid: bool,
    /// Redacted and framed text, ready to deliver.
    pub output: String,
    pub warnings: Vec<String>,
    /// Deny phrases removed, one entry per occurrence.
    pub blocked: Vec<String>,
    /// Advisory hallucination flags; never affect `valid`.
    pub hallucination_flags: Vec<String>,
    /// Output was cut at the word limit.
    pub truncated: bool,
}

impl ValidationResult {
    pub fn was_modified(&self) -> bool {
        !self.blocked.is_empty() || self.truncated
    }
}

pub struct OutputValidator {
    rules: Arc<RuleSet>,
}

impl OutputValidator {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn validate(&self, text: &str, task: &str) -> ValidationResult {
        self.validate_limited(text, task, 0)
    }

    /// Like [`Self::validate`], cutting the delivered text after
    /// `max_words` words. Zero means no limit.
    pub fn validate_limited(&self, text: &str, task: &str, max_words: u32) -> ValidationResult {
        let (redacted, blocked) = self.rules.deny.replace_all(text, &self.rules.deny_marker);

        let mut warnings: Vec<String> = self
            .rules
            .warning
            .matched_phrases(text)
            .into_iter()
            .map(|phrase| format!("Hedging language: \"{phrase}\""))
            .collect();

        let hallucination_flags = hallucination_flags(&self.rules, text);

        if !blocked.is_empty() {
            tracing::warn!(task, removed = blocked.len(), "Directive language redacted from model output");
        }

        let (body, truncated) = match truncate_words(&redacted, max_words) {
            Some(cut) => {
                tracing::warn!(task, max_words, "Model output cut at word limit");
                warnings.push(format!("Response exceeded {max_words} words and was truncated"));
                (format!("{cut} {TRUNCATION_MARKER}"), true)
            }
            None => (redacted, false),
        };

        ValidationResult {
            valid: blocked.is_empty(),
            output: frame(&body),
            warnings,
            blocked,
            hallucination_flags,
            truncated,
        }
    }
}

/// Prefix holding the first `max_words` words, when the text is longer.
fn truncate_words(text: &str, max_words: u32) -> Option<&str> {
    if max_words == 0 {
        return None;
    }
    let limit = usize::try_from(max_words).unwrap_or(usize::MAX);
    let mut words = 0usize;
    let mut in_word = false;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > limit {
                return Some(text[..index].trim_end());
            }
        }
    }
    None
}

/// Wrap deliverable text in the fixed safety framing.
pub fn frame(body: &str) -> String {
    format!("{SAFETY_HEADER}\n\n{}\n\n{SAFETY_FOOTER}", body.trim())
}

fn hallucination_flags(rules: &RuleSet, text: &str) -> Vec<String> {
    let mut flags = Vec::new();
    for phrase in rules.absolute.matched_phrases(text) {
        flags.push(format!("overconfident: {phrase}"));
    }
    for dose in rules::dosage_mentions(text) {
        flags.push(format!("dosage: {dose}"));
    }
    if rules::has_citation(text) {
        flags.push("citation: unverifiable source reference".to_string());
    }
    flags
}
