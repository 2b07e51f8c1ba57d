//! Compiled phrase tables.
//!
//! Policy wording lives in `[rules]` and is compiled once into
//! Aho-Corasick automatons (ASCII case-insensitive, leftmost-longest, so
//! "not urgent" wins over "urgent"). Matches must sit on word boundaries.
//! Structural patterns (dosages, diagnosis claims, citations) are fixed
//! regexes shared by the validator, detector and scorer.

use crate::clinical::Priority;
use crate::config::RulesConfig;
use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use std::sync::LazyLock;

static DOSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:mg/kg|mg|ml|mcg|µg|g|units?|iu)\b").unwrap()
});

static DIAGNOSIS_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:the\s+diagnosis\s+is|diagnosis\s*:|(?:is|was|has\s+been)\s+diagnosed\s+with|i\s+diagnose|(?:this|it)\s+is\s+(?:a\s+case\s+of|clearly))\b",
    )
    .unwrap()
});

static PRESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i\s+prescribe|prescribe[ds]?|take\s+this\s+(?:medication|medicine)|you\s+should\s+take|administer)\b",
    )
    .unwrap()
});

static CITATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\bet\s+al\.|\bdoi:\s*10\.|\baccording\s+to\s+(?:a\s+)?(?:\d{4}\s+)?(?:study|studies|research|the\s+journal)|\bas\s+(?:published|reported)\s+in\b|\(\s*[A-Z][a-z]+,?\s+\d{4}\s*\))",
    )
    .unwrap()
});

pub fn has_dosage(text: &str) -> bool {
    DOSAGE.is_match(text)
}

pub fn dosage_mentions(text: &str) -> Vec<String> {
    DOSAGE.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

pub fn has_diagnosis_claim(text: &str) -> bool {
    DIAGNOSIS_CLAIM.is_match(text)
}

pub fn has_prescription(text: &str) -> bool {
    PRESCRIPTION.is_match(text)
}

pub fn has_citation(text: &str) -> bool {
    CITATION.is_match(text)
}

/// A phrase found in text (byte offsets into the searched text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseMatch {
    pub phrase: String,
    pub start: usize,
    pub end: usize,
}

/// Case-insensitive phrase set with word-boundary matching.
#[derive(Debug, Clone)]
pub struct PhraseTable {
    phrases: Vec<String>,
    matcher: Option<AhoCorasick>,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let before_ok = start == 0 || !is_word_byte(bytes[start - 1]);
    let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
    before_ok && after_ok
}

impl PhraseTable {
    pub fn new(phrases: &[String]) -> anyhow::Result<Self> {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        let matcher = if phrases.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(&phrases)?,
            )
        };
        Ok(Self { phrases, matcher })
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Non-overlapping matches in order of appearance.
    pub fn find_all(&self, text: &str) -> Vec<PhraseMatch> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };
        matcher
            .find_iter(text)
            .filter(|m| on_word_boundary(text, m.start(), m.end()))
            .map(|m| PhraseMatch {
                phrase: self.phrases[m.pattern().as_usize()].clone(),
                start: m.start(),
                end: m.end(),
            })
            .collect()
    }

    pub fn is_match(&self, text: &str) -> bool {
        !self.find_all(text).is_empty()
    }

    /// Distinct phrases present, in order of first appearance.
    pub fn matched_phrases(&self, text: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for m in self.find_all(text) {
            if !seen.contains(&m.phrase) {
                seen.push(m.phrase);
            }
        }
        seen
    }

    /// Replace every match with `marker`, returning the rewritten text and
    /// the matched phrases (one entry per replacement).
    pub fn replace_all(&self, text: &str, marker: &str) -> (String, Vec<String>) {
        let matches = self.find_all(text);
        if matches.is_empty() {
            return (text.to_string(), Vec::new());
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut replaced = Vec::with_capacity(matches.len());
        for m in matches {
            out.push_str(&text[last..m.start]);
            out.push_str(marker);
            last = m.end;
            replaced.push(m.phrase);
        }
        out.push_str(&text[last..]);
        (out, replaced)
    }
}

/// Red/yellow/green keyword sets compiled into one automaton so that
/// overlapping phrases across tiers resolve by longest match.
#[derive(Debug, Clone)]
pub struct PriorityLexicon {
    table: PhraseTable,
    tiers: Vec<Priority>,
}

impl PriorityLexicon {
    pub fn new(red: &[String], yellow: &[String], green: &[String]) -> anyhow::Result<Self> {
        let mut phrases = Vec::new();
        let mut tiers = Vec::new();
        for (tier, list) in [
            (Priority::Red, red),
            (Priority::Yellow, yellow),
            (Priority::Green, green),
        ] {
            for phrase in list {
                let phrase = phrase.trim().to_ascii_lowercase();
                if phrase.is_empty() || phrases.contains(&phrase) {
                    continue;
                }
                phrases.push(phrase);
                tiers.push(tier);
            }
        }
        Ok(Self {
            table: PhraseTable::new(&phrases)?,
            tiers,
        })
    }

    /// Every keyword match tagged with its tier.
    pub fn matches(&self, text: &str) -> Vec<(Priority, String)> {
        self.table
            .find_all(text)
            .into_iter()
            .filter_map(|m| {
                let index = self.table.phrases.iter().position(|p| *p == m.phrase)?;
                Some((self.tiers[index], m.phrase))
            })
            .collect()
    }

    /// Distinct tiers the text mentions, most severe first.
    pub fn tiers_in(&self, text: &str) -> Vec<Priority> {
        let found = self.matches(text);
        [Priority::Red, Priority::Yellow, Priority::Green]
            .into_iter()
            .filter(|tier| found.iter().any(|(t, _)| t == tier))
            .collect()
    }

    /// Most severe tier the text implies, if any keyword matched.
    pub fn implied_priority(&self, text: &str) -> Option<Priority> {
        self.tiers_in(text).first().copied()
    }
}

/// All configured tables, compiled.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub deny: PhraseTable,
    pub warning: PhraseTable,
    pub absolute: PhraseTable,
    pub missing_data: PhraseTable,
    pub treatment: PhraseTable,
    pub priority: PriorityLexicon,
    pub home_care: PhraseTable,
    pub no_antibiotic: PhraseTable,
    pub no_follow_up: PhraseTable,
    pub deny_marker: String,
}

impl RuleSet {
    pub fn from_config(config: &RulesConfig) -> anyhow::Result<Self> {
        Ok(Self {
            deny: PhraseTable::new(&config.deny_phrases)?,
            warning: PhraseTable::new(&config.warning_phrases)?,
            absolute: PhraseTable::new(&config.absolute_phrases)?,
            missing_data: PhraseTable::new(&config.missing_data_phrases)?,
            treatment: PhraseTable::new(&config.treatment_phrases)?,
            priority: PriorityLexicon::new(
                &config.red_keywords,
                &config.yellow_keywords,
                &config.green_keywords,
            )?,
            home_care: PhraseTable::new(&config.home_care_phrases)?,
            no_antibiotic: PhraseTable::new(&config.no_antibiotic_phrases)?,
            no_follow_up: PhraseTable::new(&config.no_follow_up_phrases)?,
            deny_marker: config.deny_marker.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(items: &[&str]) -> PhraseTable {
        let owned: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        PhraseTable::new(&owned).unwrap()
    }

    fn defaults() -> RuleSet {
        RuleSet::from_config(&RulesConfig::default()).unwrap()
    }

    #[test]
    fn matching_is_case_insensitive() {
        let t = table(&["you must"]);
        assert!(t.is_match("YOU MUST rest"));
        assert!(t.is_match("You Must rest"));
    }

    #[test]
    fn matches_respect_word_boundaries() {
        let t = table(&["possible", "never"]);
        assert!(!t.is_match("that is impossible"));
        assert!(!t.is_match("nevertheless"));
        assert!(t.is_match("possible pneumonia"));
    }

    #[test]
    fn replace_all_counts_each_occurrence() {
        let t = table(&["you must"]);
        let (out, replaced) = t.replace_all("You must go. you must rest.", "[X]");
        assert_eq!(out, "[X] go. [X] rest.");
        assert_eq!(replaced.len(), 2);
    }

    #[test]
    fn empty_table_never_matches() {
        let t = PhraseTable::new(&[]).unwrap();
        assert!(t.is_empty());
        assert!(t.find_all("anything").is_empty());
    }

    #[test]
    fn negated_keyword_beats_bare_keyword() {
        let rules = defaults();
        assert_eq!(
            rules.priority.implied_priority("This is not urgent."),
            Some(Priority::Green)
        );
        assert_eq!(
            rules.priority.implied_priority("The cough is not severe"),
            Some(Priority::Green)
        );
        assert_eq!(
            rules.priority.implied_priority("Needs urgent referral today"),
            Some(Priority::Red)
        );
    }

    #[test]
    fn most_severe_tier_wins() {
        let rules = defaults();
        assert_eq!(
            rules.priority.implied_priority("mild now but an emergency if breathing worsens"),
            Some(Priority::Red)
        );
        assert_eq!(rules.priority.implied_priority("The weather is warm"), None);
    }

    #[test]
    fn mixed_text_reports_every_tier() {
        let rules = defaults();
        assert_eq!(
            rules
                .priority
                .tiers_in("This is a mild case; no emergency transport is needed, manage at home."),
            vec![Priority::Red, Priority::Green]
        );
        assert_eq!(
            rules.priority.tiers_in("Moderate, not an emergency"),
            vec![Priority::Yellow, Priority::Green]
        );
        assert!(rules.priority.tiers_in("The weather is warm").is_empty());
    }

    #[test]
    fn structural_patterns() {
        assert!(has_dosage("give 250 mg twice daily"));
        assert!(has_dosage("5ml syrup"));
        assert!(!has_dosage("for 3 days"));
        assert!(has_diagnosis_claim("The diagnosis is pneumonia"));
        assert!(has_diagnosis_claim("The child was diagnosed with malaria"));
        assert!(!has_diagnosis_claim("The system classified this as pneumonia"));
        assert!(has_prescription("I prescribe amoxicillin"));
        assert!(has_citation("Smith et al. showed"));
        assert!(has_citation("according to a 2019 study"));
        assert!(!has_citation("according to the triage system"));
    }
}
