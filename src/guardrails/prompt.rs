//! Guarded prompt assembly.
//!
//! A prompt is a list of [`PromptSection`]s rendered in order. The safety
//! constraint block always comes first, and the task's word and token
//! limits travel with the prompt so the output validator can enforce the
//! same word limit the model was given.

use crate::clinical::ExplainabilityRecord;
use crate::config::TaskPolicy;
use anyhow::Result;
use serde_json::Value;
use std::fmt::Write;

/// Rendered context is capped so one request cannot crowd out the
/// constraint block.
const CONTEXT_MAX_CHARS: usize = 6_000;

pub struct GuardrailContext<'a> {
    pub task: &'a str,
    pub policy: &'a TaskPolicy,
    /// Sanitized request context.
    pub context: &'a Value,
    pub default_temperature: f64,
}

/// Final prompt plus the generation limits mirrored into the provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedPrompt {
    pub text: String,
    pub max_tokens: u32,
    pub max_words: u32,
    pub temperature: f64,
}

pub trait PromptSection: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, ctx: &GuardrailContext<'_>) -> Result<String>;
}

pub struct PromptGuardrailBuilder {
    sections: Vec<Box<dyn PromptSection>>,
}

impl Default for PromptGuardrailBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PromptGuardrailBuilder {
    /// The constraint block is always the first section.
    pub fn with_defaults() -> Self {
        Self {
            sections: vec![
                Box::new(SafetyConstraintsSection),
                Box::new(TaskInstructionSection),
                Box::new(TriageSection),
                Box::new(PatientContextSection),
                Box::new(OutputLimitSection),
            ],
        }
    }

    /// Extra sections go after the defaults, never ahead of the constraints.
    pub fn add_section(mut self, section: Box<dyn PromptSection>) -> Self {
        self.sections.push(section);
        self
    }

    pub fn section_names(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.name()).collect()
    }

    pub fn build(&self, ctx: &GuardrailContext<'_>) -> Result<GuardedPrompt> {
        let mut output = String::new();
        for section in &self.sections {
            let part = section.build(ctx)?;
            if part.trim().is_empty() {
                continue;
            }
            output.push_str(part.trim_end());
            output.push_str("\n\n");
        }
        Ok(GuardedPrompt {
            text: output.trim_end().to_string(),
            max_tokens: ctx.policy.max_tokens,
            max_words: ctx.policy.max_words,
            temperature: ctx.policy.temperature.unwrap_or(ctx.default_temperature),
        })
    }
}

pub struct SafetyConstraintsSection;
pub struct TaskInstructionSection;
pub struct TriageSection;
pub struct PatientContextSection;
pub struct OutputLimitSection;

impl PromptSection for SafetyConstraintsSection {
    fn name(&self) -> &str {
        "safety_constraints"
    }

    fn build(&self, _ctx: &GuardrailContext<'_>) -> Result<String> {
        Ok("## Non-negotiable constraints\n\n\
            You are an advisory assistant for health workers. You are NOT allowed to:\n\
            - diagnose any condition;\n\
            - prescribe, recommend or name medications;\n\
            - give doses, quantities or dosing schedules;\n\
            - override, question or change the triage priority or recommended actions \
            computed by the triage system.\n\
            If information needed to answer is missing, say that you are unable to determine \
            it from the recorded data. The triage system's result is final."
            .into())
    }
}

impl PromptSection for TaskInstructionSection {
    fn name(&self) -> &str {
        "task"
    }

    fn build(&self, ctx: &GuardrailContext<'_>) -> Result<String> {
        Ok(format!("## Task: {}\n\n{}", ctx.task, ctx.policy.instruction.trim()))
    }
}

impl PromptSection for TriageSection {
    fn name(&self) -> &str {
        "triage"
    }

    fn build(&self, ctx: &GuardrailContext<'_>) -> Result<String> {
        let Some(record) = ExplainabilityRecord::from_context(ctx.context) else {
            return Ok(String::new());
        };
        let mut out = String::from("## Triage system result\n\n");
        let _ = writeln!(out, "Priority: {}", record.priority().label());
        if !record.triggers.is_empty() {
            out.push_str("Triggers:\n");
            for trigger in &record.triggers {
                let value = match &trigger.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if trigger.clinical_meaning.is_empty() {
                    let _ = writeln!(out, "- {}: {}", trigger.field_id, value);
                } else {
                    let _ = writeln!(
                        out,
                        "- {}: {} ({})",
                        trigger.field_id, value, trigger.clinical_meaning
                    );
                }
            }
        }
        if !record.recommended_actions.is_empty() {
            out.push_str("Recommended actions:\n");
            for action in &record.recommended_actions {
                if action.justification.is_empty() {
                    let _ = writeln!(out, "- {}", action.code);
                } else {
                    let _ = writeln!(out, "- {}: {}", action.code, action.justification);
                }
            }
        }
        Ok(out)
    }
}

impl PromptSection for PatientContextSection {
    fn name(&self) -> &str {
        "patient_context"
    }

    fn build(&self, ctx: &GuardrailContext<'_>) -> Result<String> {
        let Value::Object(map) = ctx.context else {
            return Ok(String::new());
        };
        let mut out = String::from("## Recorded data\n\n");
        let mut wrote = false;
        let mut keys: Vec<&String> = map.keys().filter(|k| *k != "explainability").collect();
        keys.sort();
        for key in keys {
            let value = match &map[key] {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other)?,
            };
            let _ = writeln!(out, "- {key}: {value}");
            wrote = true;
        }
        if !wrote {
            return Ok(String::new());
        }
        if out.chars().count() > CONTEXT_MAX_CHARS {
            out = out.chars().take(CONTEXT_MAX_CHARS).collect();
            out.push_str("\n[context truncated]");
        }
        Ok(out)
    }
}

impl PromptSection for OutputLimitSection {
    fn name(&self) -> &str {
        "output_limit"
    }

    fn build(&self, ctx: &GuardrailContext<'_>) -> Result<String> {
        Ok(format!(
            "## Response format\n\nAnswer in at most {} words of plain text.",
            ctx.policy.max_words
        ))
    }
}
