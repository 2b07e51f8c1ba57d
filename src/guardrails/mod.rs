//! Guardrails around the model: the prompt going in, the text coming out,
//! and the configurable phrase tables both sides use.

pub mod output;
pub mod prompt;
pub mod rules;

pub use output::{OutputValidator, ValidationResult};
pub use prompt::{GuardedPrompt, GuardrailContext, PromptGuardrailBuilder, PromptSection};
pub use rules::{PhraseTable, PriorityLexicon, RuleSet};
