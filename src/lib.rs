//! Advisory-only safety and governance gateway between clinical UIs and a
//! local language model.
//!
//! Every request passes through [`orchestrator::SafetyOrchestrator`]:
//! input sanitisation, rate limiting, response caching, prompt
//! guardrails, output validation, contradiction detection against the
//! triage rule engine, risk scoring, and an audit record per request.

pub mod audit;
pub mod cache;
pub mod clinical;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod guardrails;
pub mod orchestrator;
pub mod providers;
pub mod security;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use orchestrator::{AiRequest, AiResponse, SafetyOrchestrator};
