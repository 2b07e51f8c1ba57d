//! Language-model providers.
//!
//! The gateway treats the model as an opaque text-completion service.
//! Implementations return `anyhow::Result`; failures are categorised later
//! by the error handler.

pub mod ollama;

pub use ollama::OllamaProvider;

use crate::config::ProviderConfig;
use crate::errors::GatewayError;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
}

/// Incremental text fragments from a streaming completion.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Dropping the returned stream stops consuming the provider response.
    async fn stream(&self, request: &CompletionRequest) -> Result<TokenStream>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Build the provider named by `[provider] kind`.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn AiProvider>> {
    match config.kind.trim().to_ascii_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::from_config(config))),
        other => Err(GatewayError::Configuration(format!(
            "unknown provider kind '{other}'. Supported: ollama"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_ollama() {
        let provider = create_provider(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn factory_rejects_unknown_kind() {
        let config = ProviderConfig {
            kind: "mystery".into(),
            ..ProviderConfig::default()
        };
        let Err(err) = create_provider(&config) else {
            panic!("unknown provider kind accepted");
        };
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Configuration(_))
        ));
    }
}
