//! Opaque text generation
//!
//! The engine only needs "prompt in, text out". Decomposition prompts are
//! built by [`crate::decomposer::LlmDecomposer`]; this module is the transport.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai_generic;

pub use openai_generic::GenericOpenAiClient;

use crate::config::LlmConfig;

/// Token usage reported by the backend, when available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_prompt: Option<&str>, prompt: &str) -> Result<Completion>;
}

/// Build the configured text generator
pub fn create_generator(config: &LlmConfig) -> Result<GenericOpenAiClient> {
    if config.model.trim().is_empty() {
        anyhow::bail!("No model configured under [llm]");
    }
    let api_key = config
        .api_key
        .clone()
        .or_else(|| std::env::var("PLANWRIGHT_API_KEY").ok());
    Ok(GenericOpenAiClient::new(
        config.base_url.clone(),
        config.model.clone(),
        config.max_tokens,
        api_key,
    )
    .with_timeout(std::time::Duration::from_secs(config.request_timeout_secs)))
}
