//! Client for any server implementing the OpenAI chat completions API
//! (OpenAI, vLLM, LiteLLM, LM Studio, Ollama in compatibility mode, ...)

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Completion, TextGenerator, TokenUsage};

pub struct GenericOpenAiClient {
    /// Some self-hosted servers don't require auth
    api_key: Option<String>,
    model: String,
    max_tokens: usize,
    /// e.g. "http://localhost:8000/v1", without trailing slash
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl GenericOpenAiClient {
    pub fn new(base_url: String, model: String, max_tokens: usize, api_key: Option<String>) -> Self {
        Self {
            api_key,
            model,
            max_tokens,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Self::http_client(Duration::from_secs(120)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Self::http_client(timeout);
        self
    }

    fn http_client(timeout: Duration) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

#[async_trait]
impl TextGenerator for GenericOpenAiClient {
    async fn generate(&self, system_prompt: Option<&str>, prompt: &str) -> Result<Completion> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(self.max_tokens),
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send request to OpenAI-compatible API at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            anyhow::bail!("OpenAI-compatible API error ({}): {}", status, error_text);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI-compatible API response")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI-compatible API"))?
            .message
            .content
            .unwrap_or_default();

        let usage = parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });
        if let Some(u) = usage {
            tracing::debug!("Text generation used {} tokens", u.total());
        }

        Ok(Completion { text, usage })
    }
}
