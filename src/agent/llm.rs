// src/agent/llm.rs
//! LLM collaborator contract
//!
//! The core only sees `complete(model, messages, options)` and the token
//! counts that come back. [`HttpLlmClient`] speaks the OpenAI-compatible
//! `POST {endpoint}/v1/chat/completions` shape.

use crate::utils::config::AgentConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub top_p: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: Some(768),
            top_p: 0.9,
        }
    }
}

/// Text plus token accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion>;

    /// Human-readable provider description
    fn description(&self) -> String;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible HTTP client
pub struct HttpLlmClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("llm client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.llm_endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = ChatCompletionRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
        };

        debug!(model, messages = messages.len(), "calling llm endpoint");

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::ExecutionFailed(format!("llm request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(EngineError::ExecutionFailed(format!(
                "llm returned {}: {}",
                status, text
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ExecutionFailed(format!("invalid llm response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                estimate_tokens(messages.iter().map(|m| m.content.len()).sum()),
                estimate_tokens(text.len()),
            ),
        };

        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn description(&self) -> String {
        format!("openai-compatible ({})", self.endpoint)
    }
}

/// Rough token count for a byte length (4 bytes per token)
pub fn estimate_tokens(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_client_is_object_safe() {
        fn _assert_object_safe(_: &dyn LlmClient) {}
    }

    #[test]
    fn test_request_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let body = ChatCompletionRequest {
            model: "m",
            messages: &messages,
            temperature: 0.2,
            max_tokens: None,
            top_p: 0.9,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_response_without_usage_parses() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#,
        )
        .unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content, "ok");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
    }
}
