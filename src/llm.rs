use crate::config::{ApiType, LlmSettings};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Single request/response language-model backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn ask(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Chat-completions client for OpenAI, Azure OpenAI and Ollama endpoints
#[derive(Clone)]
pub struct LlmClient {
    settings: LlmSettings,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                AgentError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match self.settings.api_type {
            ApiType::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base,
                self.settings.model,
                self.settings.api_version.as_deref().unwrap_or("2024-02-01")
            ),
            ApiType::Openai | ApiType::Ollama => format!("{}/chat/completions", base),
        }
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
        });

        if uses_completion_tokens(&self.settings.model) {
            body["max_completion_tokens"] = serde_json::json!(self.settings.max_tokens);
        } else {
            body["max_tokens"] = serde_json::json!(self.settings.max_tokens);
        }
        body
    }
}

/// Reasoning models (gpt-5, o1, o3, ...) only accept `max_completion_tokens`
fn uses_completion_tokens(model: &str) -> bool {
    let name = model.rsplit('/').next().unwrap_or(model);
    if name.starts_with("gpt-5") {
        return true;
    }
    let mut chars = name.chars();
    chars.next() == Some('o') && chars.next().map_or(false, |c| c.is_ascii_digit())
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn ask(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&self.request_body(messages));

        request = match self.settings.api_type {
            ApiType::Azure => request.header("api-key", &self.settings.api_key),
            ApiType::Ollama if self.settings.api_key.is_empty() => request,
            ApiType::Openai | ApiType::Ollama => {
                request.header("Authorization", format!("Bearer {}", self.settings.api_key))
            }
        };

        debug!(model = %self.settings.model, "Sending chat completion request");
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Synthesis(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Synthesis(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Synthesis(format!("Failed to parse LLM response: {}", e)))?;

        parse_completion(&response_json)
    }
}

/// Pull the first choice's content out of a chat-completions response
pub fn parse_completion(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(AgentError::Synthesis(format!("LLM API error: {}", error)));
    }

    let choices = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| {
            AgentError::Synthesis(format!("No choices array in LLM response: {}", response_json))
        })?;

    let first = choices
        .first()
        .ok_or_else(|| AgentError::Synthesis("Empty choices array in LLM response".to_string()))?;

    match first.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(AgentError::Synthesis(
                "LLM response was filtered by content policy".to_string(),
            ));
        }
        _ => {}
    }

    let content = first["message"]["content"]
        .as_str()
        .ok_or_else(|| {
            AgentError::Synthesis(format!("No content in LLM response: {}", response_json))
        })?;

    if content.trim().is_empty() {
        return Err(AgentError::Synthesis("Empty content in LLM response".to_string()));
    }

    Ok(content.to_string())
}
