//! Chat completion clients.
//!
//! [`ChatModel`] is the seam the query pipeline calls through; the
//! concrete [`OpenAiChat`] speaks the OpenAI or Azure OpenAI chat
//! completions API, and [`DisabledChat`] refuses every request.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ChatConfig;
use crate::http::{self, ApiEndpoint, ApiFlavor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Return the assistant's reply to `messages`.
    async fn complete(&self, messages: &[ChatMessage], options: CompletionOptions) -> Result<String>;
}

pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _messages: &[ChatMessage], _options: CompletionOptions) -> Result<String> {
        bail!("Chat provider is disabled")
    }
}

pub struct OpenAiChat {
    model: String,
    endpoint: ApiEndpoint,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let flavor = ApiFlavor::from_provider(&config.provider)
            .ok_or_else(|| anyhow::anyhow!("Unknown chat provider: {}", config.provider))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("chat.model required for {} provider", config.provider))?;
        Ok(Self {
            model,
            endpoint: ApiEndpoint::new(flavor, config.url.as_deref(), &config.api_version)?,
            client: http::client(config.timeout())?,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], options: CompletionOptions) -> Result<String> {
        let url = self.endpoint.operation_url(&self.model, "chat/completions");
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });

        let response = http::send_with_retry("Chat", self.max_retries, || {
            self.endpoint
                .authorize(self.client.post(&url))
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))
}

pub fn create_chat(config: &ChatConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChat)),
        "openai" | "azure" => Ok(Arc::new(OpenAiChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice() {
        let json = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "42"}}]
        });
        assert_eq!(parse_completion(&json).unwrap(), "42");
    }

    #[test]
    fn missing_content_is_an_error() {
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn disabled_chat_refuses() {
        let opts = CompletionOptions {
            temperature: 0.0,
            max_tokens: 16,
        };
        assert!(DisabledChat
            .complete(&[ChatMessage::user("hi")], opts)
            .await
            .is_err());
    }

    #[test]
    fn messages_serialize_in_api_shape() {
        let v = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(v, serde_json::json!({"role": "system", "content": "be brief"}));
    }
}
