//! Chat completion client.
//!
//! Agents speak to the LLM through the narrow [`ChatClient`] contract: one
//! prompt in, one string out, labeled for logging. The HTTP implementation
//! targets an OpenAI-compatible chat endpoint and flows through the shared
//! resilience policy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::{AnalysisConfig, ResilienceConfig};
use crate::core::errors::{ArchrevError, Result};
use crate::resilience::OutboundPolicy;

/// External chat LLM behind a narrow interface.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Complete a prompt; `label` names the call site for logging.
    async fn complete(&self, prompt: &str, label: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// OpenAI-compatible HTTP chat client.
pub struct HttpChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    policy: OutboundPolicy,
}

impl HttpChatClient {
    /// Create a client over the configured endpoint.
    pub fn new(config: &AnalysisConfig, resilience: &ResilienceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.chat_endpoint.clone(),
            api_key: config.chat_api_key.clone(),
            model: config.chat_model.clone(),
            policy: OutboundPolicy::new(
                "Chat",
                resilience,
                Duration::from_secs(resilience.chat_timeout_seconds),
            ),
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, prompt: &str, label: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.2,
        };

        let content = self
            .policy
            .execute(|| async {
                let mut builder = self.client.post(&self.endpoint).json(&request);
                if let Some(key) = &self.api_key {
                    builder = builder.bearer_auth(key);
                }
                let response = builder.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ArchrevError::from_http_status("Chat", status.as_u16(), body));
                }

                let parsed: ChatResponse = response.json().await?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.message.content)
                    .ok_or_else(|| ArchrevError::internal("chat response carried no choices"))
            })
            .await?;

        debug!(label, length = content.len(), "chat completion received");
        Ok(content)
    }
}
