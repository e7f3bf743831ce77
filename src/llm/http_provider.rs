// src/llm/http_provider.rs
//! Concrete `PlanGenerator` behind the `http-provider` feature, mirroring
//! the teacher's feature-gated `OllamaManager`/`BedrockManager` pattern:
//! the core depends only on the `PlanGenerator` trait, and this adapter
//! is the one vendor-facing implementation, reachable only when the
//! feature is enabled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelConfig;
use crate::errors::GenerationError;

use super::provider::PlanGenerator;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// POSTs an OpenAI-chat-completions-shaped request to a configured
/// endpoint and returns the first choice's message content verbatim — the
/// recovery pipeline in `generator.rs` is responsible for everything after
/// that, including malformed/noisy output.
pub struct HttpPlanGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model_name: String,
}

impl HttpPlanGenerator {
    pub fn new(config: &ModelConfig) -> Self {
        HttpPlanGenerator {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model_name: config.model_name.clone(),
        }
    }
}

#[async_trait]
impl PlanGenerator for HttpPlanGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body).timeout(deadline);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            debug!("model HTTP call failed: {e}");
            if e.is_timeout() {
                GenerationError::ModelTimeout
            } else {
                GenerationError::ParseFailure {
                    position: 0,
                    context: e.to_string(),
                }
            }
        })?;

        let parsed: ChatResponse = response.json().await.map_err(|e| GenerationError::ParseFailure {
            position: 0,
            context: e.to_string(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::ModelRefusal {
                explanation: "model returned no choices".to_string(),
            })
    }
}
