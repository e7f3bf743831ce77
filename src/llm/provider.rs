// src/llm/provider.rs
//! The external language-model capability, abstracted to the single
//! operation spec §4.5.1 requires, shaped after the teacher's
//! feature-gated model-manager traits (`OllamaManager`/`BedrockManager`)
//! and the wider pack's `LlmProvider` trait (object-safe, async,
//! `Send + Sync` for sharing across concurrent `submit` calls).

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::GenerationError;

/// A single structured-text completion call. Implementations own their
/// own deadline handling internally but must still respect the supplied
/// `deadline` — exceeding it is reported as [`GenerationError::ModelTimeout`].
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Duration,
    ) -> Result<String, GenerationError>;
}
