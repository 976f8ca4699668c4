//! The LLM call interface consumed by the pipeline.
//!
//! The core never talks to a concrete provider. Every stage that needs a
//! model call goes through [`LlmClient`], which implementations wrap around
//! whatever transport they use (OpenAI, Anthropic, a local server, a mock).
//! The client must be safe to invoke concurrently; the pipeline issues many
//! calls against one shared instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Token counts reported by a single LLM call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: usize,
    /// Tokens generated in the completion.
    pub completion_tokens: usize,
    /// Tokens spent on extended thinking, when the provider reports them.
    pub thinking_tokens: Option<usize>,
    /// Tokens served from the provider's prompt cache, when reported.
    pub cached_tokens: Option<usize>,
}

impl TokenUsage {
    /// Create a usage record from prompt and completion counts.
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            ..Default::default()
        }
    }

    /// Total tokens (prompt + completion).
    #[must_use]
    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A structured prompt: a system instruction plus the user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// The system instruction establishing the model's role.
    pub system: String,
    /// The user message carrying the actual request and input text.
    pub user: String,
}

impl Prompt {
    /// Create a prompt from system and user messages.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Sampling parameters forwarded opaquely to the provider.
///
/// Each pipeline stage (analysis, refinement, schema generation, guide,
/// extraction) can carry its own parameters; `None` fields defer to the
/// provider's defaults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling top-p.
    pub top_p: Option<f32>,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
}

impl SamplingParams {
    /// Set the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the nucleus sampling top-p.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Set the output token ceiling.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// An LLM backend capable of structured output.
///
/// `target_schema` is a JSON Schema document describing the shape the caller
/// expects back; implementations are responsible for enforcing it (tool
/// calling, constrained decoding, or post-hoc validation). The returned
/// value is treated as untrusted input by the pipeline and re-validated.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Perform one structured-output call.
    ///
    /// Failures must be classified via [`LlmError`] so the retry policy can
    /// distinguish transient from permanent conditions.
    async fn call(
        &self,
        prompt: &Prompt,
        target_schema: &serde_json::Value,
        params: &SamplingParams,
    ) -> std::result::Result<(serde_json::Value, TokenUsage), LlmError>;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for std::sync::Arc<T> {
    async fn call(
        &self,
        prompt: &Prompt,
        target_schema: &serde_json::Value,
        params: &SamplingParams,
    ) -> std::result::Result<(serde_json::Value, TokenUsage), LlmError> {
        (**self).call(prompt, target_schema, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_sums_prompt_and_completion() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total(), 150);
        assert_eq!(usage.thinking_tokens, None);
    }

    #[test]
    fn sampling_params_builder() {
        let params = SamplingParams::default()
            .with_temperature(0.2)
            .with_max_tokens(1024);
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.top_p, None);
        assert_eq!(params.max_tokens, Some(1024));
    }
}
