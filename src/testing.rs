//! Testing utilities: a scripted mock LLM client.
//!
//! Useful for exercising the pipeline without network calls. The mock
//! serves responses three ways, in precedence order: a FIFO script queue
//! (exact per-call control, used for retry sequences), substring matchers
//! against the prompt (used to route full-pipeline calls to stage-specific
//! responses), and a default response.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LlmError, LlmErrorKind};
use crate::llm::{LlmClient, Prompt, SamplingParams, TokenUsage};

type CallResult = std::result::Result<Value, LlmError>;

/// Record of one call made against the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// The system message of the call.
    pub system: String,
    /// The user message of the call.
    pub user: String,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<CallResult>,
    matchers: Vec<(String, CallResult)>,
    default_response: Option<Value>,
    calls: Vec<MockCall>,
    in_flight: usize,
    max_in_flight: usize,
}

/// A deterministic, configurable LLM client for tests.
///
/// Cloning shares all state, so one mock can be handed to the pipeline and
/// inspected afterwards.
///
/// # Example
///
/// ```rust
/// use llm_extract::testing::MockLlm;
/// use llm_extract::{LlmClient, Prompt, SamplingParams};
/// use serde_json::json;
///
/// let mock = MockLlm::new().with_default_response(json!({"ok": true}));
/// let (value, usage) = tokio_test::block_on(mock.call(
///     &Prompt::new("system", "user"),
///     &json!({}),
///     &SamplingParams::default(),
/// ))
/// .unwrap();
/// assert_eq!(value, json!({"ok": true}));
/// assert_eq!(usage.total(), 15);
/// assert_eq!(mock.call_count(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MockLlm {
    state: Arc<Mutex<MockState>>,
    usage: TokenUsage,
    max_jitter: Duration,
}

impl MockLlm {
    /// Create a mock with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self {
            usage: TokenUsage::new(10, 5),
            ..Default::default()
        }
    }

    /// Queue a successful response (FIFO, highest precedence).
    #[must_use]
    pub fn with_response(self, value: Value) -> Self {
        self.state.lock().unwrap().script.push_back(Ok(value));
        self
    }

    /// Queue a failure (FIFO, highest precedence).
    #[must_use]
    pub fn with_failure(self, error: LlmError) -> Self {
        self.state.lock().unwrap().script.push_back(Err(error));
        self
    }

    /// Respond with `value` whenever the prompt contains `key`.
    #[must_use]
    pub fn with_response_for(self, key: impl Into<String>, value: Value) -> Self {
        self.state
            .lock()
            .unwrap()
            .matchers
            .push((key.into(), Ok(value)));
        self
    }

    /// Fail whenever the prompt contains `key`.
    #[must_use]
    pub fn with_failure_for(self, key: impl Into<String>, error: LlmError) -> Self {
        self.state
            .lock()
            .unwrap()
            .matchers
            .push((key.into(), Err(error)));
        self
    }

    /// Respond with `value` when nothing else matches.
    #[must_use]
    pub fn with_default_response(self, value: Value) -> Self {
        self.state.lock().unwrap().default_response = Some(value);
        self
    }

    /// Report this usage on every successful call.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Sleep a random duration up to `max` on every call, scrambling
    /// completion order across concurrent calls.
    #[must_use]
    pub fn with_jittered_latency(mut self, max: Duration) -> Self {
        self.max_jitter = max;
        self
    }

    /// All calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// The highest number of calls that were in flight at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn next_result(&self, prompt: &Prompt) -> CallResult {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
        });
        if let Some(scripted) = state.script.pop_front() {
            return scripted;
        }
        for (key, result) in &state.matchers {
            if prompt.system.contains(key.as_str()) || prompt.user.contains(key.as_str()) {
                return result.clone();
            }
        }
        if let Some(default) = &state.default_response {
            return Ok(default.clone());
        }
        Err(LlmError::new(
            LlmErrorKind::InvalidResponse,
            "mock has no scripted response for this prompt",
        ))
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn call(
        &self,
        prompt: &Prompt,
        _target_schema: &Value,
        _params: &SamplingParams,
    ) -> std::result::Result<(Value, TokenUsage), LlmError> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if !self.max_jitter.is_zero() {
            let nanos = self.max_jitter.as_nanos() as u64;
            tokio::time::sleep(Duration::from_nanos(fastrand::u64(0..=nanos))).await;
        }
        let result = self.next_result(prompt);
        self.state.lock().unwrap().in_flight -= 1;
        result.map(|value| (value, self.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn script_takes_precedence_over_matchers() {
        let mock = MockLlm::new()
            .with_response(json!(1))
            .with_response_for("anything", json!(2));
        let prompt = Prompt::new("anything", "anything");
        let schema = json!({});
        let params = SamplingParams::default();

        let (first, _) = mock.call(&prompt, &schema, &params).await.unwrap();
        assert_eq!(first, json!(1));
        let (second, _) = mock.call(&prompt, &schema, &params).await.unwrap();
        assert_eq!(second, json!(2));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn unmatched_prompt_is_an_error() {
        let mock = MockLlm::new();
        let err = mock
            .call(&Prompt::new("s", "u"), &json!({}), &SamplingParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::InvalidResponse);
    }
}
