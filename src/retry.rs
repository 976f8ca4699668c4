//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use crate::error::{LlmError, LlmErrorKind};
use crate::llm::{LlmClient, Prompt, SamplingParams, TokenUsage};

/// Backoff and retry configuration for transient LLM failures.
///
/// Attempt 1 is always immediate. After a retryable failure on attempt `n`,
/// the executor sleeps `min(min_wait * 2^(n-1), max_wait)` seconds, adjusted
/// by up to ±10% jitter, and tries again. At most `max_retries` additional
/// attempts are made; `max_retries = 0` disables retry entirely.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use llm_extract::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, 1.0, 10.0);
/// assert_eq!(policy.base_delay(1), Duration::from_secs_f64(1.0));
/// assert_eq!(policy.base_delay(4), Duration::from_secs_f64(8.0));
/// assert_eq!(policy.base_delay(5), Duration::from_secs_f64(10.0)); // capped
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Minimum backoff in seconds (the first delay).
    pub min_wait: f64,
    /// Cap on the backoff in seconds.
    pub max_wait: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_wait: 1.0,
            max_wait: 10.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from its three parameters.
    pub fn new(max_retries: u32, min_wait: f64, max_wait: f64) -> Self {
        Self {
            max_retries,
            min_wait,
            max_wait,
        }
    }

    /// Whether a failure of `kind` on attempt `attempt` (1-based) warrants
    /// another try.
    #[must_use]
    pub fn should_retry(&self, kind: LlmErrorKind, attempt: u32) -> bool {
        kind.is_retryable() && attempt <= self.max_retries
    }

    /// The backoff before jitter for the given failed attempt (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(52);
        let secs = (self.min_wait * 2f64.powi(exp as i32)).min(self.max_wait);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// The backoff with ±10% jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = 1.0 + (fastrand::f64() * 0.2 - 0.1);
        Duration::from_secs_f64((base * jitter).max(0.0))
    }

    /// Run one structured LLM call under this policy.
    ///
    /// Returns the final result together with the number of attempts made.
    /// Non-retryable failures return after the first attempt regardless of
    /// `max_retries`.
    pub async fn run_call<C: LlmClient + ?Sized>(
        &self,
        client: &C,
        prompt: &Prompt,
        target_schema: &serde_json::Value,
        params: &SamplingParams,
    ) -> (std::result::Result<(serde_json::Value, TokenUsage), LlmError>, u32) {
        let mut attempt: u32 = 1;
        loop {
            match client.call(prompt, target_schema, params).await {
                Ok(ok) => return (Ok(ok), attempt),
                Err(err) => {
                    if !self.should_retry(err.kind, attempt) {
                        return (Err(err), attempt);
                    }
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        attempt,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "retryable LLM failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_doubles_then_caps() {
        let policy = RetryPolicy::new(5, 1.0, 10.0);
        let delays: Vec<f64> = (1..=6)
            .map(|n| policy.base_delay(n).as_secs_f64())
            .collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0, 10.0, 10.0]);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::new(3, 1.0, 10.0);
        for attempt in 1..=6 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let jittered = policy.delay(attempt).as_secs_f64();
                assert!(jittered >= base * 0.9 - 1e-9, "attempt {attempt}: {jittered} < {}", base * 0.9);
                assert!(jittered <= base * 1.1 + 1e-9, "attempt {attempt}: {jittered} > {}", base * 1.1);
            }
        }
    }

    #[test]
    fn zero_retries_never_retries() {
        let policy = RetryPolicy::new(0, 1.0, 10.0);
        assert!(!policy.should_retry(LlmErrorKind::RateLimited, 1));
    }

    #[test]
    fn non_retryable_kinds_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(LlmErrorKind::Authentication, 1));
        assert!(policy.should_retry(LlmErrorKind::Timeout, 3));
        assert!(!policy.should_retry(LlmErrorKind::Timeout, 4));
    }
}
