//! Per-unit extraction execution.
//!
//! One [`ExtractionExecutor::execute`] call turns one [`ExtractionUnit`]
//! into exactly one [`ExtractionOutcome`]. Transport failures are retried
//! under the configured [`RetryPolicy`]; whatever remains after exhaustion
//! is demoted to a `Failure` outcome and never aborts the batch.

use serde_json::{json, Value};

use crate::guide::FieldGuide;
use crate::llm::{LlmClient, SamplingParams};
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::schema::RecordType;
use crate::unit::{ExtractionOutcome, ExtractionUnit};
use crate::usage::{UsageTracker, STEP_EXTRACTION};

/// Runs one retried, validated extraction call per unit.
pub struct ExtractionExecutor<C> {
    client: C,
    policy: RetryPolicy,
    params: SamplingParams,
}

impl<C: LlmClient> ExtractionExecutor<C> {
    /// Create an executor over the given client.
    pub fn new(client: C, policy: RetryPolicy, params: SamplingParams) -> Self {
        Self {
            client,
            policy,
            params,
        }
    }

    /// Extract records from one unit.
    ///
    /// The LLM is asked for an array of candidate records conforming to
    /// `record_type`; each candidate is coerced against the field tree, so
    /// an individual malformed field becomes null rather than failing the
    /// unit. The returned outcome carries the total attempt count.
    pub async fn execute(
        &self,
        unit: &ExtractionUnit,
        record_type: &RecordType,
        refined_query: &str,
        guide: Option<&FieldGuide>,
        usage: &UsageTracker,
    ) -> ExtractionOutcome {
        let prompt = prompt::extraction(refined_query, guide, &unit.text);
        let target = json!({
            "type": "array",
            "items": record_type.to_json_schema(),
        });

        let (result, attempts) = self
            .policy
            .run_call(&self.client, &prompt, &target, &self.params)
            .await;

        match result {
            Ok((value, tokens)) => {
                usage.record_unit_call(STEP_EXTRACTION, &format!("unit_{}", unit.id), tokens);
                let candidates: Vec<Value> = match value {
                    Value::Array(items) => items,
                    // A bare object where an array was expected still counts.
                    obj @ Value::Object(_) => vec![obj],
                    other => {
                        return ExtractionOutcome::Failure {
                            unit_id: unit.id,
                            kind: crate::error::LlmErrorKind::InvalidResponse,
                            message: format!(
                                "expected an array of records, got {}",
                                type_name(&other)
                            ),
                            attempts,
                        }
                    }
                };
                let records = candidates
                    .iter()
                    .map(|c| record_type.coerce_record(c))
                    .collect();
                ExtractionOutcome::Success {
                    unit_id: unit.id,
                    records,
                    attempts,
                }
            }
            Err(err) => {
                tracing::warn!(
                    unit_id = unit.id,
                    kind = %err.kind,
                    attempts,
                    "unit extraction failed"
                );
                ExtractionOutcome::Failure {
                    unit_id: unit.id,
                    kind: err.kind,
                    message: err.message,
                    attempts,
                }
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, LlmErrorKind};
    use crate::schema::{FieldKind, FieldSpec};
    use crate::testing::MockLlm;

    fn simple_schema() -> RecordType {
        let mut schema = RecordType::new("Item", "test item");
        schema.push_field(
            RecordType::ROOT,
            FieldSpec::new("name", FieldKind::String, "the name"),
        );
        schema.push_field(
            RecordType::ROOT,
            FieldSpec::new("qty", FieldKind::Number, "the quantity"),
        );
        schema
    }

    #[tokio::test]
    async fn success_coerces_each_candidate() {
        let mock = MockLlm::new().with_response(json!([
            {"name": "bolt", "qty": "12"},
            {"name": "nut"},
        ]));
        let executor = ExtractionExecutor::new(mock, RetryPolicy::default(), SamplingParams::default());
        let usage = UsageTracker::new();

        let outcome = executor
            .execute(
                &ExtractionUnit::new(0, "bolts and nuts"),
                &simple_schema(),
                "extract items",
                None,
                &usage,
            )
            .await;

        match outcome {
            ExtractionOutcome::Success { records, attempts, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(records.len(), 2);
                assert_eq!(records[0]["qty"], json!(12.0));
                assert_eq!(records[1]["qty"], Value::Null);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(usage.breakdown()[0].children.len(), 1);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_then_succeed() {
        let mock = MockLlm::new()
            .with_failure(LlmError::rate_limited("429"))
            .with_failure(LlmError::rate_limited("429"))
            .with_failure(LlmError::rate_limited("429"))
            .with_response(json!([{"name": "late", "qty": 1}]));
        let executor = ExtractionExecutor::new(
            mock,
            RetryPolicy::new(3, 0.001, 0.002),
            SamplingParams::default(),
        );
        let usage = UsageTracker::new();

        let outcome = executor
            .execute(
                &ExtractionUnit::new(3, "text"),
                &simple_schema(),
                "q",
                None,
                &usage,
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 4);
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_on_first_attempt() {
        let mock = MockLlm::new()
            .with_failure(LlmError::new(LlmErrorKind::Authentication, "bad key"));
        let executor =
            ExtractionExecutor::new(mock, RetryPolicy::default(), SamplingParams::default());
        let usage = UsageTracker::new();

        let outcome = executor
            .execute(
                &ExtractionUnit::new(1, "text"),
                &simple_schema(),
                "q",
                None,
                &usage,
            )
            .await;
        match outcome {
            ExtractionOutcome::Failure { kind, attempts, .. } => {
                assert_eq!(kind, LlmErrorKind::Authentication);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let mock = MockLlm::new().with_failure(LlmError::timeout("slow"));
        let executor = ExtractionExecutor::new(
            mock,
            RetryPolicy::new(0, 0.001, 0.002),
            SamplingParams::default(),
        );
        let usage = UsageTracker::new();

        let outcome = executor
            .execute(
                &ExtractionUnit::new(0, "text"),
                &simple_schema(),
                "q",
                None,
                &usage,
            )
            .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn scalar_response_is_an_invalid_response_failure() {
        let mock = MockLlm::new().with_response(json!("not a record"));
        let executor =
            ExtractionExecutor::new(mock, RetryPolicy::default(), SamplingParams::default());
        let usage = UsageTracker::new();

        let outcome = executor
            .execute(
                &ExtractionUnit::new(0, "text"),
                &simple_schema(),
                "q",
                None,
                &usage,
            )
            .await;
        match outcome {
            ExtractionOutcome::Failure { kind, .. } => {
                assert_eq!(kind, LlmErrorKind::InvalidResponse);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
