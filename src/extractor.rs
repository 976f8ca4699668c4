//! The caller-facing extractor facade.
//!
//! [`Extractor`] wires the pipeline together: schema synthesis (or guide
//! generation when a record type is supplied), bounded concurrent per-unit
//! extraction, retry handling, usage accounting, and result aggregation.
//! Every operation has an async form and a `_blocking` twin with identical
//! semantics for callers without a runtime.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::executor::ExtractionExecutor;
use crate::guide::{FieldGuide, GuideGenerator};
use crate::llm::{LlmClient, SamplingParams};
use crate::pool::{CancelFlag, ConcurrencyCoordinator, ProcessingMode};
use crate::result::ExtractionResult;
use crate::retry::RetryPolicy;
use crate::schema::RecordType;
use crate::synthesize::SchemaSynthesizer;
use crate::unit::{ExtractionRequest, ExtractionUnit};
use crate::usage::UsageTracker;

/// Per-stage sampling parameters, forwarded opaquely to the LLM client.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StageParams {
    /// Parameters for the analysis/refinement/schema-generation calls.
    pub synthesis: SamplingParams,
    /// Parameters for the guide call.
    pub guide: SamplingParams,
    /// Parameters for per-unit extraction calls.
    pub extraction: SamplingParams,
}

/// Configuration for an [`Extractor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    /// Maximum retries after the first attempt (default 3).
    pub max_retries: u32,
    /// Minimum backoff in seconds (default 1).
    pub min_wait: f64,
    /// Maximum backoff in seconds (default 10).
    pub max_wait: f64,
    /// Concurrent unit calls bound (default 10).
    pub max_threads: usize,
    /// Units dispatched per batch (default 100).
    pub batch_size: usize,
    /// Scheduling model for unit fan-out.
    pub mode: ProcessingMode,
    /// Per-stage sampling parameters.
    pub params: StageParams,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_wait: 1.0,
            max_wait: 10.0,
            max_threads: 10,
            batch_size: 100,
            mode: ProcessingMode::default(),
            params: StageParams::default(),
        }
    }
}

impl ExtractorConfig {
    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::Configuration("max_threads must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be at least 1".into()));
        }
        if self.min_wait < 0.0 || self.max_wait < 0.0 {
            return Err(Error::Configuration("backoff bounds must be non-negative".into()));
        }
        if self.max_wait < self.min_wait {
            return Err(Error::Configuration(format!(
                "max_wait ({}) must not be below min_wait ({})",
                self.max_wait, self.min_wait
            )));
        }
        Ok(())
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.min_wait, self.max_wait)
    }
}

/// Turns extraction requests plus batches of units into validated records.
///
/// # Example
///
/// ```rust,ignore
/// use llm_extract::{Extractor, ExtractionUnit};
///
/// let extractor = Extractor::new(client)?;
/// let units = ExtractionUnit::from_texts(reports);
/// let result = extractor
///     .extract(units, "extract each incident's date and resolution steps")
///     .await?;
/// println!("{}/{} units ok", result.success_count(), result.total());
/// ```
pub struct Extractor<C> {
    client: Arc<C>,
    config: ExtractorConfig,
    coordinator: ConcurrencyCoordinator,
    usage: UsageTracker,
}

impl<C: LlmClient + 'static> Extractor<C> {
    /// Create an extractor with default configuration.
    pub fn new(client: C) -> Result<Self> {
        Self::with_config(client, ExtractorConfig::default())
    }

    /// Create an extractor, validating the configuration.
    pub fn with_config(client: C, config: ExtractorConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_retries = config.max_retries,
            min_wait = config.min_wait,
            max_wait = config.max_wait,
            max_threads = config.max_threads,
            batch_size = config.batch_size,
            mode = ?config.mode,
            "initialized extractor"
        );
        let coordinator =
            ConcurrencyCoordinator::new(config.max_threads, config.batch_size, config.mode);
        Ok(Self {
            client: Arc::new(client),
            config,
            coordinator,
            usage: UsageTracker::new(),
        })
    }

    /// The shared usage tracker, updated by every LLM-calling step.
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    fn synthesizer(&self) -> SchemaSynthesizer<Arc<C>> {
        SchemaSynthesizer::new(
            self.client.clone(),
            self.config.policy(),
            self.config.params.synthesis,
        )
    }

    /// Derive a record type from a query without extracting anything.
    pub async fn synthesize_schema(
        &self,
        query: &str,
        sample_text: Option<&str>,
    ) -> Result<RecordType> {
        let synthesized = self
            .synthesizer()
            .synthesize(query, sample_text, &[], &self.usage)
            .await?;
        Ok(synthesized.record_type)
    }

    /// Refine an existing record type with natural-language instructions.
    ///
    /// Unrelated fields are preserved unchanged; instructions the schema
    /// already satisfies are no-ops.
    pub async fn refine_schema(
        &self,
        record_type: &RecordType,
        instructions: &str,
    ) -> Result<RecordType> {
        self.synthesizer()
            .refine(record_type, instructions, &self.usage)
            .await
    }

    /// Extract against a query, synthesizing the schema first.
    pub async fn extract(
        &self,
        units: Vec<ExtractionUnit>,
        query: &str,
    ) -> Result<ExtractionResult> {
        self.extract_request(units, &ExtractionRequest::new(query), &CancelFlag::new())
            .await
    }

    /// Extract against a caller-supplied record type, bypassing synthesis
    /// in favor of guide generation.
    pub async fn extract_with_type(
        &self,
        units: Vec<ExtractionUnit>,
        record_type: RecordType,
    ) -> Result<ExtractionResult> {
        let query = record_type.description.clone();
        let request = ExtractionRequest::new(query).with_record_type(record_type);
        self.extract_request(units, &request, &CancelFlag::new()).await
    }

    /// Run the same units through several queries, one result per query.
    pub async fn extract_many(
        &self,
        units: &[ExtractionUnit],
        queries: &[String],
    ) -> Result<IndexMap<String, ExtractionResult>> {
        let mut results = IndexMap::with_capacity(queries.len());
        for query in queries {
            tracing::info!(query = %query, "processing query");
            let result = self.extract(units.to_vec(), query).await?;
            results.insert(query.clone(), result);
        }
        Ok(results)
    }

    /// The general entry point: extract units per an [`ExtractionRequest`],
    /// honoring the cancel flag.
    ///
    /// Cancellation stops new dispatches; outcomes already produced are
    /// preserved and returned as a partial result with the undispatched
    /// units marked as cancelled failures.
    pub async fn extract_request(
        &self,
        units: Vec<ExtractionUnit>,
        request: &ExtractionRequest,
        cancel: &CancelFlag,
    ) -> Result<ExtractionResult> {
        let columns = available_columns(&units);
        let (record_type, refined_query, guide) = match &request.record_type {
            Some(record_type) => {
                let generator =
                    GuideGenerator::new(self.client.clone(), self.config.params.guide);
                let guide = generator
                    .generate(record_type, &columns, &self.usage)
                    .await;
                (record_type.clone(), request.query.clone(), Some(guide))
            }
            None => {
                let sample = request
                    .sample_text
                    .as_deref()
                    .or_else(|| units.first().map(|u| u.text.as_str()));
                let synthesized = self
                    .synthesizer()
                    .synthesize(&request.query, sample, &columns, &self.usage)
                    .await?;
                (synthesized.record_type, synthesized.refined_query, None)
            }
        };

        let total = units.len();
        let outcomes = self
            .run_units(units, record_type.clone(), refined_query, guide, cancel)
            .await;
        let result = ExtractionResult::aggregate(outcomes, record_type);
        tracing::info!(
            total,
            success = result.success_count(),
            failed = result.failure_count(),
            success_rate = format!("{:.2}%", result.success_rate()),
            "extraction finished"
        );
        Ok(result)
    }

    async fn run_units(
        &self,
        units: Vec<ExtractionUnit>,
        record_type: RecordType,
        refined_query: String,
        guide: Option<FieldGuide>,
        cancel: &CancelFlag,
    ) -> Vec<crate::unit::ExtractionOutcome> {
        let executor = Arc::new(ExtractionExecutor::new(
            self.client.clone(),
            self.config.policy(),
            self.config.params.extraction,
        ));
        let record_type = Arc::new(record_type);
        let refined_query = Arc::new(refined_query);
        let guide = Arc::new(guide);
        let usage = self.usage.clone();

        self.coordinator
            .run(units, cancel, move |unit| {
                let executor = executor.clone();
                let record_type = record_type.clone();
                let refined_query = refined_query.clone();
                let guide = guide.clone();
                let usage = usage.clone();
                async move {
                    executor
                        .execute(
                            &unit,
                            &record_type,
                            &refined_query,
                            guide.as_ref().as_ref(),
                            &usage,
                        )
                        .await
                }
            })
            .await
    }

    // Blocking twins. Each builds a private runtime; calling them from
    // inside an async context is an error.

    /// Blocking twin of [`Extractor::extract`].
    pub fn extract_blocking(
        &self,
        units: Vec<ExtractionUnit>,
        query: &str,
    ) -> Result<ExtractionResult> {
        block_on(self.extract(units, query))
    }

    /// Blocking twin of [`Extractor::extract_with_type`].
    pub fn extract_with_type_blocking(
        &self,
        units: Vec<ExtractionUnit>,
        record_type: RecordType,
    ) -> Result<ExtractionResult> {
        block_on(self.extract_with_type(units, record_type))
    }

    /// Blocking twin of [`Extractor::extract_many`].
    pub fn extract_many_blocking(
        &self,
        units: &[ExtractionUnit],
        queries: &[String],
    ) -> Result<IndexMap<String, ExtractionResult>> {
        block_on(self.extract_many(units, queries))
    }

    /// Blocking twin of [`Extractor::synthesize_schema`].
    pub fn synthesize_schema_blocking(
        &self,
        query: &str,
        sample_text: Option<&str>,
    ) -> Result<RecordType> {
        block_on(self.synthesize_schema(query, sample_text))
    }

    /// Blocking twin of [`Extractor::refine_schema`].
    pub fn refine_schema_blocking(
        &self,
        record_type: &RecordType,
        instructions: &str,
    ) -> Result<RecordType> {
        block_on(self.refine_schema(record_type, instructions))
    }
}

/// Column names visible to analysis and guide generation: the union of the
/// units' source metadata keys, in first-seen order.
fn available_columns(units: &[ExtractionUnit]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for unit in units {
        for key in unit.source.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build blocking runtime")
        .block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;

    #[test]
    fn invalid_configuration_is_rejected_at_construction() {
        let bad = ExtractorConfig {
            max_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            Extractor::with_config(MockLlm::new(), bad),
            Err(Error::Configuration(_))
        ));

        let inverted = ExtractorConfig {
            min_wait: 5.0,
            max_wait: 1.0,
            ..Default::default()
        };
        assert!(Extractor::with_config(MockLlm::new(), inverted).is_err());
    }

    #[test]
    fn available_columns_unions_source_keys_in_order() {
        let units = vec![
            ExtractionUnit::new(0, "a").with_source("file", "r.csv").with_source("row", "1"),
            ExtractionUnit::new(1, "b").with_source("row", "2").with_source("page", "3"),
        ];
        assert_eq!(available_columns(&units), vec!["file", "row", "page"]);
    }
}
