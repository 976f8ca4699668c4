//! # llm-extract
//!
//! Query-driven structured extraction over LLMs: turn a natural-language
//! query and a batch of texts into typed, validated records.
//!
//! The pipeline derives a record schema from the query (or accepts one from
//! the caller), then runs one retried extraction call per input unit under a
//! bounded concurrency budget, and folds the per-unit outcomes into a single
//! aggregated result. One unit failing never aborts the batch; the result
//! accounts for every input unit, in input order.
//!
//! ## Core Concepts
//!
//! * **`Extractor`**: The caller facade; validates configuration and wires
//!   the stages together.
//! * **`RecordType`**: An arena-backed field tree describing what to
//!   extract, convertible to a JSON Schema target.
//! * **`SchemaSynthesizer`**: Derives a `RecordType` from a query through
//!   staged LLM calls, and refines existing ones idempotently.
//! * **`ExtractionUnit` / `ExtractionOutcome`**: One independent piece of
//!   input text and the exactly-one outcome it produces.
//! * **`ConcurrencyCoordinator`**: Bounded, batch-wise, order-preserving
//!   fan-out with cooperative or spawned scheduling.
//! * **`ExtractionResult`**: Aggregated outcomes with success statistics and
//!   tabular projection.
//! * **`UsageTracker`**: Per-step token accounting across every LLM call the
//!   pipeline makes.
//! * **`LlmClient`**: The single trait a backend implements; the crate never
//!   speaks to a provider directly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use llm_extract::{Extractor, ExtractionUnit, ListMode};
//!
//! let extractor = Extractor::new(client)?;
//! let units = ExtractionUnit::from_texts(incident_reports);
//! let result = extractor
//!     .extract(units, "extract each incident's date and resolution steps")
//!     .await?;
//!
//! println!("success rate: {:.1}%", result.success_rate());
//! for row in result.rows(ListMode::Rows) {
//!     println!("{row:?}");
//! }
//! ```

pub mod error;
pub mod executor;
pub mod extractor;
pub mod guide;
pub mod llm;
pub mod pool;
pub mod prompt;
pub mod result;
pub mod retry;
pub mod schema;
pub mod synthesize;
pub mod testing;
pub mod unit;
pub mod usage;

pub use error::{Error, LlmError, LlmErrorKind, Result};
pub use executor::ExtractionExecutor;
pub use extractor::{Extractor, ExtractorConfig, StageParams};
pub use guide::{FieldGuide, GuideGenerator};
pub use llm::{LlmClient, Prompt, SamplingParams, TokenUsage};
pub use pool::{CancelFlag, ConcurrencyCoordinator, ProcessingMode};
pub use result::{ExtractionResult, FailureRecord, ListMode};
pub use retry::RetryPolicy;
pub use schema::{FieldKind, FieldSpec, LeafField, Record, RecordType};
pub use synthesize::{
    apply_refine_ops, DraftField, QueryAnalysis, QueryRefinement, RefineOp, SchemaDraft,
    SchemaSynthesizer, SynthesizedSchema,
};
pub use unit::{
    ChunkingParams, ExtractionOutcome, ExtractionRequest, ExtractionUnit, UnitId,
};
pub use usage::{
    UsageRecord, UsageTracker, STEP_ANALYSIS, STEP_EXTRACTION, STEP_GUIDE, STEP_REFINEMENT,
    STEP_SCHEMA_GENERATION,
};
