//! Extraction units, requests, and per-unit outcomes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::LlmErrorKind;
use crate::schema::{Record, RecordType};

/// Opaque identifier of one extraction unit (row index, chunk id, page
/// number).
pub type UnitId = usize;

/// One atomic piece of input text, processed independently of all others.
///
/// Units are produced by the caller's data layer (rows, chunks, pages) and
/// consumed read-only by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionUnit {
    /// Caller-assigned identifier, echoed back in the outcome.
    pub id: UnitId,
    /// The text payload to extract from.
    pub text: String,
    /// Optional source metadata (file name, page, column), echoed back in
    /// failure records.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub source: IndexMap<String, String>,
}

impl ExtractionUnit {
    /// Create a unit from an id and its text.
    pub fn new(id: UnitId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            source: IndexMap::new(),
        }
    }

    /// Attach a source metadata entry.
    #[must_use]
    pub fn with_source(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.source.insert(key.into(), value.into());
        self
    }

    /// Number ordered texts into units, ids following input order.
    pub fn from_texts<I, S>(texts: I) -> Vec<ExtractionUnit>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        texts
            .into_iter()
            .enumerate()
            .map(|(id, text)| ExtractionUnit::new(id, text))
            .collect()
    }
}

/// Chunking parameters carried opaquely for the caller's reader layer.
///
/// The core never splits text itself; these travel with the request so a
/// document reader can honor them when producing units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
        }
    }
}

/// A complete extraction request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Natural-language description of what to extract.
    pub query: String,
    /// Caller-supplied record type; when present, schema synthesis is
    /// skipped in favor of guide generation.
    pub record_type: Option<RecordType>,
    /// Sample text for schema synthesis context.
    pub sample_text: Option<String>,
    /// Chunking parameters for the reader layer.
    pub chunking: ChunkingParams,
}

impl ExtractionRequest {
    /// Create a request from a query alone.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            record_type: None,
            sample_text: None,
            chunking: ChunkingParams::default(),
        }
    }

    /// Supply an existing record type, bypassing schema synthesis.
    #[must_use]
    pub fn with_record_type(mut self, record_type: RecordType) -> Self {
        self.record_type = Some(record_type);
        self
    }

    /// Supply sample text for synthesis context.
    #[must_use]
    pub fn with_sample_text(mut self, sample: impl Into<String>) -> Self {
        self.sample_text = Some(sample.into());
        self
    }

    /// Override the chunking parameters.
    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkingParams) -> Self {
        self.chunking = chunking;
        self
    }
}

/// The result of processing one unit: exactly one outcome per unit, no
/// duplicates, no omissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// The unit produced one or more validated records.
    Success {
        /// The unit this outcome belongs to.
        unit_id: UnitId,
        /// Validated record instances; the model may find several records
        /// in one unit.
        records: Vec<Record>,
        /// Total attempts made, including the successful one.
        attempts: u32,
    },
    /// The unit failed after retries were exhausted (or immediately, for
    /// non-retryable kinds).
    Failure {
        /// The unit this outcome belongs to.
        unit_id: UnitId,
        /// Classification of the final error.
        kind: LlmErrorKind,
        /// Message of the final error.
        message: String,
        /// Total attempts made.
        attempts: u32,
    },
}

impl ExtractionOutcome {
    /// The unit this outcome belongs to.
    #[must_use]
    pub fn unit_id(&self) -> UnitId {
        match self {
            ExtractionOutcome::Success { unit_id, .. }
            | ExtractionOutcome::Failure { unit_id, .. } => *unit_id,
        }
    }

    /// Total attempts made for this unit.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            ExtractionOutcome::Success { attempts, .. }
            | ExtractionOutcome::Failure { attempts, .. } => *attempts,
        }
    }

    /// Whether this outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionOutcome::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_texts_numbers_in_order() {
        let units = ExtractionUnit::from_texts(["a", "b", "c"]);
        assert_eq!(units.len(), 3);
        assert_eq!(units[2].id, 2);
        assert_eq!(units[2].text, "c");
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = ExtractionOutcome::Failure {
            unit_id: 7,
            kind: LlmErrorKind::Timeout,
            message: "deadline exceeded".into(),
            attempts: 4,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["unit_id"], 7);
        assert_eq!(json["attempts"], 4);
    }
}
