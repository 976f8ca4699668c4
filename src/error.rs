//! Error types for schema synthesis and extraction.

use thiserror::Error;

/// Classification of LLM transport failures.
///
/// The classification decides whether an attempt may be retried
/// (see [`RetryPolicy`](crate::retry::RetryPolicy)). Retryable kinds are
/// transient conditions of the provider or the network; non-retryable kinds
/// will fail identically on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LlmErrorKind {
    /// The request exceeded the provider-configured timeout.
    Timeout,
    /// The provider rejected the request due to rate limiting.
    RateLimited,
    /// The provider returned a 5xx-class status.
    Server,
    /// The connection was reset mid-request.
    ConnectionReset,
    /// Authentication or authorization failed.
    Authentication,
    /// The request itself was malformed and rejected by the provider.
    MalformedRequest,
    /// The response could not be decoded into the requested structure.
    InvalidResponse,
    /// The call was abandoned because the overall request was cancelled.
    Cancelled,
}

impl LlmErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LlmErrorKind::Timeout
                | LlmErrorKind::RateLimited
                | LlmErrorKind::Server
                | LlmErrorKind::ConnectionReset
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::Server => "server",
            LlmErrorKind::ConnectionReset => "connection_reset",
            LlmErrorKind::Authentication => "authentication",
            LlmErrorKind::MalformedRequest => "malformed_request",
            LlmErrorKind::InvalidResponse => "invalid_response",
            LlmErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A classified failure from the LLM call interface.
#[derive(Debug, Clone, Error)]
#[error("LLM call failed ({kind}): {message}")]
pub struct LlmError {
    /// The failure classification.
    pub kind: LlmErrorKind,
    /// Provider- or transport-supplied detail.
    pub message: String,
}

impl LlmError {
    /// Create a new classified error.
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a rate-limit error.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::RateLimited, message)
    }

    /// Shorthand for a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Timeout, message)
    }

    /// Shorthand for an invalid-response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidResponse, message)
    }
}

/// The main error type for extraction operations.
///
/// Only schema- and configuration-level errors abort a call. Unit-level
/// failures are captured as [`Failure`](crate::unit::ExtractionOutcome::Failure)
/// outcomes inside the result and are never raised through this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Schema synthesis failed; no per-unit extraction is possible.
    #[error("schema generation failed: {0}")]
    SchemaGeneration(String),

    /// Invalid configuration, raised at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An LLM call failed after retries were exhausted.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;
