//! Error types for the ingestion pipeline, LLM adapter and intent handlers.
//!
//! Store, config and CLI plumbing use `anyhow`; these enums are the failures
//! callers are expected to match on.

use std::time::Duration;

/// Failure inside a format-specific extractor adapter. Fatal for the document.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("document is empty")]
    Empty,
    #[error("invalid UTF-8 in {0} input")]
    InvalidUtf8(&'static str),
    #[error("malformed CSV at line {line}: {reason}")]
    MalformedCsv { line: usize, reason: String },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("XLSX extraction failed: {0}")]
    Xlsx(String),
}

/// Errors from an [`LlmClient`](crate::llm::LlmClient) call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM provider is disabled")]
    Disabled,
    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Timeouts and transport failures may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Per-document ingestion failure.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unsupported format: '{0}'")]
    UnsupportedFormat(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("ingest failed after {attempts} attempt(s): {message}")]
    IngestFailed { attempts: u32, message: String },
}

impl IngestError {
    /// Stable machine-readable code for CLI and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Extraction(_) => "extraction_failed",
            Self::IngestFailed { .. } => "ingest_failed",
        }
    }
}

/// Failure of one intent handler; folded into a degraded section.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler registered for intent '{0}'")]
    NotRegistered(String),
    #[error("handler '{handler}' failed: {message}")]
    Failed { handler: String, message: String },
    #[error("handler '{handler}' timed out after {timeout:?}")]
    Timeout { handler: String, timeout: Duration },
}
