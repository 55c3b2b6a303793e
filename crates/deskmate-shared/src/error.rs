//! Error types for Deskmate.

use thiserror::Error;

/// Failures of the language-model backend. Always recovered by switching the
/// affected stage to rule-based mode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("LLM backend is not configured")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Request timeout after {0} ms")]
    Timeout(u64),

    #[error("Malformed structured output: {0}")]
    Malformed(String),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

/// Failures of the retrieval store. Recovered by proceeding with no passages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Index query timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Index unavailable: {0}")]
    IndexUnavailable(#[from] IndexError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Session conflict: {0}")]
    SessionConflict(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// JSON-RPC style error code for the stdio server.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::IndexUnavailable(_) => -32001,
            PipelineError::Provider(_) => -32002,
            PipelineError::Validation(_) => -32602,
            PipelineError::SessionConflict(_) => -32003,
            PipelineError::UnknownSession(_) => -32004,
            PipelineError::Json(_) => -32700,
            PipelineError::Internal(_) => -32603,
        }
    }

    /// Whether the caller sees this error. Only validation problems are
    /// surfaced; everything else is recovered inside the pipeline.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_) | PipelineError::UnknownSession(_) | PipelineError::Json(_)
        )
    }
}
