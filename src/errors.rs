//! Typed error hierarchy for the work session engine.
//!
//! Two enums cover the two boundaries:
//! - `EngineError` — everything a session operation can fail with
//! - `GenerationError` — failures of the remote generation collaborator

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by `WorkSessionEngine` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input (enum values, ranges). Raised before any persistence.
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Stage '{stage}' is not part of session {session_id}")]
    StageNotFound { session_id: String, stage: String },

    #[error("No evidence pack is shared as {share_id}")]
    EvidencePackNotFound { share_id: String },

    /// Terminal session, out-of-sequence stage, or a concurrent writer got there first.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Collaborator timeout, rate limit or outage. Nothing was committed.
    #[error("Temporarily unavailable: {0}")]
    Retryable(String),

    /// Collaborator output did not match the expected shape.
    #[error("Malformed collaborator output: {message}")]
    Schema { message: String },

    /// Collaborator refused the request (bad credentials, invalid model, ...).
    #[error("Generation collaborator rejected the request: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Retryable(_))
    }

    /// Stable machine-readable kind, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::SessionNotFound { .. }
            | EngineError::StageNotFound { .. }
            | EngineError::EvidencePackNotFound { .. } => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Retryable(_) => "retryable",
            EngineError::Schema { .. } => "schema",
            EngineError::Upstream(_) => "upstream",
            EngineError::Database(_) => "internal",
        }
    }
}

impl From<GenerationError> for EngineError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Timeout { .. }
            | GenerationError::RateLimited { .. }
            | GenerationError::Unavailable(_) => EngineError::Retryable(err.to_string()),
            GenerationError::Rejected(msg) => EngineError::Upstream(msg),
        }
    }
}

/// Errors from a single call into the generation collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("Generation rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Rejected(String),
}
