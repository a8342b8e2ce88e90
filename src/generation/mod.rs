//! Natural-language generation collaborator.
//!
//! The engine only ever sees the `Generator` trait: system instructions, a
//! JSON schema the answer should follow, and the conversation so far go in;
//! raw text comes out. `generate_structured` turns that text into a typed
//! value and reports malformed output separately from transport failures.

pub mod claude_cli;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::errors::GenerationError;

pub use claude_cli::ClaudeCliGenerator;
pub use http::HttpGenerator;

/// One call into the generation collaborator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_instructions: String,
    /// JSON Schema for the expected answer.
    pub schema: serde_json::Value,
    pub conversation_context: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError>;

    /// Short identifier for logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum StructuredError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("{message}")]
    Schema { message: String, raw: String },
}

/// Call the generator, bounded by `timeout`, and parse its answer as `T`.
pub async fn generate_structured<T: DeserializeOwned>(
    generator: &dyn Generator,
    request: GenerationRequest,
    timeout: Duration,
) -> Result<T, StructuredError> {
    let raw = tokio::time::timeout(timeout, generator.generate(request))
        .await
        .map_err(|_| GenerationError::Timeout { after: timeout })??;
    parse_structured(&raw)
}

/// Parse model output as `T`, tolerating leading prose and fenced code blocks.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, StructuredError> {
    let Some(json) = extract_json_object(raw) else {
        return Err(StructuredError::Schema {
            message: "response contains no JSON object".to_string(),
            raw: raw.to_string(),
        });
    };
    serde_json::from_str(json).map_err(|e| StructuredError::Schema {
        message: format!("response does not match the expected shape: {}", e),
        raw: raw.to_string(),
    })
}

/// The outermost `{...}` span of `text`, if any.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
