use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{GenerationRequest, Generator};
use crate::errors::GenerationError;

/// Generator that shells out to the `claude` CLI in print mode.
///
/// The CLI has no structured-output switch, so the schema is appended to the
/// system prompt and the answer is parsed leniently by the caller.
pub struct ClaudeCliGenerator {
    command: String,
    timeout: Duration,
}

impl ClaudeCliGenerator {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    fn system_prompt(request: &GenerationRequest) -> String {
        format!(
            "{}\n\nYou MUST respond with valid JSON only (no markdown, no explanation) matching this JSON Schema:\n{}",
            request.system_instructions,
            serde_json::to_string_pretty(&request.schema).unwrap_or_else(|_| request.schema.to_string()),
        )
    }
}

#[async_trait]
impl Generator for ClaudeCliGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let system = Self::system_prompt(&request);
        let child = Command::new(&self.command)
            .args([
                "--print",
                "--output-format",
                "text",
                "--system-prompt",
                &system,
                "-p",
                &request.conversation_context,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GenerationError::Unavailable(format!("failed to run {}: {}", self.command, e))
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GenerationError::Timeout {
                after: self.timeout,
            })?
            .map_err(|e| GenerationError::Unavailable(format!("{} did not finish: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::Rejected(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn name(&self) -> &str {
        "claude_cli"
    }
}
