//! Headless `claude -p` provider.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::provider::{CompletionProvider, CompletionRequest, LlmError};

/// Parsed JSON output from `claude -p --output-format json`.
#[derive(Debug, Deserialize)]
pub struct ClaudeJsonOutput {
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: String,
}

pub struct ClaudeCliProvider;

#[async_trait]
impl CompletionProvider for ClaudeCliProvider {
    fn name(&self) -> &'static str {
        "claude-cli"
    }

    fn available(&self) -> bool {
        which::which("claude").is_ok()
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let mut cmd = Command::new("claude");
        cmd.arg("-p").arg("--output-format").arg("json");
        if let Some(system) = &req.system {
            cmd.arg("--system-prompt").arg(system);
        }
        cmd.arg(&req.prompt);
        cmd.kill_on_drop(true);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd.spawn()?;
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = tokio::time::sleep(req.timeout) => return Err(LlmError::Timeout(req.timeout)),
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            return Err(LlmError::Provider(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let parsed = parse_output(&stdout)?;
        if parsed.is_error {
            return Err(LlmError::Provider(parsed.result));
        }
        Ok(parsed.result)
    }
}

pub fn parse_output(stdout: &str) -> Result<ClaudeJsonOutput, LlmError> {
    serde_json::from_str(stdout)
        .map_err(|e| LlmError::Provider(format!("bad claude output: {e}")))
}
