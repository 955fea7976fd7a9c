//! `codex exec` provider. Codex prints the final message on stdout; no
//! structured output mode worth depending on, so the trimmed tail is the
//! result.

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::provider::{CompletionProvider, CompletionRequest, LlmError};

pub struct CodexCliProvider;

#[async_trait]
impl CompletionProvider for CodexCliProvider {
    fn name(&self) -> &'static str {
        "codex-cli"
    }

    fn available(&self) -> bool {
        which::which("codex").is_ok()
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let mut cmd = Command::new("codex");
        cmd.arg("exec").arg("--skip-git-repo-check");
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

        if !output.status.success() {
            return Err(LlmError::Provider(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
