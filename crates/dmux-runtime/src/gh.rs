//! Thin wrapper around the `gh` CLI for opening pull requests.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

pub fn available() -> bool {
    which::which("gh").is_ok()
}

/// `gh pr create`; returns the PR URL gh prints on stdout.
pub async fn create_pr(
    dir: &Path,
    base: &str,
    head: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    let output = Command::new("gh")
        .current_dir(dir)
        .args([
            "pr", "create", "--base", base, "--head", head, "--title", title, "--body", body,
        ])
        .output()
        .await
        .context("failed to spawn gh")?;

    if !output.status.success() {
        bail!(
            "gh pr create exited {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_pr_url(&stdout).context("gh did not print a PR url")
}

/// gh prints progress lines before the URL; the URL is the last
/// http(s) line on stdout.
pub fn parse_pr_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("https://") || line.starts_with("http://"))
        .map(str::to_string)
}

/// PR number from a `.../pull/<n>` URL.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse().ok())
}
