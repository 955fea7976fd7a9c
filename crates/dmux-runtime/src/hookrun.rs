//! User lifecycle hooks: resolution, environment, sync/detached
//! execution, and first-use scaffolding of `.dmux-hooks/`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use dmux_core::types::PaneRecord;

use crate::project::ProjectContext;

/// Hook points dmux triggers. Anything else in the hooks directory is a
/// helper the user's own hooks call.
pub const KNOWN_HOOKS: &[&str] = &[
    "pane_created",
    "worktree_created",
    "before_pane_close",
    "pre_merge",
    "post_merge",
    "run_test",
    "run_dev",
    "pre_pr",
];

pub const SYNC_HOOK_TIMEOUT: Duration = Duration::from_secs(30);
/// Merges can run test suites; pre_merge gets a long leash.
pub const MERGE_HOOK_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-invocation context flattened into `DMUX_*` environment variables.
#[derive(Debug, Default, Clone)]
pub struct HookEnv {
    pub pane_id: Option<String>,
    pub slug: Option<String>,
    pub prompt: Option<String>,
    pub agent: Option<String>,
    pub tmux_pane_id: Option<String>,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub target_branch: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl HookEnv {
    pub fn for_pane(pane: &PaneRecord, branch: Option<String>) -> Self {
        HookEnv {
            pane_id: Some(pane.id.clone()),
            slug: Some(pane.slug.clone()),
            prompt: Some(pane.prompt.clone()),
            agent: Some(pane.agent.to_string()),
            tmux_pane_id: Some(pane.tmux_pane_id.clone()),
            worktree_path: pane.worktree_path.clone(),
            branch,
            target_branch: None,
            extra: Vec::new(),
        }
    }
}

pub struct HookRunner {
    root: PathBuf,
    /// Resolution order: team, local override, global.
    dirs: Vec<PathBuf>,
    server_port: std::sync::atomic::AtomicU16,
}

impl HookRunner {
    pub fn new(ctx: &ProjectContext) -> Self {
        HookRunner {
            root: ctx.root.clone(),
            dirs: ctx.hooks_dirs(),
            server_port: std::sync::atomic::AtomicU16::new(0),
        }
    }

    #[cfg(test)]
    fn with_dirs(root: PathBuf, dirs: Vec<PathBuf>) -> Self {
        HookRunner {
            root,
            dirs,
            server_port: std::sync::atomic::AtomicU16::new(0),
        }
    }

    pub fn set_server_port(&self, port: u16) {
        self.server_port
            .store(port, std::sync::atomic::Ordering::Relaxed);
    }

    /// First executable wins across the three directories. Files that
    /// exist but are not executable are reported and skipped.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.dirs {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }
            if is_executable(&path) {
                return Some(path);
            }
            tracing::warn!(path = %path.display(), "hook exists but is not executable, skipping");
        }
        None
    }

    fn env_pairs(&self, env: &HookEnv) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("DMUX_ROOT".to_string(), self.root.display().to_string()),
            (
                "DMUX_SERVER_PORT".to_string(),
                self.server_port
                    .load(std::sync::atomic::Ordering::Relaxed)
                    .to_string(),
            ),
        ];
        let mut push_opt = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value.clone()));
            }
        };
        push_opt("DMUX_PANE_ID", &env.pane_id);
        push_opt("DMUX_SLUG", &env.slug);
        push_opt("DMUX_PROMPT", &env.prompt);
        push_opt("DMUX_AGENT", &env.agent);
        push_opt("DMUX_TMUX_PANE_ID", &env.tmux_pane_id);
        push_opt("DMUX_BRANCH", &env.branch);
        push_opt("DMUX_TARGET_BRANCH", &env.target_branch);
        if let Some(path) = &env.worktree_path {
            pairs.push(("DMUX_WORKTREE_PATH".to_string(), path.display().to_string()));
        }
        pairs.extend(env.extra.iter().cloned());
        pairs
    }

    /// Fire-and-forget. The exit code lands in the log, nothing blocks.
    pub fn run_detached(&self, name: &str, env: &HookEnv) {
        let Some(script) = self.resolve(name) else {
            tracing::debug!(hook = name, "no hook installed");
            return;
        };
        let pairs = self.env_pairs(env);
        let cwd = env
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.root.clone());
        let name = name.to_string();
        tokio::spawn(async move {
            let mut cmd = Command::new(&script);
            cmd.current_dir(cwd)
                .envs(pairs)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match cmd.status().await {
                Ok(status) => {
                    tracing::info!(hook = %name, code = status.code().unwrap_or(-1), "hook finished")
                }
                Err(e) => tracing::warn!(hook = %name, error = %e, "hook failed to start"),
            }
        });
    }

    /// Blocking trigger (pre_merge, pre_pr). A nonzero exit or a timeout
    /// fails the surrounding action.
    pub async fn run_sync(&self, name: &str, env: &HookEnv, timeout: Duration) -> Result<()> {
        let Some(script) = self.resolve(name) else {
            return Ok(());
        };
        let cwd = env
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.root.clone());
        let mut cmd = Command::new(&script);
        cmd.current_dir(cwd)
            .envs(self.env_pairs(env))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(timeout, cmd.status())
            .await
            .map_err(|_| anyhow::anyhow!("hook '{name}' timed out after {timeout:?}"))?
            .with_context(|| format!("hook '{name}' failed to start"))?;

        if !status.success() {
            bail!("hook '{name}' exited {}", status.code().unwrap_or(-1));
        }
        Ok(())
    }

    /// Materialize the documentation/example directory on first use so
    /// the hook contract is discoverable.
    pub fn scaffold(&self) -> Result<()> {
        let team_dir = self
            .dirs
            .first()
            .context("hook runner has no directories")?;
        if team_dir.exists() {
            return Ok(());
        }
        let examples = team_dir.join("examples");
        std::fs::create_dir_all(&examples)?;

        std::fs::write(team_dir.join("README.md"), SCAFFOLD_README)?;
        std::fs::write(team_dir.join("AGENTS.md"), SCAFFOLD_AGENTS)?;
        std::fs::write(team_dir.join("CLAUDE.md"), SCAFFOLD_AGENTS)?;
        std::fs::write(examples.join("pre_merge"), SCAFFOLD_PRE_MERGE_EXAMPLE)?;
        std::fs::write(examples.join("post_merge"), SCAFFOLD_POST_MERGE_EXAMPLE)?;
        tracing::info!(dir = %team_dir.display(), "scaffolded hooks directory");
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

const SCAFFOLD_README: &str = "\
# dmux hooks

Executable scripts in this directory run at dmux lifecycle points. The
script name selects the hook point:

| hook | when | blocking |
|---|---|---|
| pane_created | after a pane and its agent start | no |
| worktree_created | after the worktree exists | no |
| before_pane_close | before a pane is killed | no |
| pre_merge | before a merge executes | yes (10 min budget) |
| post_merge | after a merge lands | no |
| run_test | from the test action | no |
| run_dev | from the dev action | no |
| pre_pr | before a PR is opened | yes (30 s budget) |

Resolution order: `.dmux-hooks/` (team, committed), `.dmux/hooks/`
(local override), `~/.dmux/hooks/` (global). First executable wins.

Hooks receive `DMUX_ROOT`, `DMUX_SERVER_PORT`, `DMUX_PANE_ID`,
`DMUX_SLUG`, `DMUX_PROMPT`, `DMUX_AGENT`, `DMUX_TMUX_PANE_ID`,
`DMUX_WORKTREE_PATH`, `DMUX_BRANCH` and, for merges,
`DMUX_TARGET_BRANCH`. Report test/dev results back with:

    curl -X PUT \"http://localhost:$DMUX_SERVER_PORT/api/panes/$DMUX_PANE_ID/test\" \\
      -H 'content-type: application/json' -d '{\"status\":\"passed\"}'
";

const SCAFFOLD_AGENTS: &str = "\
# Hooks directory

Scripts here are dmux lifecycle hooks, not application code. See
README.md in this directory for the contract. Keep them executable and
side-effect free outside the worktree they are handed.
";

const SCAFFOLD_PRE_MERGE_EXAMPLE: &str = "\
#!/bin/sh
# Example pre_merge hook: block the merge when tests fail.
# Install by copying to ../pre_merge and making it executable.
set -e
cd \"$DMUX_WORKTREE_PATH\"
npm test
";

const SCAFFOLD_POST_MERGE_EXAMPLE: &str = "\
#!/bin/sh
# Example post_merge hook: notify and prune stale branches.
echo \"merged $DMUX_BRANCH into $DMUX_TARGET_BRANCH\"
";
