//! Startup environment checks. Fail fast with a readable message
//! instead of a cascade of adapter errors.

use anyhow::{Result, bail};

pub struct PreflightReport {
    pub tmux_ok: bool,
    pub git_ok: bool,
    pub agents: Vec<dmux_core::types::AgentKind>,
}

pub fn check(home: &std::path::Path) -> Result<PreflightReport> {
    let tmux_ok = which::which("tmux").is_ok();
    let git_ok = which::which("git").is_ok();
    let agents = crate::lifecycle::detect_available_agents(home);

    if !tmux_ok {
        bail!("tmux is not installed or not on PATH; dmux cannot run without it");
    }
    if !git_ok {
        bail!("git is not installed or not on PATH; dmux cannot run without it");
    }
    if agents.is_empty() {
        tracing::warn!("no agent CLI found (claude, opencode, codex); panes will be shell-only");
    }
    Ok(PreflightReport {
        tmux_ok,
        git_ok,
        agents,
    })
}
