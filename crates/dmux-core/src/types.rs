//! Pane records and the on-disk project config model.
//!
//! Field names serialize in camelCase for compatibility with the
//! `.dmux/dmux.config.json` format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Agent CLI driving a pane. `None` marks a plain shell pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Opencode,
    Codex,
    None,
}

impl AgentKind {
    /// Binary name probed on `$PATH` and in the known install dirs.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            AgentKind::Claude => Some("claude"),
            AgentKind::Opencode => Some("opencode"),
            AgentKind::Codex => Some("codex"),
            AgentKind::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Opencode => "opencode",
            AgentKind::Codex => "codex",
            AgentKind::None => "none",
        }
    }

    /// Parse an agent identifier, rejecting anything outside the canonical
    /// set. The set is `claude | opencode | codex | none`; API callers that
    /// send something else get a typed error, not a silent default.
    pub fn parse(s: &str) -> Result<AgentKind, UnknownAgent> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "opencode" => Ok(AgentKind::Opencode),
            "codex" => Ok(AgentKind::Codex),
            "none" | "" => Ok(AgentKind::None),
            other => Err(UnknownAgent(other.to_string())),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown agent identifier: {0:?}")]
pub struct UnknownAgent(pub String);

/// Analyzer-published status of the agent running in a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Working,
    Waiting,
    Idle,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevStatus {
    Running,
    Stopped,
}

/// One selectable option extracted from an agent's option dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogChoice {
    pub action: String,
    /// Keystrokes that select this option, normalized to a list.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PotentialHarm {
    pub has_risk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The central entity: one tmux pane, possibly paired with a worktree and
/// an agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneRecord {
    /// Opaque id assigned at creation, unique within a project.
    pub id: String,
    /// Branch-safe name derived from the prompt.
    pub slug: String,
    /// Initial user text sent to the agent. Empty for shell panes.
    #[serde(default)]
    pub prompt: String,
    /// tmux's own pane identifier (`%37`). Re-bound if tmux rotates ids.
    pub tmux_pane_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    pub agent: AgentKind,
    #[serde(default)]
    pub agent_status: AgentStatus,

    // Analyzer output. Present only while relevant; the status merge rules
    // in `apply_status_update` clear them on transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<DialogChoice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub potential_harm: Option<PotentialHarm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_error: Option<String>,

    // Hook-driven lifecycle statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_status: Option<DevStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_status: Option<String>,

    /// Auto-accept option dialogs when the analyzer sees no risk.
    #[serde(default)]
    pub autopilot: bool,
}

impl PaneRecord {
    pub fn new(id: String, slug: String, tmux_pane_id: String, agent: AgentKind) -> Self {
        PaneRecord {
            id,
            slug,
            prompt: String::new(),
            tmux_pane_id,
            worktree_path: None,
            agent,
            agent_status: AgentStatus::Unknown,
            options_question: None,
            options: None,
            potential_harm: None,
            agent_summary: None,
            analyzer_error: None,
            test_status: None,
            dev_status: None,
            dev_url: None,
            pr_number: None,
            pr_url: None,
            pr_status: None,
            autopilot: false,
        }
    }

    /// A pane without a worktree is a shell pane.
    pub fn is_shell(&self) -> bool {
        self.worktree_path.is_none()
    }

    fn clear_option_fields(&mut self) {
        self.options_question = None;
        self.options = None;
        self.potential_harm = None;
    }

    /// Merge an analyzer status update, applying the transition clearing
    /// rules: leaving `waiting` drops the option fields, leaving `idle`
    /// drops the summary, entering `working` drops the analyzer error.
    pub fn apply_status_update(&mut self, update: StatusUpdate) {
        let previous = self.agent_status;
        let next = update.status;

        if previous == AgentStatus::Waiting && next != AgentStatus::Waiting {
            self.clear_option_fields();
        }
        if previous == AgentStatus::Idle && next != AgentStatus::Idle {
            self.agent_summary = None;
        }
        if next == AgentStatus::Working {
            self.analyzer_error = None;
        }

        self.agent_status = next;
        if let Some(question) = update.options_question {
            self.options_question = Some(question);
        }
        if let Some(options) = update.options {
            self.options = Some(options);
        }
        if let Some(harm) = update.potential_harm {
            self.potential_harm = Some(harm);
        }
        if let Some(summary) = update.agent_summary {
            self.agent_summary = Some(summary);
        }
        if let Some(error) = update.analyzer_error {
            self.analyzer_error = Some(error);
        }
    }
}

/// One analyzer cycle's output, merged into the pane record by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub status: AgentStatus,
    pub options_question: Option<String>,
    pub options: Option<Vec<DialogChoice>>,
    pub potential_harm: Option<PotentialHarm>,
    pub agent_summary: Option<String>,
    pub analyzer_error: Option<String>,
}

impl StatusUpdate {
    pub fn status_only(status: AgentStatus) -> Self {
        StatusUpdate {
            status,
            ..StatusUpdate::default()
        }
    }
}

/// Shape of `.dmux/dmux.config.json`, the single authoritative pane list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub panes: Vec<PaneRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProjectConfig {
    pub fn pane(&self, id: &str) -> Option<&PaneRecord> {
        self.panes.iter().find(|p| p.id == id)
    }

    pub fn pane_mut(&mut self, id: &str) -> Option<&mut PaneRecord> {
        self.panes.iter_mut().find(|p| p.id == id)
    }

    /// Panes sharing a worktree path with `pane`, excluding `pane` itself.
    pub fn siblings_of(&self, pane: &PaneRecord) -> Vec<&PaneRecord> {
        match &pane.worktree_path {
            Some(path) => self
                .panes
                .iter()
                .filter(|p| p.id != pane.id && p.worktree_path.as_deref() == Some(path))
                .collect(),
            None => Vec::new(),
        }
    }
}
