use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("failed to spawn tmux: {0}")]
    Io(#[from] std::io::Error),

    #[error("tmux exited {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("tmux command timed out after {0:?}")]
    Timeout(Duration),

    #[error("pane not found: {0}")]
    PaneNotFound(String),

    #[error("unexpected tmux output: {0}")]
    Parse(String),
}

impl TmuxError {
    /// True for the expected-missing class of failures that callers
    /// swallow (killing an already-dead pane, querying a vanished one).
    pub fn is_pane_missing(&self) -> bool {
        match self {
            TmuxError::PaneNotFound(_) => true,
            TmuxError::CommandFailed { stderr, .. } => stderr.contains("can't find pane"),
            _ => false,
        }
    }
}
