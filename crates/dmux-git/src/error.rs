use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to spawn git: {0}")]
    Io(#[from] std::io::Error),

    #[error("git exited {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("git command timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid ref name {0:?}: {1}")]
    InvalidRef(String, &'static str),

    #[error("unexpected git output: {0}")]
    Parse(String),
}

impl GitError {
    /// Expected-missing class: deleting a branch or worktree that is
    /// already gone. Callers swallow these and continue.
    pub fn is_already_absent(&self) -> bool {
        match self {
            GitError::CommandFailed { stderr, .. } => {
                stderr.contains("not found")
                    || stderr.contains("is not a working tree")
                    || stderr.contains("No such file or directory")
            }
            _ => false,
        }
    }
}
