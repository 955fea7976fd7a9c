//! Git adapter: worktree and branch plumbing, shelled out to `git`.
//!
//! Mirrors the tmux adapter's shape: a mock-injectable [`GitRunner`]
//! underneath, argument construction and parsing above.

pub mod error;
pub mod refname;
pub mod repo;
pub mod runner;
pub mod worktree;

pub use error::GitError;
pub use refname::validate_branch_name;
pub use repo::Git;
pub use runner::{GitExecutor, GitRunner};
pub use worktree::WorktreeInfo;
