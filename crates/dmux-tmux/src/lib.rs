//! Tmux adapter: the only spawn surface for `tmux` in the whole process.
//!
//! Commands run through the mock-injectable [`TmuxCommandRunner`] trait;
//! everything above it is pure argument construction and output parsing.

pub mod adapter;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod keyspec;

pub use adapter::{PaneHandle, SplitOpts, TmuxAdapter};
pub use error::TmuxError;
pub use executor::{TmuxCommandRunner, TmuxExecutor};
