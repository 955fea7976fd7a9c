//! Install/uninstall the tmux hooks that feed the pane event bus.
//!
//! Each hook fires `run-shell` printing the hook name into a pipe the bus
//! reads. The hooks are scoped to the dmux session so other sessions on
//! the same server are untouched.

use std::path::Path;

use crate::error::TmuxError;
use crate::executor::TmuxCommandRunner;

/// Hook names dmux installs. Uninstall removes exactly this set.
pub const HOOK_NAMES: &[&str] = &[
    "session-window-changed",
    "window-pane-changed",
    "pane-exited",
    "client-session-changed",
];

/// The `set-hook` value for one hook: append the hook name to the event
/// pipe. `>>` keeps concurrent hook firings from truncating each other.
/// The value reaches tmux as a single argument, so only run-shell's own
/// `/bin/sh` parses the inner quoting.
pub fn hook_command(hook: &str, pipe: &Path) -> String {
    format!(
        "run-shell \"printf '%s\\n' {} >> '{}'\"",
        hook,
        pipe.display()
    )
}

pub fn install_hooks<R: TmuxCommandRunner>(
    runner: &R,
    session: &str,
    pipe: &Path,
) -> Result<(), TmuxError> {
    for hook in HOOK_NAMES {
        let command = hook_command(hook, pipe);
        runner.run(&["set-hook", "-t", session, hook, &command])?;
        tracing::debug!(hook = %hook, session = %session, "installed tmux hook");
    }
    Ok(())
}

pub fn uninstall_hooks<R: TmuxCommandRunner>(runner: &R, session: &str) -> Result<(), TmuxError> {
    for hook in HOOK_NAMES {
        // Unsetting a hook that was never set is fine.
        if let Err(e) = runner.run(&["set-hook", "-u", "-t", session, hook]) {
            tracing::debug!(hook = %hook, error = %e, "hook unset failed");
        }
    }
    Ok(())
}
