//! TmuxCommandRunner trait and the real subprocess executor.
//!
//! Every call is a short synchronous `tmux` invocation bounded by a
//! timeout: queries get [`QUERY_TIMEOUT`], mutations get
//! [`MUTATION_TIMEOUT`]. The trait enables mock injection for tests.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::TmuxError;

/// Budget for read-only commands (list-panes, capture-pane, display-message).
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(500);
/// Budget for mutating commands (split-window, kill-pane, send-keys).
pub const MUTATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for executing tmux commands. Enables mock injection for testing.
pub trait TmuxCommandRunner: Send + Sync {
    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError>;

    fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        self.run_with_timeout(args, MUTATION_TIMEOUT)
    }

    fn query(&self, args: &[&str]) -> Result<String, TmuxError> {
        self.run_with_timeout(args, QUERY_TIMEOUT)
    }

    /// Run with bytes piped to stdin (load-buffer).
    fn run_with_input(
        &self,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<String, TmuxError>;
}

impl<T: TmuxCommandRunner + ?Sized> TmuxCommandRunner for &T {
    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        (**self).run_with_timeout(args, timeout)
    }

    fn run_with_input(
        &self,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<String, TmuxError> {
        (**self).run_with_input(args, input, timeout)
    }
}

/// Real tmux executor using `std::process::Command`.
pub struct TmuxExecutor {
    tmux_bin: String,
}

impl TmuxExecutor {
    pub fn new(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
        }
    }

    fn spawn(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, TmuxError> {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(TmuxError::Io)?;

        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            // Short writes only; tmux drains its stdin promptly.
            let bytes = bytes.to_vec();
            let writer = std::thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
            let _ = writer.join();
        }

        // Drain pipes on threads so a chatty capture cannot deadlock the
        // pipe buffer while we wait.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let out_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let err_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let status = match child.wait_timeout(timeout).map_err(TmuxError::Io)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TmuxError::Timeout(timeout));
            }
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(TmuxError::CommandFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxCommandRunner for TmuxExecutor {
    fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        self.spawn(args, None, timeout)
    }

    fn run_with_input(
        &self,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<String, TmuxError> {
        self.spawn(args, Some(input), timeout)
    }
}

pub mod testing {
    //! Scripted mock runner shared by adapter and engine tests.

    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and answers from a response script keyed on
    /// the subcommand (first argument).
    #[derive(Default)]
    pub struct MockRunner {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub responses: Mutex<Vec<(String, Result<String, String>)>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Upsert: a later respond() for the same subcommand replaces the
        /// earlier script, so tests can step the tmux world forward.
        pub fn respond(&self, subcommand: &str, output: &str) {
            let mut responses = self.responses.lock().unwrap();
            if let Some(slot) = responses.iter_mut().find(|(k, _)| k == subcommand) {
                slot.1 = Ok(output.to_string());
            } else {
                responses.push((subcommand.to_string(), Ok(output.to_string())));
            }
        }

        pub fn fail(&self, subcommand: &str, stderr: &str) {
            self.responses
                .lock()
                .unwrap()
                .push((subcommand.to_string(), Err(stderr.to_string())));
        }

        pub fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.first().map(String::as_str) == Some(subcommand))
                .cloned()
                .collect()
        }

        fn answer(&self, args: &[&str]) -> Result<String, TmuxError> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let sub = args.first().copied().unwrap_or_default();
            let responses = self.responses.lock().unwrap();
            match responses.iter().find(|(k, _)| k == sub) {
                Some((_, Ok(out))) => Ok(out.clone()),
                Some((_, Err(stderr))) => Err(TmuxError::CommandFailed {
                    exit_code: 1,
                    stderr: stderr.clone(),
                }),
                None => Ok(String::new()),
            }
        }
    }

    impl TmuxCommandRunner for MockRunner {
        fn run_with_timeout(&self, args: &[&str], _t: Duration) -> Result<String, TmuxError> {
            self.answer(args)
        }

        fn run_with_input(
            &self,
            args: &[&str],
            _input: &[u8],
            _t: Duration,
        ) -> Result<String, TmuxError> {
            self.answer(args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockRunner;
    use super::*;

    #[test]
    fn default_executor_uses_tmux_binary() {
        let exec = TmuxExecutor::default();
        assert_eq!(exec.tmux_bin, "tmux");
    }

    #[test]
    fn mock_answers_by_subcommand() {
        let mock = MockRunner::new();
        mock.respond("list-panes", "%0\tdmux\n");
        let out = mock.query(&["list-panes", "-a"]).unwrap();
        assert_eq!(out, "%0\tdmux\n");
        assert_eq!(mock.calls_for("list-panes").len(), 1);
    }

    #[test]
    fn mock_failure_maps_to_command_failed() {
        let mock = MockRunner::new();
        mock.fail("kill-pane", "can't find pane: %9");
        let err = mock.run(&["kill-pane", "-t", "%9"]).unwrap_err();
        assert!(err.is_pane_missing());
    }
}
