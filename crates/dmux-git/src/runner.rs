//! GitRunner trait and the real subprocess executor.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::GitError;

/// Merges and worktree creation can legitimately take a while.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw result of a git invocation for callers that care about the exit
/// code (conflict probes, existence checks).
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for executing git commands. Enables mock injection for testing.
pub trait GitRunner: Send + Sync {
    /// Run and fail on nonzero exit.
    fn run(&self, workdir: &Path, args: &[&str]) -> Result<String, GitError>;

    /// Run and hand back the exit code with both streams.
    fn run_unchecked(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput, GitError>;
}

impl<T: GitRunner + ?Sized> GitRunner for &T {
    fn run(&self, workdir: &Path, args: &[&str]) -> Result<String, GitError> {
        (**self).run(workdir, args)
    }

    fn run_unchecked(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        (**self).run_unchecked(workdir, args)
    }
}

/// Real git executor using `std::process::Command` with a timeout.
pub struct GitExecutor {
    git_bin: String,
    timeout: Duration,
}

impl GitExecutor {
    pub fn new(git_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut child = Command::new(&self.git_bin)
            .current_dir(workdir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(GitError::Io)?;

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

        let status = match child.wait_timeout(self.timeout).map_err(GitError::Io)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::Timeout(self.timeout));
            }
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        Ok(GitOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        })
    }
}

impl Default for GitExecutor {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitRunner for GitExecutor {
    fn run(&self, workdir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.spawn(workdir, args)?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    fn run_unchecked(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        self.spawn(workdir, args)
    }
}

pub mod testing {
    //! Scripted mock runner for repo/worktree/engine tests.

    use super::*;
    use std::sync::Mutex;

    /// Answers calls whose argument list starts with a scripted prefix,
    /// optionally constrained to a workdir suffix. Later scripts shadow
    /// earlier ones so a test can step the repo state forward. Unmatched
    /// calls succeed with empty output, which suits most plumbing.
    #[derive(Default)]
    pub struct MockGit {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        scripts: Mutex<Vec<(Option<String>, Vec<String>, GitOutput)>>,
    }

    impl MockGit {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, dir: Option<&str>, prefix: &[&str], out: GitOutput) {
            self.scripts.lock().unwrap().push((
                dir.map(|d| d.to_string()),
                prefix.iter().map(|s| s.to_string()).collect(),
                out,
            ));
        }

        pub fn respond(&self, prefix: &[&str], stdout: &str) {
            self.push(None, prefix, GitOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
        }

        /// Like `respond`, but only for calls whose workdir ends with
        /// `dir_suffix`, so a test can answer differently for the main
        /// repo and a worktree.
        pub fn respond_in(&self, dir_suffix: &str, prefix: &[&str], stdout: &str) {
            self.push(Some(dir_suffix), prefix, GitOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
        }

        pub fn fail(&self, prefix: &[&str], exit_code: i32, stderr: &str) {
            self.push(None, prefix, GitOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
        }

        pub fn fail_in(&self, dir_suffix: &str, prefix: &[&str], exit_code: i32, stderr: &str) {
            self.push(Some(dir_suffix), prefix, GitOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
        }

        pub fn fail_with_stdout(&self, prefix: &[&str], exit_code: i32, stdout: &str) {
            self.push(None, prefix, GitOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
        }

        pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, call)| {
                    call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b)
                })
                .map(|(_, call)| call.clone())
                .collect()
        }

        pub fn calls_in(&self, dir_suffix: &str, prefix: &[&str]) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(dir, call)| {
                    dir.ends_with(dir_suffix)
                        && call.len() >= prefix.len()
                        && call.iter().zip(prefix).all(|(a, b)| a == b)
                })
                .map(|(_, call)| call.clone())
                .collect()
        }

        fn answer(&self, workdir: &Path, args: &[&str]) -> GitOutput {
            let dir = workdir.display().to_string();
            self.calls
                .lock()
                .unwrap()
                .push((dir.clone(), args.iter().map(|s| s.to_string()).collect()));
            let scripts = self.scripts.lock().unwrap();
            for (dir_suffix, prefix, out) in scripts.iter().rev() {
                let dir_ok = dir_suffix.as_deref().is_none_or(|s| dir.ends_with(s));
                if dir_ok
                    && args.len() >= prefix.len()
                    && args.iter().zip(prefix).all(|(a, b)| *a == b.as_str())
                {
                    return out.clone();
                }
            }
            GitOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    }

    impl GitRunner for MockGit {
        fn run(&self, workdir: &Path, args: &[&str]) -> Result<String, GitError> {
            let out = self.answer(workdir, args);
            if out.success() {
                Ok(out.stdout)
            } else {
                Err(GitError::CommandFailed {
                    exit_code: out.exit_code,
                    stderr: out.stderr,
                })
            }
        }

        fn run_unchecked(&self, workdir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
            Ok(self.answer(workdir, args))
        }
    }
}
