//! High-level tmux operations over a [`TmuxCommandRunner`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TmuxError;
use crate::executor::{MUTATION_TIMEOUT, TmuxCommandRunner};

/// One pane as reported by `list-panes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneHandle {
    pub pane_id: String,
    pub title: String,
}

/// Options for `split_pane`.
#[derive(Debug, Clone, Default)]
pub struct SplitOpts {
    /// Pane to split relative to; current pane when absent.
    pub target: Option<String>,
    /// Horizontal split (`-h`); vertical otherwise.
    pub horizontal: bool,
    /// Percentage of the split given to the new pane.
    pub percent: Option<u8>,
    /// Working directory for the new pane.
    pub cwd: Option<PathBuf>,
}

/// The adapter owns argument construction and output parsing for every
/// tmux operation dmux performs. Generic over the runner for testability.
pub struct TmuxAdapter<R> {
    runner: R,
    /// Session all queries are scoped to, when set.
    session: Option<String>,
}

impl<R: TmuxCommandRunner> TmuxAdapter<R> {
    pub fn new(runner: R) -> Self {
        TmuxAdapter {
            runner,
            session: None,
        }
    }

    #[must_use]
    pub fn scoped_to(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    // -----------------------------------------------------------------
    // Pane topology
    // -----------------------------------------------------------------

    /// Split a new pane and return its tmux pane id.
    pub fn split_pane(&self, opts: &SplitOpts) -> Result<String, TmuxError> {
        let mut args: Vec<String> = vec!["split-window".into()];
        if opts.horizontal {
            args.push("-h".into());
        } else {
            args.push("-v".into());
        }
        if let Some(pct) = opts.percent {
            args.push("-p".into());
            args.push(pct.to_string());
        }
        if let Some(target) = &opts.target {
            args.push("-t".into());
            args.push(target.clone());
        }
        if let Some(cwd) = &opts.cwd {
            args.push("-c".into());
            args.push(cwd.display().to_string());
        }
        args.push("-P".into());
        args.push("-F".into());
        args.push("#{pane_id}".into());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.runner.run(&refs)?;
        let pane_id = out.trim().to_string();
        if pane_id.starts_with('%') {
            Ok(pane_id)
        } else {
            Err(TmuxError::Parse(format!(
                "split-window returned {out:?}, expected a pane id"
            )))
        }
    }

    pub fn kill_pane(&self, pane_id: &str) -> Result<(), TmuxError> {
        self.map_missing(pane_id, self.runner.run(&["kill-pane", "-t", pane_id]))?;
        Ok(())
    }

    /// List panes with titles, scoped to the adapter's session when set.
    pub fn list_panes(&self) -> Result<Vec<PaneHandle>, TmuxError> {
        let out = match &self.session {
            Some(session) => self.runner.query(&[
                "list-panes",
                "-s",
                "-t",
                session,
                "-F",
                "#{pane_id}\t#{pane_title}",
            ])?,
            None => self
                .runner
                .query(&["list-panes", "-a", "-F", "#{pane_id}\t#{pane_title}"])?,
        };
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let (pane_id, title) = line.split_once('\t').unwrap_or((line, ""));
                PaneHandle {
                    pane_id: pane_id.to_string(),
                    title: title.to_string(),
                }
            })
            .collect())
    }

    pub fn select_pane(&self, pane_id: &str) -> Result<(), TmuxError> {
        self.map_missing(pane_id, self.runner.run(&["select-pane", "-t", pane_id]))?;
        Ok(())
    }

    pub fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError> {
        self.map_missing(
            pane_id,
            self.runner
                .run(&["select-pane", "-t", pane_id, "-T", title]),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Capture
    // -----------------------------------------------------------------

    /// Visible buffer, last `lines` rows, plain text.
    pub fn capture_pane(&self, pane_id: &str, lines: usize) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        self.map_missing(
            pane_id,
            self.runner
                .query(&["capture-pane", "-t", pane_id, "-p", "-S", &start]),
        )
    }

    /// Full visible buffer with escape sequences, joined wrapped lines.
    pub fn capture_pane_escaped(&self, pane_id: &str) -> Result<String, TmuxError> {
        self.map_missing(
            pane_id,
            self.runner.query(&["capture-pane", "-t", pane_id, "-epJ"]),
        )
    }

    /// Cursor position as `(row, col)`.
    pub fn cursor_position(&self, pane_id: &str) -> Result<(u16, u16), TmuxError> {
        let out = self.map_missing(
            pane_id,
            self.runner.query(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{cursor_y},#{cursor_x}",
            ]),
        )?;
        parse_pair(out.trim(), ',')
    }

    /// Geometry and cursor in one query: `(width, height, cursor_row,
    /// cursor_col)`. The streamer polls this every frame, so one
    /// subprocess beats two.
    pub fn pane_geometry(&self, pane_id: &str) -> Result<(u16, u16, u16, u16), TmuxError> {
        let out = self.map_missing(
            pane_id,
            self.runner.query(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{pane_width} #{pane_height} #{cursor_y} #{cursor_x}",
            ]),
        )?;
        let parts: Vec<u16> = out
            .split_whitespace()
            .map(|p| p.parse().map_err(|_| TmuxError::Parse(format!("bad geometry: {out:?}"))))
            .collect::<Result<_, _>>()?;
        match parts.as_slice() {
            [w, h, row, col] => Ok((*w, *h, *row, *col)),
            _ => Err(TmuxError::Parse(format!("bad geometry: {out:?}"))),
        }
    }

    /// Pane geometry as `(width, height)`.
    pub fn pane_size(&self, pane_id: &str) -> Result<(u16, u16), TmuxError> {
        let out = self.map_missing(
            pane_id,
            self.runner.query(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{pane_width}x#{pane_height}",
            ]),
        )?;
        parse_pair(out.trim(), 'x')
    }

    // -----------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------

    /// Type a shell command into the pane and press Enter.
    pub fn send_shell_command(&self, pane_id: &str, command: &str) -> Result<(), TmuxError> {
        self.map_missing(
            pane_id,
            self.runner
                .run(&["send-keys", "-t", pane_id, "-l", command]),
        )?;
        self.runner.run(&["send-keys", "-t", pane_id, "Enter"])?;
        Ok(())
    }

    /// Send pre-translated key tokens (`C-c`, `Up`, `Enter`, ...).
    pub fn send_keys(&self, pane_id: &str, tokens: &[String]) -> Result<(), TmuxError> {
        let mut args: Vec<&str> = vec!["send-keys", "-t", pane_id];
        args.extend(tokens.iter().map(String::as_str));
        self.map_missing(pane_id, self.runner.run(&args))?;
        Ok(())
    }

    /// Send text verbatim, no key-name interpretation.
    pub fn send_literal(&self, pane_id: &str, text: &str) -> Result<(), TmuxError> {
        self.map_missing(
            pane_id,
            self.runner.run(&["send-keys", "-t", pane_id, "-l", text]),
        )?;
        Ok(())
    }

    /// Deliver raw bytes through a paste buffer. Used for byte sequences
    /// send-keys cannot express (Shift+Enter CSI) and very large prompts.
    pub fn paste_bytes(&self, pane_id: &str, bytes: &[u8]) -> Result<(), TmuxError> {
        const BUFFER: &str = "dmux-paste";
        self.runner.run_with_input(
            &["load-buffer", "-b", BUFFER, "-"],
            bytes,
            MUTATION_TIMEOUT,
        )?;
        let pasted = self.map_missing(
            pane_id,
            self.runner
                .run(&["paste-buffer", "-b", BUFFER, "-t", pane_id, "-p"]),
        );
        // Always try to drop the buffer, even when the paste failed.
        let _ = self.runner.run(&["delete-buffer", "-b", BUFFER]);
        pasted.map(|_| ())
    }

    // -----------------------------------------------------------------
    // Session/global plumbing
    // -----------------------------------------------------------------

    pub fn set_global_option(&self, key: &str, value: &str) -> Result<(), TmuxError> {
        self.runner.run(&["set-option", "-g", key, value])?;
        Ok(())
    }

    pub fn display_message(&self, format: &str) -> Result<String, TmuxError> {
        self.runner.query(&["display-message", "-p", format])
    }

    /// Redraw attached clients. Failure is cosmetic; callers swallow it.
    pub fn refresh_client(&self) -> Result<(), TmuxError> {
        self.runner.run(&["refresh-client", "-S"])?;
        Ok(())
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.runner
            .query(&["has-session", "-t", session])
            .is_ok()
    }

    pub fn new_session(&self, session: &str, cwd: &Path) -> Result<(), TmuxError> {
        self.runner.run(&[
            "new-session",
            "-d",
            "-s",
            session,
            "-c",
            &cwd.display().to_string(),
        ])?;
        Ok(())
    }

    pub fn run_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        self.runner.run_with_timeout(args, timeout)
    }

    /// Rewrite a generic command failure into `PaneNotFound` when the
    /// stderr says so, keeping the swallow-sites simple.
    fn map_missing(
        &self,
        pane_id: &str,
        result: Result<String, TmuxError>,
    ) -> Result<String, TmuxError> {
        result.map_err(|e| {
            if e.is_pane_missing() {
                TmuxError::PaneNotFound(pane_id.to_string())
            } else {
                e
            }
        })
    }
}

fn parse_pair(s: &str, sep: char) -> Result<(u16, u16), TmuxError> {
    let (a, b) = s
        .split_once(sep)
        .ok_or_else(|| TmuxError::Parse(format!("expected pair separated by {sep:?}: {s:?}")))?;
    let a = a
        .trim()
        .parse()
        .map_err(|_| TmuxError::Parse(format!("bad number in {s:?}")))?;
    let b = b
        .trim()
        .parse()
        .map_err(|_| TmuxError::Parse(format!("bad number in {s:?}")))?;
    Ok((a, b))
}
