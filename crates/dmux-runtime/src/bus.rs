//! Pane event bus: one `panes-changed` stream, two back-ends.
//!
//! Hook mode installs tmux hooks that print into a FIFO; poll mode
//! snapshots `list-panes` on an interval. Both feed the same debounced
//! differ, which is the only place that decides panes appeared or
//! vanished at the tmux layer. Matching those ids to stored records is
//! the lifecycle controller's job.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use dmux_tmux::executor::TmuxCommandRunner;
use dmux_tmux::{TmuxAdapter, hooks};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusSource {
    Hooks,
    Polling,
}

#[derive(Debug, Clone)]
pub struct PanesChanged {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub source: BusSource,
    pub timestamp: DateTime<Utc>,
}

/// Diff two pane-id snapshots. Pure so the emit rule is testable.
pub fn diff_snapshot(known: &HashSet<String>, current: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut added: Vec<String> = current.difference(known).cloned().collect();
    let mut removed: Vec<String> = known.difference(current).cloned().collect();
    added.sort();
    removed.sort();
    (added, removed)
}

pub struct PaneEventBus<R> {
    adapter: Arc<TmuxAdapter<R>>,
    events_tx: broadcast::Sender<PanesChanged>,
    trigger_tx: mpsc::UnboundedSender<()>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    mode: Mutex<BusSource>,
    backend_cancel: Mutex<CancellationToken>,
    pipe_path: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> PaneEventBus<R> {
    pub fn new(
        adapter: Arc<TmuxAdapter<R>>,
        pipe_path: PathBuf,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Arc::new(PaneEventBus {
            adapter,
            events_tx,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            mode: Mutex::new(BusSource::Polling),
            backend_cancel: Mutex::new(cancel.child_token()),
            pipe_path,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            cancel,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanesChanged> {
        self.events_tx.subscribe()
    }

    pub fn mode(&self) -> BusSource {
        *self.mode.lock().unwrap()
    }

    /// Run a diff cycle without waiting for the poll interval.
    pub fn force_check(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Start the differ and the preferred back-end. Returns the mode
    /// actually selected (hook installation can fail, e.g. read-only
    /// filesystems, and falls back to polling).
    pub async fn start(self: &Arc<Self>, prefer_hooks: bool) -> BusSource {
        // Baseline snapshot so startup panes do not read as "added".
        let baseline = self.snapshot().await.unwrap_or_default();
        let Some(trigger_rx) = self.trigger_rx.lock().unwrap().take() else {
            // Already started; only the backend can change.
            return self.mode();
        };
        tokio::spawn(Self::differ_loop(self.clone(), trigger_rx, baseline));

        self.select_backend(prefer_hooks).await
    }

    /// Tear down the current back-end and bring up the requested one.
    /// Safe at runtime; the differ keeps running throughout.
    pub async fn select_backend(self: &Arc<Self>, prefer_hooks: bool) -> BusSource {
        // Stop the old backend.
        let old = {
            let mut guard = self.backend_cancel.lock().unwrap();
            let old = guard.clone();
            *guard = self.cancel.child_token();
            old
        };
        old.cancel();
        if self.mode() == BusSource::Hooks {
            if let Some(session) = self.adapter.session() {
                let _ = hooks::uninstall_hooks(self.adapter.runner(), session);
            }
        }

        let backend_cancel = self.backend_cancel.lock().unwrap().clone();
        let selected = if prefer_hooks {
            match self.start_hook_backend(backend_cancel.clone()) {
                Ok(()) => BusSource::Hooks,
                Err(e) => {
                    tracing::warn!(error = %e, "tmux hook mode unavailable, falling back to polling");
                    self.start_poll_backend(backend_cancel);
                    BusSource::Polling
                }
            }
        } else {
            self.start_poll_backend(backend_cancel);
            BusSource::Polling
        };

        *self.mode.lock().unwrap() = selected;
        tracing::info!(mode = ?selected, "pane event bus started");
        selected
    }

    // -----------------------------------------------------------------
    // Back-ends
    // -----------------------------------------------------------------

    fn start_hook_backend(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let session = self
            .adapter
            .session()
            .ok_or_else(|| anyhow::anyhow!("hook mode needs a session-scoped adapter"))?
            .to_string();

        if let Some(parent) = self.pipe_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match nix::unistd::mkfifo(&self.pipe_path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }

        hooks::install_hooks(self.adapter.runner(), &session, &self.pipe_path)?;

        // Open read+write: the held write end keeps the FIFO from hitting
        // EOF between hook firings.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.pipe_path)?;
        let trigger_tx = self.trigger_tx.clone();
        tokio::spawn(async move {
            let file = tokio::fs::File::from_std(file);
            let mut lines = tokio::io::BufReader::new(file).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(hook)) => {
                                tracing::debug!(hook = %hook.trim(), "tmux hook fired");
                                if trigger_tx.send(()).is_err() {
                                    return;
                                }
                            }
                            Ok(None) | Err(_) => return,
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
        Ok(())
    }

    fn start_poll_backend(self: &Arc<Self>, cancel: CancellationToken) {
        let trigger_tx = self.trigger_tx.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if trigger_tx.send(()).is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Differ
    // -----------------------------------------------------------------

    async fn snapshot(&self) -> Option<HashSet<String>> {
        let adapter = self.adapter.clone();
        let result = tokio::task::spawn_blocking(move || adapter.list_panes()).await;
        match result {
            Ok(Ok(panes)) => Some(panes.into_iter().map(|p| p.pane_id).collect()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "list-panes failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "list-panes task panicked");
                None
            }
        }
    }

    async fn differ_loop(
        bus: Arc<Self>,
        mut trigger_rx: mpsc::UnboundedReceiver<()>,
        baseline: HashSet<String>,
    ) {
        let mut known = baseline;
        loop {
            tokio::select! {
                trigger = trigger_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
                _ = bus.cancel.cancelled() => return,
            }

            // Debounce: a window-layout change fires several hooks at once.
            loop {
                match tokio::time::timeout(DEBOUNCE, trigger_rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            let Some(current) = bus.snapshot().await else {
                continue;
            };
            let (added, removed) = diff_snapshot(&known, &current);
            if added.is_empty() && removed.is_empty() {
                continue;
            }
            known = current;
            let event = PanesChanged {
                added,
                removed,
                source: bus.mode(),
                timestamp: Utc::now(),
            };
            tracing::debug!(added = ?event.added, removed = ?event.removed, "panes changed");
            let _ = bus.events_tx.send(event);
        }
    }
}
