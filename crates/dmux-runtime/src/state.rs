//! Process-wide state store: the single writer for the pane list and the
//! fan-out point for everything that renders or streams.
//!
//! Pane mutations never touch the in-memory copy directly. Writers go
//! through [`StateStore::persist_panes`], which rewrites the config file;
//! the config watcher re-reads it and calls [`StateStore::update_panes`],
//! giving every consumer the same total order of updates.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Notify, broadcast};

use dmux_core::logs::{LogFilter, LogLevel, LogRing};
use dmux_core::settings::Settings;
use dmux_core::toast::{ToastQueue, ToastSeverity};
use dmux_core::types::ProjectConfig;

use crate::project::{self, ProjectContext};

/// Snapshot events pushed to subscribers. Cloned per receiver.
#[derive(Debug, Clone)]
pub enum StateEvent {
    PanesUpdated(ProjectConfig),
    SettingsUpdated(Settings),
    LogsChanged,
    ToastsChanged,
}

struct StoreInner {
    config: ProjectConfig,
    settings: Settings,
    logs: LogRing,
    toasts: ToastQueue,
}

pub struct StateStore {
    ctx: ProjectContext,
    inner: RwLock<StoreInner>,
    tx: broadcast::Sender<StateEvent>,
    server_port: AtomicU16,
    /// Serializes read-modify-write cycles on the config file.
    persist_lock: std::sync::Mutex<()>,
    /// While set, the config watcher must not react to file events.
    watcher_paused: AtomicBool,
    /// Kicked on resume so the watcher re-reads whatever it skipped.
    pub(crate) reload: Notify,
}

impl StateStore {
    pub fn new(ctx: ProjectContext, settings: Settings, config: ProjectConfig) -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(StateStore {
            ctx,
            inner: RwLock::new(StoreInner {
                config,
                settings,
                logs: LogRing::default(),
                toasts: ToastQueue::default(),
            }),
            tx,
            server_port: AtomicU16::new(0),
            persist_lock: std::sync::Mutex::new(()),
            watcher_paused: AtomicBool::new(false),
            reload: Notify::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    pub fn project(&self) -> &ProjectContext {
        &self.ctx
    }

    // -----------------------------------------------------------------
    // Pane list
    // -----------------------------------------------------------------

    /// Cloned snapshot of the current config.
    pub fn config(&self) -> ProjectConfig {
        self.inner.read().unwrap().config.clone()
    }

    /// Called by the config watcher only, with a freshly parsed file.
    pub fn update_panes(&self, config: ProjectConfig) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.config = config.clone();
        }
        let _ = self.tx.send(StateEvent::PanesUpdated(config));
    }

    /// Mutate the pane list through the config file. The in-memory copy
    /// is untouched here; the watcher's re-read is the one true update.
    ///
    /// The read-modify-write bases on the FILE, not the snapshot: the
    /// snapshot lags by one watcher round-trip, and two quick writers
    /// basing on it would silently drop each other's mutation.
    pub fn persist_panes(
        &self,
        mutate: impl FnOnce(&mut ProjectConfig),
    ) -> Result<ProjectConfig> {
        let _guard = self.persist_lock.lock().unwrap();
        let mut config = match std::fs::read_to_string(self.ctx.config_path()) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| self.config()),
            Err(_) => self.config(),
        };
        mutate(&mut config);
        config.last_updated = Some(Utc::now());
        let body = serde_json::to_string_pretty(&config)?;
        project::write_atomic(&self.ctx.config_path(), format!("{body}\n").as_bytes())?;
        Ok(config)
    }

    // -----------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.inner.read().unwrap().settings.clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.settings = settings.clone();
        }
        let _ = self.tx.send(StateEvent::SettingsUpdated(settings));
    }

    // -----------------------------------------------------------------
    // Logs and toasts
    // -----------------------------------------------------------------

    pub fn log(
        &self,
        level: LogLevel,
        source: &str,
        message: impl Into<String>,
        pane_id: Option<String>,
    ) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!(source = source, "{message}"),
            LogLevel::Warn => tracing::warn!(source = source, "{message}"),
            LogLevel::Info => tracing::info!(source = source, "{message}"),
            LogLevel::Debug => tracing::debug!(source = source, "{message}"),
        }
        self.inner
            .write()
            .unwrap()
            .logs
            .push(level, source, message, pane_id, Utc::now());
        let _ = self.tx.send(StateEvent::LogsChanged);
    }

    pub fn log_entries(&self, filter: &LogFilter) -> Vec<dmux_core::logs::LogEntry> {
        self.inner
            .read()
            .unwrap()
            .logs
            .entries(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn unread_attention_count(&self) -> usize {
        self.inner.read().unwrap().logs.unread_attention_count()
    }

    pub fn with_logs<T>(&self, f: impl FnOnce(&mut LogRing) -> T) -> T {
        let out = f(&mut self.inner.write().unwrap().logs);
        let _ = self.tx.send(StateEvent::LogsChanged);
        out
    }

    /// Every toast is mirrored into the log ring.
    pub fn toast(&self, message: impl Into<String>, severity: ToastSeverity) {
        let message = message.into();
        let level = match severity {
            ToastSeverity::Error => LogLevel::Error,
            ToastSeverity::Warning => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        {
            let mut inner = self.inner.write().unwrap();
            inner.toasts.push(message.clone(), severity, Utc::now());
            inner.logs.push(level, "toast", message, None, Utc::now());
        }
        let _ = self.tx.send(StateEvent::ToastsChanged);
    }

    pub fn with_toasts<T>(&self, f: impl FnOnce(&mut ToastQueue) -> T) -> T {
        f(&mut self.inner.write().unwrap().toasts)
    }

    // -----------------------------------------------------------------
    // Server port, watcher pause
    // -----------------------------------------------------------------

    pub fn set_server_port(&self, port: u16) {
        self.server_port.store(port, Ordering::Relaxed);
    }

    pub fn server_port(&self) -> u16 {
        self.server_port.load(Ordering::Relaxed)
    }

    /// Bracket a multi-step write so the watcher does not re-emit for
    /// every intermediate file state.
    pub fn pause_watcher(&self) {
        self.watcher_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_watcher(&self) {
        self.watcher_paused.store(false, Ordering::SeqCst);
        self.reload.notify_one();
    }

    pub fn watcher_paused(&self) -> bool {
        self.watcher_paused.load(Ordering::SeqCst)
    }
}
