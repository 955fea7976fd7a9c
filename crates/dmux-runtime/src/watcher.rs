//! Config file watcher: re-reads `.dmux/dmux.config.json` after writes
//! settle and feeds fresh parses into the state store.
//!
//! Two idempotence guards: a 100 ms settle debounce, and a content hash
//! so byte-identical rewrites never re-emit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dmux_core::logs::LogLevel;
use dmux_core::types::ProjectConfig;

use crate::state::StateStore;

const SETTLE: Duration = Duration::from_millis(100);

/// Keeps the notify watcher alive; dropping stops file events.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

pub fn spawn(store: Arc<StateStore>, cancel: CancellationToken) -> Result<ConfigWatcher> {
    let dmux_dir = store.project().dmux_dir();
    std::fs::create_dir_all(&dmux_dir)?;
    let config_path = store.project().config_path();

    let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();

    let watched_name = config_path.file_name().map(|n| n.to_os_string());
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        // Only the config file matters; settings changes go through the
        // HTTP/TUI paths which update the store themselves.
        let relevant = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| Some(n.to_os_string()) == watched_name).unwrap_or(false));
        if relevant {
            let _ = event_tx.send(());
        }
    })?;
    watcher.watch(&dmux_dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(run_loop(store, config_path, event_rx, cancel));

    Ok(ConfigWatcher { _watcher: watcher })
}

async fn run_loop(
    store: Arc<StateStore>,
    config_path: PathBuf,
    mut event_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    let mut last_hash: Option<[u8; 32]> = None;
    // Hash whatever is on disk at startup so the first real change wins
    // but a redundant initial event does not.
    if let Ok(bytes) = std::fs::read(&config_path) {
        last_hash = Some(Sha256::digest(&bytes).into());
    }

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                if event.is_none() {
                    return;
                }
                // Settle: coalesce the burst of events a rewrite produces.
                loop {
                    match tokio::time::timeout(SETTLE, event_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if store.watcher_paused() {
                    tracing::debug!("watcher paused, skipping config event");
                    continue;
                }
                reload(&store, &config_path, &mut last_hash);
            }
            _ = store.reload.notified() => {
                reload(&store, &config_path, &mut last_hash);
            }
            _ = cancel.cancelled() => return,
        }
    }
}

fn reload(store: &StateStore, config_path: &PathBuf, last_hash: &mut Option<[u8; 32]>) {
    let bytes = match std::fs::read(config_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "config file unreadable, keeping last snapshot");
            return;
        }
    };
    let hash: [u8; 32] = Sha256::digest(&bytes).into();
    if Some(hash) == *last_hash {
        return;
    }

    match serde_json::from_slice::<ProjectConfig>(&bytes) {
        Ok(config) => {
            *last_hash = Some(hash);
            tracing::debug!(panes = config.panes.len(), "config reloaded");
            store.update_panes(config);
        }
        Err(e) => {
            // Keep the last good snapshot; a later write will recover.
            store.log(
                LogLevel::Error,
                "config",
                format!("failed to parse dmux.config.json: {e}"),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectContext;
    use crate::state::StateEvent;
    use dmux_core::settings::Settings;
    use dmux_core::types::{AgentKind, PaneRecord};

    async fn setup() -> (Arc<StateStore>, ConfigWatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::discover(dir.path().to_path_buf(), dir.path().join("home"));
        let store = StateStore::new(ctx, Settings::default(), ProjectConfig::default());
        let watcher = spawn(store.clone(), CancellationToken::new()).unwrap();
        (store, watcher, dir)
    }

    fn one_pane_config() -> ProjectConfig {
        ProjectConfig {
            panes: vec![PaneRecord::new(
                "p1".into(),
                "fix-auth".into(),
                "%3".into(),
                AgentKind::Claude,
            )],
            ..ProjectConfig::default()
        }
    }

    async fn wait_for_panes(rx: &mut tokio::sync::broadcast::Receiver<StateEvent>) -> ProjectConfig {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for watcher")
                .unwrap();
            if let StateEvent::PanesUpdated(config) = event {
                return config;
            }
        }
    }

    #[tokio::test]
    async fn persist_round_trips_through_the_watcher() {
        let (store, _watcher, _dir) = setup().await;
        let mut rx = store.subscribe();

        store
            .persist_panes(|c| *c = one_pane_config())
            .unwrap();

        let config = wait_for_panes(&mut rx).await;
        assert_eq!(config.panes.len(), 1);
        assert_eq!(store.config().panes.len(), 1);
    }

    #[tokio::test]
    async fn identical_content_does_not_re_emit() {
        let (store, _watcher, _dir) = setup().await;
        let mut rx = store.subscribe();

        store.persist_panes(|c| *c = one_pane_config()).unwrap();
        let first = wait_for_panes(&mut rx).await;
        // last_updated is part of the bytes, so freeze it for the rewrite.
        let body = serde_json::to_string_pretty(&first).unwrap();
        crate::project::write_atomic(&store.project().config_path(), format!("{body}\n").as_bytes())
            .unwrap();
        crate::project::write_atomic(&store.project().config_path(), format!("{body}\n").as_bytes())
            .unwrap();

        // One reload for the new bytes at most; the identical rewrite is
        // swallowed by the hash check.
        let _ = tokio::time::timeout(Duration::from_millis(400), wait_for_panes(&mut rx)).await;
        let extra = tokio::time::timeout(Duration::from_millis(300), wait_for_panes(&mut rx)).await;
        assert!(extra.is_err(), "unexpected re-emission for identical bytes");
    }

    #[tokio::test]
    async fn parse_error_keeps_last_snapshot() {
        let (store, _watcher, _dir) = setup().await;
        let mut rx = store.subscribe();

        store.persist_panes(|c| *c = one_pane_config()).unwrap();
        wait_for_panes(&mut rx).await;

        std::fs::write(store.project().config_path(), "{broken").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.config().panes.len(), 1, "snapshot must survive a bad parse");
        assert!(store.unread_attention_count() >= 1, "parse error must be logged");
    }
}
