//! Terminal streamer: snapshot + diff patches for browser viewers.
//!
//! One capture task per pane with at least one subscriber; subscribers
//! share it and the task stops when the last one goes away. The wire
//! format is one `TYPE:<json>` message per line, types INIT | PATCH |
//! RESIZE | HEARTBEAT. Within a pane the stream is strictly ordered;
//! across panes there is no ordering contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dmux_tmux::TmuxAdapter;
use dmux_tmux::executor::TmuxCommandRunner;

const CAPTURE_INTERVAL: Duration = Duration::from_millis(200);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Outgoing per-subscriber buffer; a subscriber that falls this far
/// behind is treated as gone.
const SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub width: u16,
    pub height: u16,
    /// Escaped capture (`capture-pane -epJ`) of the full visible buffer.
    pub content: String,
    pub cursor_row: u16,
    pub cursor_col: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPayload {
    /// First row the patch replaces.
    pub start_row: usize,
    /// Replacement rows, escape sequences intact.
    pub lines: Vec<String>,
    pub cursor_row: u16,
    pub cursor_col: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Init(InitPayload),
    Patch(PatchPayload),
    Resize(ResizePayload),
    Heartbeat { timestamp: i64 },
}

impl StreamFrame {
    /// `TYPE:<json>` plus the terminating newline.
    pub fn encode(&self) -> String {
        let (tag, json) = match self {
            StreamFrame::Init(p) => ("INIT", serde_json::to_string(p)),
            StreamFrame::Patch(p) => ("PATCH", serde_json::to_string(p)),
            StreamFrame::Resize(p) => ("RESIZE", serde_json::to_string(p)),
            StreamFrame::Heartbeat { timestamp } => (
                "HEARTBEAT",
                serde_json::to_string(&serde_json::json!({ "timestamp": timestamp })),
            ),
        };
        match json {
            Ok(json) => format!("{tag}:{json}\n"),
            Err(_) => format!("{tag}:{{}}\n"),
        }
    }
}

/// Changed region between two captures of the same geometry. `None`
/// when the captures are identical; identical frames emit nothing.
/// A row-count change falls back to a full-screen patch.
pub fn diff_lines(old: &str, new: &str) -> Option<(usize, Vec<String>)> {
    if old == new {
        return None;
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    if old_lines.len() != new_lines.len() {
        return Some((0, new_lines.iter().map(|l| l.to_string()).collect()));
    }

    let n = new_lines.len();
    let mut first = 0;
    while first < n && old_lines[first] == new_lines[first] {
        first += 1;
    }
    let mut last = n;
    while last > first && old_lines[last - 1] == new_lines[last - 1] {
        last -= 1;
    }
    Some((
        first,
        new_lines[first..last].iter().map(|l| l.to_string()).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Streamer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneStreamStats {
    pub pane_id: String,
    pub subscribers: usize,
    pub messages: u64,
    pub bytes: u64,
}

struct StreamState {
    subscribers: Vec<mpsc::Sender<String>>,
    cancel: CancellationToken,
    messages: u64,
    bytes: u64,
}

pub struct TerminalStreamer<R> {
    adapter: Arc<TmuxAdapter<R>>,
    panes: Mutex<HashMap<String, StreamState>>,
    capture_interval: Duration,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> TerminalStreamer<R> {
    pub fn new(adapter: Arc<TmuxAdapter<R>>, cancel: CancellationToken) -> Arc<Self> {
        Self::with_intervals(adapter, CAPTURE_INTERVAL, HEARTBEAT_INTERVAL, cancel)
    }

    pub fn with_intervals(
        adapter: Arc<TmuxAdapter<R>>,
        capture_interval: Duration,
        heartbeat_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(TerminalStreamer {
            adapter,
            panes: Mutex::new(HashMap::new()),
            capture_interval,
            heartbeat_interval,
            cancel,
        })
    }

    /// Subscribe to a pane's stream. The first subscriber starts the
    /// capture task; later ones share it (each still gets its own INIT
    /// as the first frame of its own stream).
    pub fn subscribe(self: &Arc<Self>, pane_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut panes = self.panes.lock().unwrap();
        match panes.get_mut(pane_id) {
            Some(state) => {
                state.subscribers.push(tx);
                // Restart the capture task so the newcomer gets an INIT;
                // existing clients see one redundant full redraw.
                state.cancel.cancel();
                let fresh = self.cancel.child_token();
                state.cancel = fresh.clone();
                tokio::spawn(Self::capture_loop(self.clone(), pane_id.to_string(), fresh));
            }
            None => {
                let token = self.cancel.child_token();
                panes.insert(
                    pane_id.to_string(),
                    StreamState {
                        subscribers: vec![tx],
                        cancel: token.clone(),
                        messages: 0,
                        bytes: 0,
                    },
                );
                tokio::spawn(Self::capture_loop(self.clone(), pane_id.to_string(), token));
            }
        }
        rx
    }

    pub fn stats(&self) -> Vec<PaneStreamStats> {
        self.panes
            .lock()
            .unwrap()
            .iter()
            .map(|(pane_id, state)| PaneStreamStats {
                pane_id: pane_id.clone(),
                subscribers: state.subscribers.len(),
                messages: state.messages,
                bytes: state.bytes,
            })
            .collect()
    }

    /// Fan a frame out. Subscribers whose buffer is full or closed are
    /// dropped; returns how many remain.
    fn broadcast(&self, pane_id: &str, frame: &StreamFrame) -> usize {
        let encoded = frame.encode();
        let mut panes = self.panes.lock().unwrap();
        let Some(state) = panes.get_mut(pane_id) else {
            return 0;
        };
        state
            .subscribers
            .retain(|tx| tx.try_send(encoded.clone()).is_ok());
        let remaining = state.subscribers.len();
        if remaining > 0 {
            state.messages += 1;
            state.bytes += (encoded.len() * remaining) as u64;
        }
        remaining
    }

    fn drop_pane(&self, pane_id: &str) {
        if let Some(state) = self.panes.lock().unwrap().remove(pane_id) {
            state.cancel.cancel();
        }
    }

    async fn capture_loop(streamer: Arc<Self>, pane_id: String, cancel: CancellationToken) {
        let mut last_content: Option<String> = None;
        let mut last_size: Option<(u16, u16)> = None;
        let mut ticker = tokio::time::interval(streamer.capture_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Heartbeats start one interval out, not immediately.
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + streamer.heartbeat_interval,
            streamer.heartbeat_interval,
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let captured = {
                        let adapter = streamer.adapter.clone();
                        let target = pane_id.clone();
                        tokio::task::spawn_blocking(move || {
                            let content = adapter.capture_pane_escaped(&target)?;
                            let geometry = adapter.pane_geometry(&target)?;
                            Ok::<_, dmux_tmux::TmuxError>((content, geometry))
                        })
                        .await
                    };
                    let (content, (width, height, cursor_row, cursor_col)) = match captured {
                        Ok(Ok(pair)) => pair,
                        Ok(Err(e)) => {
                            if e.is_pane_missing() {
                                tracing::debug!(pane_id = %pane_id, "pane gone, stopping stream");
                                streamer.drop_pane(&pane_id);
                                return;
                            }
                            tracing::warn!(pane_id = %pane_id, error = %e, "stream capture failed");
                            continue;
                        }
                        Err(_) => continue,
                    };

                    let mut frames = Vec::new();
                    match &last_content {
                        None => frames.push(StreamFrame::Init(InitPayload {
                            width,
                            height,
                            content: content.clone(),
                            cursor_row,
                            cursor_col,
                        })),
                        Some(previous) => {
                            if last_size != Some((width, height)) {
                                frames.push(StreamFrame::Resize(ResizePayload { width, height }));
                            }
                            if let Some((start_row, lines)) = diff_lines(previous, &content) {
                                frames.push(StreamFrame::Patch(PatchPayload {
                                    start_row,
                                    lines,
                                    cursor_row,
                                    cursor_col,
                                }));
                            }
                        }
                    }
                    last_content = Some(content);
                    last_size = Some((width, height));

                    for frame in &frames {
                        if streamer.broadcast(&pane_id, frame) == 0 {
                            streamer.drop_pane(&pane_id);
                            return;
                        }
                    }
                    // Even with nothing to send, notice dead subscribers.
                    if streamer
                        .panes
                        .lock()
                        .unwrap()
                        .get_mut(&pane_id)
                        .map(|s| {
                            s.subscribers.retain(|tx| !tx.is_closed());
                            s.subscribers.len()
                        })
                        .unwrap_or(0)
                        == 0
                    {
                        streamer.drop_pane(&pane_id);
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = StreamFrame::Heartbeat {
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    if streamer.broadcast(&pane_id, &frame) == 0 {
                        streamer.drop_pane(&pane_id);
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmux_tmux::executor::testing::MockRunner;

    // -------------------------------------------------------------------
    // Frame encoding and diffing
    // -------------------------------------------------------------------

    #[test]
    fn frames_encode_as_type_colon_json() {
        let init = StreamFrame::Init(InitPayload {
            width: 80,
            height: 24,
            content: "hello".into(),
            cursor_row: 1,
            cursor_col: 2,
        });
        let line = init.encode();
        assert!(line.starts_with("INIT:"));
        assert!(line.ends_with('\n'));
        let json: serde_json::Value =
            serde_json::from_str(line.trim_start_matches("INIT:").trim()).unwrap();
        assert_eq!(json["width"], 80);
        assert_eq!(json["cursorRow"], 1);
        assert_eq!(json["cursorCol"], 2);

        assert!(
            StreamFrame::Heartbeat { timestamp: 123 }
                .encode()
                .starts_with("HEARTBEAT:")
        );
        assert!(
            StreamFrame::Resize(ResizePayload {
                width: 1,
                height: 2
            })
            .encode()
            .starts_with("RESIZE:")
        );
    }

    #[test]
    fn identical_captures_produce_no_patch() {
        assert_eq!(diff_lines("a\nb\nc", "a\nb\nc"), None);
    }

    #[test]
    fn diff_finds_changed_region() {
        let (start, lines) = diff_lines("a\nb\nc\nd", "a\nX\nY\nd").unwrap();
        assert_eq!(start, 1);
        assert_eq!(lines, vec!["X", "Y"]);
    }

    #[test]
    fn diff_single_line_change() {
        let (start, lines) = diff_lines("a\nb\nc", "a\nb\nZ").unwrap();
        assert_eq!(start, 2);
        assert_eq!(lines, vec!["Z"]);
    }

    #[test]
    fn diff_row_count_change_is_full_redraw() {
        let (start, lines) = diff_lines("a\nb", "a\nb\nc").unwrap();
        assert_eq!(start, 0);
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    // -------------------------------------------------------------------
    // Capture loop with a mock tmux
    // -------------------------------------------------------------------

    fn streamer_with(content: &str, heartbeat: Duration) -> Arc<TerminalStreamer<MockRunner>> {
        let mock = MockRunner::new();
        mock.respond("capture-pane", content);
        mock.respond("display-message", "80 24 0 0\n");
        TerminalStreamer::with_intervals(
            Arc::new(TmuxAdapter::new(mock)),
            Duration::from_millis(30),
            heartbeat,
            CancellationToken::new(),
        )
    }

    fn quiet_streamer(content: &str) -> Arc<TerminalStreamer<MockRunner>> {
        streamer_with(content, Duration::from_secs(60))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn first_frame_is_init_with_geometry() {
        let streamer = quiet_streamer("line one\nline two\n");
        let mut rx = streamer.subscribe("%1");
        let frame = next_frame(&mut rx).await;
        assert!(frame.starts_with("INIT:"), "got {frame}");
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("INIT:").trim()).unwrap();
        assert_eq!(json["width"], 80);
        assert_eq!(json["height"], 24);
        assert!(json["content"].as_str().unwrap().contains("line one"));
    }

    #[tokio::test]
    async fn changed_capture_produces_patch_idempotently() {
        let streamer = quiet_streamer("alpha\nbeta\n");
        let mut rx = streamer.subscribe("%1");
        let _init = next_frame(&mut rx).await;

        // Identical captures: nothing arrives.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err(), "no PATCH for identical captures");

        streamer
            .adapter
            .runner()
            .respond("capture-pane", "alpha\nGAMMA\n");
        let frame = next_frame(&mut rx).await;
        assert!(frame.starts_with("PATCH:"), "got {frame}");
        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("PATCH:").trim()).unwrap();
        assert_eq!(json["startRow"], 1);
        assert_eq!(json["lines"][0], "GAMMA");
    }

    #[tokio::test]
    async fn heartbeat_arrives_on_schedule() {
        let streamer = streamer_with("still\n", Duration::from_millis(300));
        let mut rx = streamer.subscribe("%1");
        let _init = next_frame(&mut rx).await;
        let frame = next_frame(&mut rx).await;
        assert!(frame.starts_with("HEARTBEAT:"), "got {frame}");
    }

    #[tokio::test]
    async fn dropping_last_subscriber_stops_the_stream() {
        let streamer = quiet_streamer("x\n");
        let rx = streamer.subscribe("%1");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(streamer.stats().len(), 1);

        drop(rx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(streamer.stats().is_empty(), "capture task must stop");
    }

    #[tokio::test]
    async fn stats_count_messages_and_bytes() {
        let streamer = quiet_streamer("content\n");
        let mut rx = streamer.subscribe("%1");
        let _ = next_frame(&mut rx).await;
        let stats = streamer.stats();
        assert_eq!(stats[0].subscribers, 1);
        assert!(stats[0].messages >= 1);
        assert!(stats[0].bytes > 0);
    }
}
