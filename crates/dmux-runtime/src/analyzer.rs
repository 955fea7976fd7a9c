//! Per-pane status analyzer: capture, classify, then extract or summarize,
//! with a content-hash cache and in-flight request deduplication.
//!
//! One task per tracked pane, adaptive cadence (faster while the agent
//! works), suspended while a modal dialog is open. Raw classifications
//! pass through the stability window before anything is published.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use dmux_core::stability::StabilityWindow;
use dmux_core::types::{
    AgentKind, AgentStatus, DialogChoice, PaneRecord, PotentialHarm, ProjectConfig, StatusUpdate,
};
use dmux_llm::{CompletionRequest, ProviderChain};
use dmux_tmux::TmuxAdapter;
use dmux_tmux::executor::TmuxCommandRunner;

use crate::prompts::{
    Classification, classification_prompt, options_prompt, parse_classification, parse_options,
    parse_summary, summary_prompt,
};

pub const CAPTURE_LINES: usize = 50;
const WORKING_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_INTERVAL: Duration = Duration::from_secs(2);
const SUSPENDED_POLL: Duration = Duration::from_millis(500);
pub const CACHE_TTL: Duration = Duration::from_secs(5);
pub const CACHE_CAPACITY: usize = 100;

/// One cycle's raw result, cached by content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct PaneAnalysis {
    pub status: AgentStatus,
    pub options_question: Option<String>,
    pub options: Option<Vec<DialogChoice>>,
    pub potential_harm: Option<PotentialHarm>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl PaneAnalysis {
    fn status_only(status: AgentStatus) -> Self {
        PaneAnalysis {
            status,
            options_question: None,
            options: None,
            potential_harm: None,
            summary: None,
            error: None,
        }
    }
}

/// Emitted after the stability filter; the consumer merges it into the
/// pane record and persists through the store.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub pane_id: String,
    pub update: StatusUpdate,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// TTL + LRU cache keyed on content hash. Time is injected so tests can
/// step the clock.
pub struct AnalysisCache {
    entries: HashMap<String, (PaneAnalysis, Instant)>,
    order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
}

impl AnalysisCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        AnalysisCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity,
        }
    }

    pub fn get(&mut self, hash: &str, now: Instant) -> Option<PaneAnalysis> {
        match self.entries.get(hash) {
            Some((analysis, inserted)) if now.duration_since(*inserted) < self.ttl => {
                let analysis = analysis.clone();
                // Refresh recency.
                self.order.retain(|k| k != hash);
                self.order.push_back(hash.to_string());
                Some(analysis)
            }
            Some(_) => {
                self.entries.remove(hash);
                self.order.retain(|k| k != hash);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, hash: String, analysis: PaneAnalysis, now: Instant) {
        if !self.entries.contains_key(&hash) && self.entries.len() >= self.capacity {
            // Evict least-recently-used.
            while let Some(oldest) = self.order.pop_front() {
                if self.entries.remove(&oldest).is_some() {
                    break;
                }
            }
        }
        self.order.retain(|k| k != &hash);
        self.order.push_back(hash.clone());
        self.entries.insert(hash, (analysis, now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct StatusAnalyzer<R> {
    adapter: Arc<TmuxAdapter<R>>,
    chain: Arc<ProviderChain>,
    cache: Mutex<AnalysisCache>,
    /// In-flight pipeline runs keyed on `pane:hash`; joiners await the
    /// watch channel instead of issuing a second LLM call.
    inflight: Mutex<HashMap<String, watch::Receiver<Option<PaneAnalysis>>>>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
    dialog_open: AtomicBool,
    events_tx: mpsc::UnboundedSender<StatusEvent>,
    llm_timeout: Duration,
    cancel: CancellationToken,
}

impl<R: TmuxCommandRunner + 'static> StatusAnalyzer<R> {
    pub fn new(
        adapter: Arc<TmuxAdapter<R>>,
        chain: Arc<ProviderChain>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StatusEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let analyzer = Arc::new(StatusAnalyzer {
            adapter,
            chain,
            cache: Mutex::new(AnalysisCache::new(CACHE_TTL, CACHE_CAPACITY)),
            inflight: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            dialog_open: AtomicBool::new(false),
            events_tx,
            llm_timeout: Duration::from_secs(20),
            cancel,
        });
        (analyzer, events_rx)
    }

    /// The TUI sets this while a modal dialog is open; analysis suspends
    /// so LLM traffic stops competing with the user's decision.
    pub fn set_dialog_open(&self, open: bool) {
        self.dialog_open.store(open, Ordering::SeqCst);
    }

    /// Track/untrack panes to match the current config. Shell panes have
    /// no agent to analyze.
    pub fn sync_tracked(self: &Arc<Self>, config: &ProjectConfig) {
        let wanted: HashMap<String, String> = config
            .panes
            .iter()
            .filter(|p| p.agent != AgentKind::None)
            .map(|p| (p.id.clone(), p.tmux_pane_id.clone()))
            .collect();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|pane_id, cancel| {
            if wanted.contains_key(pane_id) {
                true
            } else {
                cancel.cancel();
                false
            }
        });
        for (pane_id, tmux_pane_id) in wanted {
            if !tasks.contains_key(&pane_id) {
                let cancel = self.cancel.child_token();
                tasks.insert(pane_id.clone(), cancel.clone());
                tokio::spawn(Self::pane_loop(self.clone(), pane_id, tmux_pane_id, cancel));
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    async fn pane_loop(
        analyzer: Arc<Self>,
        pane_id: String,
        tmux_pane_id: String,
        cancel: CancellationToken,
    ) {
        let mut window = StabilityWindow::new(AgentStatus::Unknown);
        let mut last_sent: Option<StatusUpdate> = None;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if analyzer.dialog_open.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(SUSPENDED_POLL) => continue,
                    _ = cancel.cancelled() => return,
                }
            }

            let capture = {
                let adapter = analyzer.adapter.clone();
                let target = tmux_pane_id.clone();
                tokio::task::spawn_blocking(move || adapter.capture_pane(&target, CAPTURE_LINES))
                    .await
            };

            let interval = match capture {
                Ok(Ok(content)) => {
                    let analysis = analyzer.analyze_content(&pane_id, &content).await;
                    let published = window.observe(analysis.status);
                    let update = build_update(&analysis, published);
                    if last_sent.as_ref() != Some(&update) {
                        last_sent = Some(update.clone());
                        let _ = analyzer.events_tx.send(StatusEvent {
                            pane_id: pane_id.clone(),
                            update,
                        });
                    }
                    if published == AgentStatus::Working {
                        WORKING_INTERVAL
                    } else {
                        IDLE_INTERVAL
                    }
                }
                Ok(Err(e)) if e.is_pane_missing() => {
                    // The bus/lifecycle will untrack us shortly.
                    IDLE_INTERVAL
                }
                Ok(Err(e)) => {
                    tracing::warn!(pane_id = %pane_id, error = %e, "capture failed");
                    IDLE_INTERVAL
                }
                Err(e) => {
                    tracing::warn!(pane_id = %pane_id, error = %e, "capture task panicked");
                    IDLE_INTERVAL
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Cache, then dedupe, then the LLM pipeline. For any `(pane, hash)` pair the
    /// pipeline runs at most once per TTL window.
    pub async fn analyze_content(&self, pane_id: &str, content: &str) -> PaneAnalysis {
        let hash = content_hash(content);
        if let Some(cached) = self.cache.lock().unwrap().get(&hash, Instant::now()) {
            return cached;
        }

        let key = format!("{pane_id}:{hash}");
        enum Role {
            Lead(watch::Sender<Option<PaneAnalysis>>),
            Join(watch::Receiver<Option<PaneAnalysis>>),
        }
        let role = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(rx) = inflight.get(&key) {
                Role::Join(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.clone(), rx);
                Role::Lead(tx)
            }
        };

        match role {
            Role::Join(mut rx) => loop {
                let ready = rx.borrow().clone();
                if let Some(analysis) = ready {
                    return analysis;
                }
                if rx.changed().await.is_err() {
                    // Lead dropped without publishing; degrade to busy.
                    return PaneAnalysis::status_only(AgentStatus::Working);
                }
            },
            Role::Lead(tx) => {
                let analysis = self.run_pipeline(content).await;
                self.cache
                    .lock()
                    .unwrap()
                    .insert(hash, analysis.clone(), Instant::now());
                let _ = tx.send(Some(analysis.clone()));
                self.inflight.lock().unwrap().remove(&key);
                analysis
            }
        }
    }

    async fn run_pipeline(&self, content: &str) -> PaneAnalysis {
        let classify_req = CompletionRequest::new(classification_prompt(content))
            .json()
            .with_max_tokens(64)
            .with_timeout(self.llm_timeout);
        let classification = self
            .chain
            .complete(&classify_req, &self.cancel.child_token())
            .await
            .as_deref()
            .and_then(parse_classification)
            // A failed classifier must read as busy, never as waiting.
            .unwrap_or(Classification::InProgress);

        match classification {
            Classification::InProgress => PaneAnalysis::status_only(AgentStatus::Working),
            Classification::OptionDialog => {
                let req = CompletionRequest::new(options_prompt(content))
                    .json()
                    .with_max_tokens(512)
                    .with_timeout(self.llm_timeout);
                match self
                    .chain
                    .complete(&req, &self.cancel.child_token())
                    .await
                    .as_deref()
                    .and_then(parse_options)
                {
                    Some(extraction) => PaneAnalysis {
                        status: AgentStatus::Waiting,
                        options_question: Some(extraction.question),
                        options: Some(extraction.options),
                        potential_harm: extraction.potential_harm,
                        summary: None,
                        error: None,
                    },
                    None => PaneAnalysis {
                        error: Some("failed to extract dialog options".to_string()),
                        ..PaneAnalysis::status_only(AgentStatus::Waiting)
                    },
                }
            }
            Classification::OpenPrompt => {
                let req = CompletionRequest::new(summary_prompt(content))
                    .json()
                    .with_max_tokens(256)
                    .with_timeout(self.llm_timeout);
                let summary = self
                    .chain
                    .complete(&req, &self.cancel.child_token())
                    .await
                    .as_deref()
                    .and_then(parse_summary);
                PaneAnalysis {
                    summary,
                    ..PaneAnalysis::status_only(AgentStatus::Idle)
                }
            }
        }
    }
}

/// Assemble the published update. Analysis fields ride along only when
/// the stability filter accepted the raw status; suppressed flickers
/// must not smuggle their fields into the record.
fn build_update(analysis: &PaneAnalysis, published: AgentStatus) -> StatusUpdate {
    if published != analysis.status {
        return StatusUpdate::status_only(published);
    }
    StatusUpdate {
        status: published,
        options_question: analysis.options_question.clone(),
        options: analysis.options.clone(),
        potential_harm: analysis.potential_harm.clone(),
        agent_summary: analysis.summary.clone(),
        analyzer_error: analysis.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// Autopilot
// ---------------------------------------------------------------------------

/// Keys to auto-send for a pane that just entered `waiting`, or `None`
/// when autopilot must stay hands-off: risk flagged, risk unknown, or an
/// ambiguous option set.
pub fn autopilot_keys(record: &PaneRecord) -> Option<Vec<String>> {
    if !record.autopilot || record.agent_status != AgentStatus::Waiting {
        return None;
    }
    // No explicit no-risk verdict, no autopilot.
    match &record.potential_harm {
        Some(harm) if !harm.has_risk => {}
        _ => return None,
    }
    let options = record.options.as_ref()?;
    let default = options.first()?;
    // More than one realistic choice is a human decision.
    if options.len() != 1 || default.keys.is_empty() {
        return None;
    }
    Some(default.keys.clone())
}

/// Consume status events: merge each update into the pane record through
/// the store (file, watcher, snapshot), then fire autopilot keys when
/// the merged record qualifies.
pub async fn run_status_consumer<R: TmuxCommandRunner + 'static>(
    store: Arc<crate::state::StateStore>,
    adapter: Arc<TmuxAdapter<R>>,
    mut events: mpsc::UnboundedReceiver<StatusEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        // Compute the post-merge record from the current snapshot; the
        // store's own copy only updates after the watcher round-trip.
        let config = store.config();
        let Some(mut merged) = config.pane(&event.pane_id).cloned() else {
            continue;
        };
        merged.apply_status_update(event.update.clone());

        let pane_id = event.pane_id.clone();
        let update = event.update;
        if let Err(e) = store.persist_panes(move |config| {
            if let Some(pane) = config.pane_mut(&pane_id) {
                pane.apply_status_update(update);
            }
        }) {
            tracing::warn!(error = %e, "status update persist failed");
            continue;
        }

        if let Some(keys) = autopilot_keys(&merged) {
            tracing::info!(pane_id = %event.pane_id, keys = ?keys, "autopilot accepting dialog");
            let adapter = adapter.clone();
            let target = merged.tmux_pane_id.clone();
            let _ = tokio::task::spawn_blocking(move || adapter.send_keys(&target, &keys)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dmux_llm::{CompletionProvider, LlmError};
    use std::sync::atomic::AtomicUsize;

    // -------------------------------------------------------------------
    // Cache
    // -------------------------------------------------------------------

    fn analysis(status: AgentStatus) -> PaneAnalysis {
        PaneAnalysis::status_only(status)
    }

    #[test]
    fn cache_hit_within_ttl() {
        let mut cache = AnalysisCache::new(Duration::from_secs(5), 10);
        let t0 = Instant::now();
        cache.insert("h1".into(), analysis(AgentStatus::Working), t0);
        assert!(cache.get("h1", t0 + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = AnalysisCache::new(Duration::from_secs(5), 10);
        let t0 = Instant::now();
        cache.insert("h1".into(), analysis(AgentStatus::Working), t0);
        assert!(cache.get("h1", t0 + Duration::from_secs(5)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_evicts_least_recently_used_at_capacity() {
        let mut cache = AnalysisCache::new(Duration::from_secs(60), 3);
        let t0 = Instant::now();
        cache.insert("a".into(), analysis(AgentStatus::Working), t0);
        cache.insert("b".into(), analysis(AgentStatus::Idle), t0);
        cache.insert("c".into(), analysis(AgentStatus::Waiting), t0);
        // Touch "a" so "b" becomes the LRU.
        cache.get("a", t0);
        cache.insert("d".into(), analysis(AgentStatus::Unknown), t0);

        assert_eq!(cache.len(), 3);
        assert!(cache.get("b", t0).is_none());
        assert!(cache.get("a", t0).is_some());
        assert!(cache.get("d", t0).is_some());
    }

    #[test]
    fn content_hash_is_stable_and_distinct() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    // -------------------------------------------------------------------
    // Pipeline with a counting provider
    // -------------------------------------------------------------------

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        response: String,
    }

    #[async_trait]
    impl CompletionProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn available(&self) -> bool {
            true
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn test_analyzer(
        response: &str,
    ) -> (
        Arc<StatusAnalyzer<dmux_tmux::executor::testing::MockRunner>>,
        Arc<AtomicUsize>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Arc::new(ProviderChain::new(vec![Box::new(CountingProvider {
            calls: calls.clone(),
            response: response.to_string(),
        })]));
        let adapter = Arc::new(TmuxAdapter::new(
            dmux_tmux::executor::testing::MockRunner::new(),
        ));
        let (analyzer, _rx) = StatusAnalyzer::new(adapter, chain, CancellationToken::new());
        (analyzer, calls)
    }

    #[tokio::test]
    async fn identical_content_invokes_llm_once() {
        let (analyzer, calls) = test_analyzer(r#"{"state":"in_progress"}"#);
        let a = analyzer.analyze_content("p1", "building...").await;
        let b = analyzer.analyze_content("p1", "building...").await;
        assert_eq!(a.status, AgentStatus::Working);
        assert_eq!(b.status, AgentStatus::Working);
        // in_progress needs exactly one call per unique content.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_content_invokes_llm_again() {
        let (analyzer, calls) = test_analyzer(r#"{"state":"in_progress"}"#);
        analyzer.analyze_content("p1", "step one").await;
        analyzer.analyze_content("p1", "step two").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_deduplicate() {
        let (analyzer, calls) = test_analyzer(r#"{"state":"in_progress"}"#);
        let a = analyzer.clone();
        let b = analyzer.clone();
        let (ra, rb) = tokio::join!(
            a.analyze_content("p1", "same frame"),
            b.analyze_content("p1", "same frame"),
        );
        assert_eq!(ra.status, AgentStatus::Working);
        assert_eq!(rb.status, AgentStatus::Working);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "joiner must not re-invoke the LLM");
    }

    #[tokio::test]
    async fn classifier_failure_reads_as_working() {
        let (analyzer, _calls) = test_analyzer("complete garbage");
        let analysis = analyzer.analyze_content("p1", "???").await;
        assert_eq!(analysis.status, AgentStatus::Working);
    }

    // -------------------------------------------------------------------
    // Update assembly
    // -------------------------------------------------------------------

    #[test]
    fn suppressed_status_drops_analysis_fields() {
        let analysis = PaneAnalysis {
            status: AgentStatus::Waiting,
            options_question: Some("q".into()),
            options: Some(vec![]),
            potential_harm: None,
            summary: None,
            error: None,
        };
        // Stability kept us on Working; the waiting fields must not leak.
        let update = build_update(&analysis, AgentStatus::Working);
        assert_eq!(update.status, AgentStatus::Working);
        assert!(update.options_question.is_none());
    }

    // -------------------------------------------------------------------
    // Autopilot
    // -------------------------------------------------------------------

    fn waiting_record(autopilot: bool, has_risk: Option<bool>, options: usize) -> PaneRecord {
        let mut r = PaneRecord::new("p1".into(), "s".into(), "%1".into(), AgentKind::Claude);
        r.autopilot = autopilot;
        r.agent_status = AgentStatus::Waiting;
        r.potential_harm = has_risk.map(|has_risk| PotentialHarm {
            has_risk,
            description: None,
        });
        r.options = Some(
            (0..options)
                .map(|i| DialogChoice {
                    action: format!("opt{i}"),
                    keys: vec![format!("{}", i + 1)],
                    description: None,
                })
                .collect(),
        );
        r
    }

    #[test]
    fn autopilot_sends_single_safe_option() {
        let r = waiting_record(true, Some(false), 1);
        assert_eq!(autopilot_keys(&r), Some(vec!["1".to_string()]));
    }

    #[test]
    fn autopilot_refuses_risk_or_ambiguity() {
        assert!(autopilot_keys(&waiting_record(true, Some(true), 1)).is_none());
        assert!(autopilot_keys(&waiting_record(true, None, 1)).is_none());
        assert!(autopilot_keys(&waiting_record(true, Some(false), 2)).is_none());
        assert!(autopilot_keys(&waiting_record(false, Some(false), 1)).is_none());
    }

    #[test]
    fn autopilot_ignores_non_waiting_panes() {
        let mut r = waiting_record(true, Some(false), 1);
        r.agent_status = AgentStatus::Working;
        assert!(autopilot_keys(&r).is_none());
    }
}
