//! HTTP facade: JSON routes for panes, snapshots, keys, settings, logs,
//! actions with dialog callbacks, and the NDJSON terminal stream.
//!
//! Everything user-visible flows through the same `ActionResult`
//! contract as the TUI; the only HTTP-specific machinery is the
//! callback registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use dmux_core::logs::{LogFilter, LogLevel};
use dmux_core::types::{AgentKind, DevStatus, PaneRecord, TestStatus};
use dmux_git::runner::GitRunner;
use dmux_tmux::executor::TmuxCommandRunner;
use dmux_tmux::keyspec::{KeyDispatch, KeySpec, translate};
use dmux_tmux::TmuxAdapter;

use crate::actions::{ActionDispatcher, CallbackRegistry, available_actions};
use crate::analyzer::StatusAnalyzer;
use crate::hookrun::{HookRunner, KNOWN_HOOKS};
use crate::lifecycle::{CreateOutcome, CreatePaneRequest};
use crate::state::StateStore;
use crate::streamer::TerminalStreamer;

pub struct AppState<RT, RG> {
    pub store: Arc<StateStore>,
    pub tmux: Arc<TmuxAdapter<RT>>,
    pub streamer: Arc<TerminalStreamer<RT>>,
    pub analyzer: Arc<StatusAnalyzer<RT>>,
    pub dispatcher: Arc<ActionDispatcher<RT, RG>>,
    pub registry: Arc<CallbackRegistry>,
    pub hooks: Arc<HookRunner>,
}

impl<RT, RG> Clone for AppState<RT, RG> {
    fn clone(&self) -> Self {
        AppState {
            store: self.store.clone(),
            tmux: self.tmux.clone(),
            streamer: self.streamer.clone(),
            analyzer: self.analyzer.clone(),
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

pub fn router<RT, RG>(state: AppState<RT, RG>) -> Router
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session", get(session))
        .route("/api/panes", get(list_panes).post(create_pane))
        .route("/api/panes/{id}", get(get_pane))
        .route("/api/panes/{id}/snapshot", get(pane_snapshot))
        .route("/api/panes/{id}/test", put(put_test_status))
        .route("/api/panes/{id}/dev", put(put_dev_status))
        .route("/api/panes/{id}/pr", put(put_pr_status))
        .route("/api/panes/{id}/actions", get(pane_actions))
        .route("/api/panes/{id}/actions/{action_id}", post(run_action))
        .route("/api/actions", get(all_actions))
        .route("/api/callbacks/confirm/{id}", post(callback_confirm))
        .route("/api/callbacks/choice/{id}", post(callback_choice))
        .route("/api/callbacks/input/{id}", post(callback_input))
        .route("/api/keys/{id}", post(send_key))
        .route("/api/stream/{id}", get(stream_pane))
        .route("/api/stream-stats", get(stream_stats))
        .route("/api/settings", get(get_settings).patch(patch_settings))
        .route("/api/hooks", get(list_hooks))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/mark-read", post(mark_logs_read))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Bind and serve until cancelled. Returns the actual port (useful with
/// port 0).
pub async fn serve<RT, RG>(
    state: AppState<RT, RG>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<u16>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    let app = router(state);
    tokio::spawn(async move {
        let shutdown = cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http server exited");
        }
    });
    tracing::info!(port = port, "http server listening");
    Ok(port)
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": what}))).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn find_pane<RT, RG>(state: &AppState<RT, RG>, id: &str) -> Option<PaneRecord> {
    state.store.config().pane(id).cloned()
}

// ---------------------------------------------------------------------------
// Basic routes
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "timestamp": Utc::now().to_rfc3339()}))
}

async fn session<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let project = state.store.project();
    Json(json!({
        "projectName": project.name,
        "projectRoot": project.root,
        "sessionName": project.session_name,
        "settings": state.store.settings(),
        "paneCount": state.store.config().panes.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn list_panes<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let project = state.store.project();
    Json(json!({
        "panes": state.store.config().panes,
        "projectName": project.name,
        "sessionName": project.session_name,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Deserialize)]
struct CreatePaneBody {
    prompt: String,
    #[serde(default)]
    agent: Option<String>,
    /// Exactly two distinct agents requests an A/B pair on a shared
    /// base slug.
    #[serde(default)]
    agents: Option<Vec<String>>,
}

async fn create_pane<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Json(body): Json<CreatePaneBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if let Some(raw_agents) = body.agents {
        let mut pair = Vec::new();
        for raw in &raw_agents {
            match AgentKind::parse(raw) {
                Ok(agent) => pair.push(agent),
                Err(e) => return bad_request(e.to_string()),
            }
        }
        let [first, second] = pair.as_slice() else {
            return bad_request("pair creation takes exactly two agents".to_string());
        };
        if first == second {
            return bad_request("pair agents must differ".to_string());
        }
        return match state
            .dispatcher
            .lifecycle
            .create_pair(&body.prompt, (*first, *second))
            .await
        {
            Ok((a, b)) => Json(json!({"success": true, "panes": [a, b]})).into_response(),
            Err(e) => bad_request(format!("{e:#}")),
        };
    }

    let agent = match body.agent.as_deref() {
        None => None,
        Some(raw) => match AgentKind::parse(raw) {
            Ok(agent) => Some(agent),
            Err(e) => return bad_request(e.to_string()),
        },
    };
    let outcome = state
        .dispatcher
        .lifecycle
        .create_pane(CreatePaneRequest {
            prompt: body.prompt,
            agent,
        })
        .await;
    match outcome {
        Ok(CreateOutcome::Created(pane)) => {
            Json(json!({"success": true, "pane": pane})).into_response()
        }
        Ok(CreateOutcome::NeedsAgentChoice(agents)) => Json(json!({
            "needsAgentChoice": true,
            "availableAgents": agents,
        }))
        .into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn get_pane<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match find_pane(&state, &id) {
        Some(pane) => Json(json!({"pane": pane})).into_response(),
        None => not_found("pane not found"),
    }
}

async fn pane_snapshot<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let Some(pane) = find_pane(&state, &id) else {
        return not_found("pane not found");
    };
    let tmux = state.tmux.clone();
    let target = pane.tmux_pane_id.clone();
    let captured = tokio::task::spawn_blocking(move || {
        let content = tmux.capture_pane_escaped(&target)?;
        let geometry = tmux.pane_geometry(&target)?;
        Ok::<_, dmux_tmux::TmuxError>((content, geometry))
    })
    .await;
    match captured {
        Ok(Ok((content, (width, height, cursor_row, cursor_col)))) => Json(json!({
            "content": content,
            "width": width,
            "height": height,
            "cursorRow": cursor_row,
            "cursorCol": cursor_col,
        }))
        .into_response(),
        Ok(Err(e)) => bad_request(format!("capture failed: {e}")),
        Err(e) => bad_request(format!("capture failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Hook-driven statuses
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TestStatusBody {
    status: TestStatus,
}

async fn put_test_status<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<TestStatusBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if find_pane(&state, &id).is_none() {
        return not_found("pane not found");
    }
    let result = state.store.persist_panes(move |config| {
        if let Some(pane) = config.pane_mut(&id) {
            pane.test_status = Some(body.status);
        }
    });
    match result {
        Ok(_) => Json(json!({"success": true})).into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

#[derive(Deserialize)]
struct DevStatusBody {
    status: DevStatus,
    #[serde(default)]
    url: Option<String>,
}

async fn put_dev_status<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<DevStatusBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if find_pane(&state, &id).is_none() {
        return not_found("pane not found");
    }
    let result = state.store.persist_panes(move |config| {
        if let Some(pane) = config.pane_mut(&id) {
            pane.dev_status = Some(body.status);
            if body.url.is_some() {
                pane.dev_url = body.url;
            }
        }
    });
    match result {
        Ok(_) => Json(json!({"success": true})).into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

#[derive(Deserialize)]
struct PrStatusBody {
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Hooks that open PRs report back here (e.g. from `pre_pr`).
async fn put_pr_status<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<PrStatusBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    if find_pane(&state, &id).is_none() {
        return not_found("pane not found");
    }
    let result = state.store.persist_panes(move |config| {
        if let Some(pane) = config.pane_mut(&id) {
            if body.number.is_some() {
                pane.pr_number = body.number;
            }
            if body.url.is_some() {
                pane.pr_url = body.url;
            }
            if body.status.is_some() {
                pane.pr_status = body.status;
            }
        }
    });
    match result {
        Ok(_) => Json(json!({"success": true})).into_response(),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

// ---------------------------------------------------------------------------
// Actions and callbacks
// ---------------------------------------------------------------------------

async fn all_actions<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    // The full catalogue: what a worktree-backed agent pane would offer.
    let mut template = PaneRecord::new(
        "template".into(),
        "template".into(),
        "%0".into(),
        AgentKind::Claude,
    );
    template.worktree_path = Some(state.store.project().worktrees_dir());
    Json(json!({"actions": available_actions(&template, &state.store.settings())}))
}

async fn pane_actions<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match find_pane(&state, &id) {
        Some(pane) => Json(json!({
            "actions": available_actions(&pane, &state.store.settings())
        }))
        .into_response(),
        None => not_found("pane not found"),
    }
}

async fn run_action<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path((id, action_id)): Path<(String, String)>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let result = state.dispatcher.dispatch(&id, &action_id).await;
    Json(state.registry.encode(result)).into_response()
}

#[derive(Deserialize)]
struct ConfirmBody {
    confirmed: bool,
}

async fn callback_confirm<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<ConfirmBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match state.registry.resolve_confirm(&id, body.confirmed) {
        Some(future) => Json(state.registry.encode(future.await)).into_response(),
        None => not_found("callback expired or unknown"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChoiceBody {
    option_id: String,
}

async fn callback_choice<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<ChoiceBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match state.registry.resolve_choice(&id, body.option_id) {
        Some(future) => Json(state.registry.encode(future.await)).into_response(),
        None => not_found("callback expired or unknown"),
    }
}

#[derive(Deserialize)]
struct InputBody {
    value: String,
}

async fn callback_input<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    match state.registry.resolve_input(&id, body.value) {
        Some(future) => Json(state.registry.encode(future.await)).into_response(),
        None => not_found("callback expired or unknown"),
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyBody {
    key: String,
    #[serde(default)]
    ctrl_key: bool,
    #[serde(default)]
    alt_key: bool,
    #[serde(default)]
    shift_key: bool,
    #[serde(default)]
    meta_key: bool,
}

async fn send_key<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
    Json(body): Json<KeyBody>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let Some(pane) = find_pane(&state, &id) else {
        return not_found("pane not found");
    };
    let spec = KeySpec {
        key: body.key,
        ctrl: body.ctrl_key,
        alt: body.alt_key,
        shift: body.shift_key,
        meta: body.meta_key,
    };
    let dispatch = match translate(&spec) {
        Ok(dispatch) => dispatch,
        Err(e) => return bad_request(format!("{e}")),
    };
    let tmux = state.tmux.clone();
    let target = pane.tmux_pane_id.clone();
    let sent = tokio::task::spawn_blocking(move || match dispatch {
        KeyDispatch::Tokens(tokens) => tmux.send_keys(&target, &tokens),
        KeyDispatch::Literal(text) => tmux.send_literal(&target, &text),
        KeyDispatch::Paste(bytes) => tmux.paste_bytes(&target, &bytes),
    })
    .await;
    match sent {
        Ok(Ok(())) => Json(json!({"success": true})).into_response(),
        Ok(Err(e)) => bad_request(format!("send failed: {e}")),
        Err(e) => bad_request(format!("send failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

async fn stream_pane<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Path(id): Path<String>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let Some(pane) = find_pane(&state, &id) else {
        return not_found("pane not found");
    };
    let rx = state.streamer.subscribe(&pane.tmux_pane_id);
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::io::Error>(Bytes::from(frame)), rx))
    });
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn stream_stats<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    Json(json!({"streams": state.streamer.stats()}))
}

// ---------------------------------------------------------------------------
// Settings, hooks, logs
// ---------------------------------------------------------------------------

async fn get_settings<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    Json(json!({"settings": state.store.settings()}))
}

async fn patch_settings<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Json(patch): Json<Value>,
) -> Response
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let current = state.store.settings();
    match current.patched(&patch) {
        Ok(updated) => {
            if let Err(e) =
                crate::project::save_project_settings(state.store.project(), &updated)
            {
                return bad_request(format!("failed to save settings: {e:#}"));
            }
            state.store.update_settings(updated);
            Json(json!({"settings": state.store.settings()})).into_response()
        }
        Err(e) => bad_request(format!("invalid settings patch: {e}")),
    }
}

async fn list_hooks<RT, RG>(State(state): State<AppState<RT, RG>>) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let hooks: Vec<Value> = KNOWN_HOOKS
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "installed": state.hooks.resolve(name).is_some(),
            })
        })
        .collect();
    Json(json!({"hooks": hooks}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    #[serde(default)]
    level: Option<LogLevel>,
    #[serde(default)]
    pane_id: Option<String>,
    #[serde(default)]
    unread_only: Option<bool>,
}

async fn get_logs<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    let filter = LogFilter {
        level: query.level,
        source: None,
        pane_id: query.pane_id,
        unread_only: query.unread_only.unwrap_or(false),
    };
    Json(json!({
        "logs": state.store.log_entries(&filter),
        "unreadAttention": state.store.unread_attention_count(),
    }))
}

#[derive(Deserialize)]
struct MarkReadBody {
    #[serde(default)]
    level: Option<LogLevel>,
    #[serde(default)]
    ids: Option<Vec<u64>>,
}

async fn mark_logs_read<RT, RG>(
    State(state): State<AppState<RT, RG>>,
    Json(body): Json<MarkReadBody>,
) -> Json<Value>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    state.store.with_logs(|logs| match (&body.ids, body.level) {
        (Some(ids), _) => logs.mark_as_read(ids),
        (None, Some(level)) => logs.mark_level_as_read(level),
        (None, None) => logs.mark_all_as_read(),
    });
    Json(json!({"success": true}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::CALLBACK_TTL;
    use crate::hookrun::HookRunner;
    use crate::lifecycle::{CloseLocks, LifecycleController};
    use crate::merge::MergeEngine;
    use crate::project::ProjectContext;
    use dmux_core::settings::Settings;
    use dmux_core::types::ProjectConfig;
    use dmux_git::Git;
    use dmux_git::runner::testing::MockGit;
    use dmux_llm::ProviderChain;
    use dmux_tmux::executor::testing::MockRunner;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    type TestState = AppState<MockRunner, MockGit>;

    fn test_state(dir: &std::path::Path) -> TestState {
        let ctx = ProjectContext::discover(dir.to_path_buf(), dir.join("home"));
        let store = StateStore::new(ctx.clone(), Settings::default(), ProjectConfig::default());
        let mock = MockRunner::new();
        mock.respond("split-window", "%5\n");
        mock.respond("capture-pane", "hello world\n");
        mock.respond("display-message", "80 24 2 3\n");
        let tmux = Arc::new(TmuxAdapter::new(mock));
        let git = Arc::new(Git::new(MockGit::new()));
        let chain = Arc::new(ProviderChain::new(vec![]));
        let hooks = Arc::new(HookRunner::new(&ctx));
        let lifecycle = LifecycleController::new(
            tmux.clone(),
            git,
            store.clone(),
            chain.clone(),
            CloseLocks::new(),
            hooks.clone(),
        );
        let merge = MergeEngine::new(lifecycle.clone());
        let cancel = CancellationToken::new();
        let (analyzer, _rx) = StatusAnalyzer::new(tmux.clone(), chain, cancel.clone());
        AppState {
            store,
            tmux: tmux.clone(),
            streamer: TerminalStreamer::new(tmux, cancel),
            analyzer,
            dispatcher: ActionDispatcher::new(lifecycle, merge),
            registry: CallbackRegistry::new(CALLBACK_TTL),
            hooks,
        }
    }

    fn seed_pane(state: &TestState, id: &str, worktree: bool) {
        let mut record = PaneRecord::new(
            id.to_string(),
            format!("slug-{id}"),
            "%1".into(),
            AgentKind::Claude,
        );
        if worktree {
            record.worktree_path = Some(state.store.project().worktree_path(&record.slug));
        }
        let mut config = state.store.config();
        config.panes.push(record);
        state.store.update_panes(config);
    }

    async fn request(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::from(body.to_string())).unwrap()
            }
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, body) = request(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn panes_listing_carries_project_identity() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "p1", true);
        let app = router(state);
        let (status, body) = request(&app, "GET", "/api/panes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["panes"].as_array().unwrap().len(), 1);
        assert_eq!(body["panes"][0]["id"], "p1");
        assert_eq!(body["panes"][0]["tmuxPaneId"], "%1");
        assert!(body["sessionName"].as_str().unwrap().starts_with("dmux-"));
    }

    #[tokio::test]
    async fn unknown_pane_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, _) = request(&app, "GET", "/api/panes/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn snapshot_returns_buffer_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "p1", false);
        let app = router(state);
        let (status, body) = request(&app, "GET", "/api/panes/p1/snapshot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["content"].as_str().unwrap().contains("hello world"));
        assert_eq!(body["width"], 80);
        assert_eq!(body["cursorRow"], 2);
        assert_eq!(body["cursorCol"], 3);
    }

    #[tokio::test]
    async fn create_pane_with_bad_agent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, body) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "x", "agent": "cursor"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cursor"));
    }

    #[tokio::test]
    async fn create_pane_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, body) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "fix the auth bug", "agent": "claude"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["pane"]["agent"], "claude");
        assert_eq!(body["pane"]["prompt"], "fix the auth bug");
        assert!(body["pane"]["worktreePath"].as_str().unwrap().contains(".dmux/worktrees/"));
    }

    #[tokio::test]
    async fn create_pane_pair_creates_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, body) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "add login", "agents": ["claude", "opencode"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let panes = body["panes"].as_array().unwrap();
        assert_eq!(panes.len(), 2);
        assert!(
            panes[0]["slug"]
                .as_str()
                .unwrap()
                .ends_with("-claude-code")
        );
        assert!(panes[1]["slug"].as_str().unwrap().ends_with("-opencode"));
        // Shared base: the slugs only differ by suffix.
        let base_a = panes[0]["slug"].as_str().unwrap().trim_end_matches("-claude-code");
        let base_b = panes[1]["slug"].as_str().unwrap().trim_end_matches("-opencode");
        assert_eq!(base_a, base_b);
    }

    #[tokio::test]
    async fn create_pane_pair_rejects_bad_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "x", "agents": ["claude"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("exactly two"));

        let (status, _) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "x", "agents": ["claude", "claude"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = request(
            &app,
            "POST",
            "/api/panes",
            Some(json!({"prompt": "x", "agents": ["claude", "cursor"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_put_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "p1", true);
        let store = state.store.clone();
        let app = router(state);

        let (status, _) = request(
            &app,
            "PUT",
            "/api/panes/p1/test",
            Some(json!({"status": "passed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let on_disk: ProjectConfig = serde_json::from_str(
            &std::fs::read_to_string(store.project().config_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.panes[0].test_status, Some(TestStatus::Passed));
    }

    #[tokio::test]
    async fn action_listing_respects_availability() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "shell", false);
        let app = router(state);
        let (_, body) = request(&app, "GET", "/api/panes/shell/actions", None).await;
        let ids: Vec<&str> = body["actions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["id"].as_str().unwrap())
            .collect();
        assert!(!ids.contains(&"merge"));
        assert!(ids.contains(&"close"));
    }

    #[tokio::test]
    async fn close_action_round_trips_through_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "p1", false);
        let app = router(state);

        let (status, body) =
            request(&app, "POST", "/api/panes/p1/actions/close", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "choice");
        let callback_id = body["callbackId"].as_str().unwrap();

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/callbacks/choice/{callback_id}"),
            Some(json!({"optionId": "kill_only"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "success");

        // Callback is one-shot.
        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/callbacks/choice/{callback_id}"),
            Some(json!({"optionId": "kill_only"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn keys_route_translates_and_sends() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        seed_pane(&state, "p1", false);
        let tmux = state.tmux.clone();
        let app = router(state);

        let (status, _) = request(
            &app,
            "POST",
            "/api/keys/p1",
            Some(json!({"key": "Enter"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let calls = tmux.runner().calls_for("send-keys");
        assert!(calls.iter().any(|c| c.contains(&"Enter".to_string())));

        // Shift+Enter goes through the paste buffer.
        let (status, _) = request(
            &app,
            "POST",
            "/api/keys/p1",
            Some(json!({"key": "Enter", "shiftKey": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tmux.runner().calls_for("load-buffer").len(), 1);
        assert_eq!(tmux.runner().calls_for("paste-buffer").len(), 1);
    }

    #[tokio::test]
    async fn settings_patch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let store = state.store.clone();
        let app = router(state);

        let (status, body) = request(
            &app,
            "PATCH",
            "/api/settings",
            Some(json!({"useTmuxHooks": false, "branchPrefix": "dmux/"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["useTmuxHooks"], false);
        assert_eq!(store.settings().branch_prefix, "dmux/");
        assert!(store.project().settings_path().is_file());
    }

    #[tokio::test]
    async fn logs_filter_and_mark_read() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .store
            .log(LogLevel::Error, "merge", "boom", Some("p1".into()));
        state.store.log(LogLevel::Info, "merge", "fine", None);
        let app = router(state);

        let (_, body) = request(&app, "GET", "/api/logs?level=error", None).await;
        assert_eq!(body["logs"].as_array().unwrap().len(), 1);
        assert_eq!(body["unreadAttention"], 1);

        let (status, _) = request(
            &app,
            "POST",
            "/api/logs/mark-read",
            Some(json!({"level": "error"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = request(&app, "GET", "/api/logs?unreadOnly=true", None).await;
        assert_eq!(body["unreadAttention"], 0);
        assert_eq!(body["logs"].as_array().unwrap().len(), 1, "info entry still unread");
    }

    #[tokio::test]
    async fn stream_stats_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (status, body) = request(&app, "GET", "/api/stream-stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["streams"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn hooks_listing_reports_installed_state() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let (_, body) = request(&app, "GET", "/api/hooks", None).await;
        let hooks = body["hooks"].as_array().unwrap();
        assert_eq!(hooks.len(), KNOWN_HOOKS.len());
        assert!(hooks.iter().all(|h| h["installed"] == false));
    }
}
