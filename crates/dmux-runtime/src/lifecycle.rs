//! Pane lifecycle: create, close, rename, duplicate, welcome pane, and
//! reconciliation against the event bus.
//!
//! Closing takes a per-pane lock so the bus cannot reconcile the pane
//! away as "missing" while teardown is mid-flight; stale locks are swept
//! after 60 seconds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dmux_core::action::{ActionResult, OptionItem};
use dmux_core::logs::LogLevel;
use dmux_core::settings::{PermissionMode, Settings};
use dmux_core::slug::{append_agent_suffix, fallback_slug, slugify};
use dmux_core::types::{AgentKind, PaneRecord};
use dmux_git::runner::GitRunner;
use dmux_git::{Git, validate_branch_name};
use dmux_llm::{CompletionRequest, ProviderChain};
use dmux_tmux::executor::TmuxCommandRunner;
use dmux_tmux::{SplitOpts, TmuxAdapter};

use crate::bus::PanesChanged;
use crate::hookrun::{HookEnv, HookRunner};
use crate::prompts::slug_prompt;
use crate::state::StateStore;

const TRUST_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TRUST_POLL_BUDGET: Duration = Duration::from_secs(10);
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

/// First-launch trust prompts the agents show before doing anything.
const TRUST_PATTERNS: &[&str] = &[
    "Do you trust the files",
    "Do you trust this folder",
    "Yes, proceed",
    "trust the files in this folder",
];

pub fn trust_prompt_visible(capture: &str) -> bool {
    TRUST_PATTERNS.iter().any(|p| capture.contains(p))
}

// ---------------------------------------------------------------------------
// Agent detection and launch
// ---------------------------------------------------------------------------

/// Install dirs probed in addition to `$PATH`.
fn agent_install_dirs(home: &Path) -> Vec<PathBuf> {
    vec![
        home.join(".local/bin"),
        home.join(".claude/local"),
        home.join(".opencode/bin"),
        home.join(".codex/bin"),
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ]
}

pub fn detect_available_agents(home: &Path) -> Vec<AgentKind> {
    [AgentKind::Claude, AgentKind::Opencode, AgentKind::Codex]
        .into_iter()
        .filter(|agent| {
            let Some(bin) = agent.binary() else {
                return false;
            };
            which::which(bin).is_ok()
                || agent_install_dirs(home)
                    .iter()
                    .any(|dir| dir.join(bin).is_file())
        })
        .collect()
}

/// Shell snippet that launches the agent with the pane's prompt.
///
/// The prompt rides in a temp file consumed by `$(cat ...; rm ...)` so
/// large prompts never hit shell-escaping limits; `inline_prompt` is the
/// fallback when the file write failed.
pub fn launch_command(
    agent: AgentKind,
    prompt_file: Option<&Path>,
    inline_prompt: Option<&str>,
    permission_mode: PermissionMode,
) -> Option<String> {
    let bin = agent.binary()?;
    let mut cmd = String::from(bin);

    if agent == AgentKind::Claude {
        match permission_mode {
            PermissionMode::Unset => {}
            PermissionMode::Plan => cmd.push_str(" --permission-mode plan"),
            PermissionMode::AcceptEdits => cmd.push_str(" --permission-mode acceptEdits"),
            PermissionMode::BypassPermissions => {
                cmd.push_str(" --permission-mode bypassPermissions")
            }
        }
    }

    if let Some(file) = prompt_file {
        let quoted = shell_quote(&file.display().to_string());
        cmd.push_str(&format!(" \"$(cat {quoted}; rm -f {quoted})\""));
    } else if let Some(prompt) = inline_prompt {
        if !prompt.is_empty() {
            cmd.push(' ');
            cmd.push_str(&shell_quote(prompt));
        }
    }
    Some(cmd)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Close locks
// ---------------------------------------------------------------------------

/// Per-pane close locks. While held, reconciliation must not remove the
/// pane's record. A crash mid-close leaves a lock behind; the sweeper
/// expires it after [`STALE_LOCK_AGE`].
#[derive(Default)]
pub struct CloseLocks {
    inner: Mutex<HashMap<String, Instant>>,
}

impl CloseLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(CloseLocks::default())
    }

    pub fn lock(&self, pane_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .insert(pane_id.to_string(), Instant::now());
    }

    pub fn unlock(&self, pane_id: &str) {
        self.inner.lock().unwrap().remove(pane_id);
    }

    pub fn is_locked(&self, pane_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(pane_id)
    }

    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, taken| taken.elapsed() < max_age);
        before - inner.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let locks = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = locks.sweep(STALE_LOCK_AGE);
                        if swept > 0 {
                            tracing::warn!(count = swept, "expired stale close locks");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreatePaneRequest {
    pub prompt: String,
    pub agent: Option<AgentKind>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    NeedsAgentChoice(Vec<AgentKind>),
    Created(PaneRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    KillOnly,
    KillAndClean,
    KillCleanBranch,
}

pub struct LifecycleController<RT, RG> {
    pub tmux: Arc<TmuxAdapter<RT>>,
    pub git: Arc<Git<RG>>,
    pub store: Arc<StateStore>,
    pub chain: Arc<ProviderChain>,
    pub locks: Arc<CloseLocks>,
    pub hooks: Arc<HookRunner>,
}

impl<RT, RG> LifecycleController<RT, RG>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    pub fn new(
        tmux: Arc<TmuxAdapter<RT>>,
        git: Arc<Git<RG>>,
        store: Arc<StateStore>,
        chain: Arc<ProviderChain>,
        locks: Arc<CloseLocks>,
        hooks: Arc<HookRunner>,
    ) -> Arc<Self> {
        Arc::new(LifecycleController {
            tmux,
            git,
            store,
            chain,
            locks,
            hooks,
        })
    }

    // -----------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------

    pub async fn create_pane(self: &Arc<Self>, req: CreatePaneRequest) -> Result<CreateOutcome> {
        let settings = self.store.settings();
        let agent = match req.agent.or(settings.default_agent) {
            Some(agent) => agent,
            None => {
                let available = detect_available_agents(&self.store.project().home);
                match available.len() {
                    0 => bail!("no supported agent CLI found (claude, opencode, codex)"),
                    1 => available[0],
                    _ => return Ok(CreateOutcome::NeedsAgentChoice(available)),
                }
            }
        };

        let slug = self.derive_slug(&req.prompt).await;
        let record = self.create_with_slug(&req.prompt, agent, slug, &settings).await?;
        Ok(CreateOutcome::Created(record))
    }

    /// A/B pair: one shared base slug, agent suffix per side. The
    /// watcher pauses across the two writes so subscribers see one
    /// update, not two half-states.
    pub async fn create_pair(
        self: &Arc<Self>,
        prompt: &str,
        agents: (AgentKind, AgentKind),
    ) -> Result<(PaneRecord, PaneRecord)> {
        let settings = self.store.settings();
        let base = self.derive_slug(prompt).await;
        self.store.pause_watcher();
        let result = async {
            let first = self
                .create_with_slug(prompt, agents.0, append_agent_suffix(&base, agents.0), &settings)
                .await?;
            let second = self
                .create_with_slug(prompt, agents.1, append_agent_suffix(&base, agents.1), &settings)
                .await?;
            Ok((first, second))
        }
        .await;
        self.store.resume_watcher();
        result
    }

    async fn derive_slug(&self, prompt: &str) -> String {
        if prompt.trim().is_empty() {
            return fallback_slug(Utc::now());
        }
        let req = CompletionRequest::new(slug_prompt(prompt))
            .with_max_tokens(32)
            .with_timeout(Duration::from_secs(10));
        let generated = self
            .chain
            .complete(&req, &CancellationToken::new())
            .await
            .and_then(|text| slugify(text.trim().lines().last().unwrap_or("")));
        match generated {
            Some(slug) => slug,
            None => {
                self.store.log(
                    LogLevel::Warn,
                    "lifecycle",
                    "slug generation failed, using timestamp slug",
                    None,
                );
                fallback_slug(Utc::now())
            }
        }
    }

    /// Uniquify against existing panes and branches.
    fn unique_slug(&self, base: &str) -> String {
        let config = self.store.config();
        let taken = |candidate: &str| config.panes.iter().any(|p| p.slug == candidate);
        if !taken(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    async fn create_with_slug(
        self: &Arc<Self>,
        prompt: &str,
        agent: AgentKind,
        slug: String,
        settings: &Settings,
    ) -> Result<PaneRecord> {
        let slug = self.unique_slug(&slug);
        let branch = format!("{}{}", settings.branch_prefix, slug);
        validate_branch_name(&branch).context("derived branch name is invalid")?;

        let ctx = self.store.project().clone();
        let worktree = ctx.worktree_path(&slug);
        let base = (!settings.base_branch.is_empty()).then(|| settings.base_branch.clone());
        let config = self.store.config();
        let control = config.control_pane_id.clone();
        let permission_mode = settings.permission_mode;
        let prompt_owned = prompt.to_string();

        let this = self.clone();
        let branch_for_task = branch.clone();
        let slug_for_task = slug.clone();
        let record = tokio::task::spawn_blocking(move || {
            // Worktree first; a failed split must not leave a stray branch.
            this.git
                .worktree_add(&ctx.root, &worktree, &branch_for_task, base.as_deref())
                .context("failed to create worktree")?;

            let pane_id = this
                .tmux
                .split_pane(&SplitOpts {
                    target: control,
                    horizontal: false,
                    percent: None,
                    cwd: Some(worktree.clone()),
                })
                .context("failed to split tmux pane")?;
            let _ = this.tmux.set_pane_title(&pane_id, &slug_for_task);

            let mut record = PaneRecord::new(
                Uuid::new_v4().to_string(),
                slug_for_task.clone(),
                pane_id.clone(),
                agent,
            );
            record.prompt = prompt_owned.clone();
            record.worktree_path = Some(worktree.clone());
            record.autopilot = this.store.settings().enable_autopilot_by_default;

            // Prompt through a read-then-deleted temp file; inline
            // escaping is the fallback when the write fails.
            let launch = if prompt_owned.is_empty() {
                launch_command(agent, None, None, permission_mode)
            } else {
                let prompt_path = worktree.join(".dmux-prompt");
                match std::fs::write(&prompt_path, &prompt_owned) {
                    Ok(()) => launch_command(agent, Some(&prompt_path), None, permission_mode),
                    Err(e) => {
                        tracing::warn!(error = %e, "prompt file write failed, sending inline");
                        launch_command(agent, None, Some(&prompt_owned), permission_mode)
                    }
                }
            };
            if let Some(launch) = launch {
                this.tmux
                    .send_shell_command(&pane_id, &launch)
                    .context("failed to launch agent")?;
            }

            Ok::<_, anyhow::Error>(record)
        })
        .await??;

        self.spawn_trust_approval(record.tmux_pane_id.clone());

        self.store.persist_panes({
            let record = record.clone();
            move |config| config.panes.push(record)
        })?;

        let env = HookEnv::for_pane(&record, Some(branch));
        self.hooks.run_detached("worktree_created", &env);
        self.hooks.run_detached("pane_created", &env);

        self.store.log(
            LogLevel::Info,
            "lifecycle",
            format!("created pane '{}' ({})", record.slug, record.agent),
            Some(record.id.clone()),
        );
        Ok(record)
    }

    /// Poll the fresh pane for a first-launch trust prompt and accept it
    /// once. Gives up quietly after the budget.
    fn spawn_trust_approval(self: &Arc<Self>, tmux_pane_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + TRUST_POLL_BUDGET;
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(TRUST_POLL_INTERVAL).await;
                let adapter = this.tmux.clone();
                let target = tmux_pane_id.clone();
                let capture = tokio::task::spawn_blocking(move || adapter.capture_pane(&target, 30))
                    .await;
                match capture {
                    Ok(Ok(content)) if trust_prompt_visible(&content) => {
                        let _ = this.tmux.send_keys(&tmux_pane_id, &["Enter".to_string()]);
                        tracing::debug!(pane = %tmux_pane_id, "auto-approved trust prompt");
                        return;
                    }
                    Ok(Err(e)) if e.is_pane_missing() => return,
                    _ => {}
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------

    /// The close dialog. Worktree-less shell panes only get `kill_only`.
    pub fn close_pane(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id) else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };

        let mut options = vec![OptionItem::new("kill_only", "Close pane only").default_option()];
        if pane.worktree_path.is_some() {
            options.push(
                OptionItem::new("kill_and_clean", "Close + remove worktree")
                    .describe("keeps the branch"),
            );
            options.push(
                OptionItem::new("kill_clean_branch", "Close + remove worktree + delete branch")
                    .danger(),
            );
        }

        let this = self.clone();
        let pane_id = pane_id.to_string();
        let title = format!("Close '{}'?", pane.slug);
        ActionResult::Choice {
            title,
            message: "Choose what to clean up.".to_string(),
            options,
            on_select: Box::new(move |choice| {
                Box::pin(async move {
                    let mode = match choice.as_str() {
                        "kill_only" => CloseMode::KillOnly,
                        "kill_and_clean" => CloseMode::KillAndClean,
                        "kill_clean_branch" => CloseMode::KillCleanBranch,
                        _ => return ActionResult::info("close cancelled"),
                    };
                    this.execute_close(&pane_id, mode).await
                })
            }),
        }
    }

    pub async fn execute_close(self: &Arc<Self>, pane_id: &str, mode: CloseMode) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id).cloned() else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };

        self.locks.lock(pane_id);
        let result = self.close_inner(&pane, mode).await;
        self.locks.unlock(pane_id);

        match result {
            Ok(()) => {
                if let Err(e) = self.ensure_welcome_pane().await {
                    tracing::warn!(error = %e, "welcome pane recreation failed");
                }
                // Screen refresh is cosmetic; failures are swallowed.
                let _ = self.tmux.refresh_client();
                ActionResult::success(format!("closed '{}'", pane.slug))
            }
            Err(e) => ActionResult::error(format!("close failed: {e:#}")),
        }
    }

    async fn close_inner(self: &Arc<Self>, pane: &PaneRecord, mode: CloseMode) -> Result<()> {
        self.hooks.run_detached(
            "before_pane_close",
            &HookEnv::for_pane(pane, Some(self.branch_for(pane))),
        );

        let this = self.clone();
        let pane = pane.clone();
        let pane_id = pane.id.clone();
        tokio::task::spawn_blocking(move || {
            // Already-gone panes are fine.
            if let Err(e) = this.tmux.kill_pane(&pane.tmux_pane_id) {
                if !e.is_pane_missing() {
                    return Err(e).context("failed to kill pane");
                }
            }

            if mode != CloseMode::KillOnly {
                if let Some(worktree) = &pane.worktree_path {
                    let root = this.store.project().root.clone();
                    if let Err(e) = this.git.worktree_remove(&root, worktree, true) {
                        if !e.is_already_absent() {
                            return Err(e).context("failed to remove worktree");
                        }
                    }
                    let _ = this.git.worktree_prune(&root);
                }
            }
            if mode == CloseMode::KillCleanBranch {
                let root = this.store.project().root.clone();
                let branch = this.branch_for(&pane);
                if let Err(e) = this.git.branch_delete(&root, &branch, true) {
                    if !e.is_already_absent() {
                        tracing::warn!(branch = %branch, error = %e, "branch delete failed");
                    }
                }
            }
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        self.store.persist_panes(move |config| {
            config.panes.retain(|p| p.id != pane_id);
        })?;
        Ok(())
    }

    fn branch_for(&self, pane: &PaneRecord) -> String {
        format!("{}{}", self.store.settings().branch_prefix, pane.slug)
    }

    /// When the last content pane closes, put a welcome pane back so the
    /// layout never collapses to the control pane alone.
    pub async fn ensure_welcome_pane(self: &Arc<Self>) -> Result<()> {
        let config = self.store.config();
        if !config.panes.is_empty() {
            return Ok(());
        }
        let control = config.control_pane_id.clone();
        let this = self.clone();
        let welcome_id = tokio::task::spawn_blocking(move || {
            let pane_id = this.tmux.split_pane(&SplitOpts {
                target: control,
                horizontal: false,
                percent: None,
                cwd: Some(this.store.project().root.clone()),
            })?;
            let _ = this.tmux.set_pane_title(&pane_id, "welcome");
            let _ = this.tmux.send_shell_command(
                &pane_id,
                "clear; echo 'dmux: press n in the control pane to start an agent'",
            );
            Ok::<_, dmux_tmux::TmuxError>(pane_id)
        })
        .await??;

        self.store.persist_panes(move |config| {
            config.welcome_pane_id = Some(welcome_id);
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Small actions
    // -----------------------------------------------------------------

    pub fn rename_pane(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id) else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };
        let this = self.clone();
        let pane_id = pane_id.to_string();
        let current = pane.slug.clone();
        ActionResult::Input {
            title: "Rename pane".to_string(),
            message: "Display name for the pane (does not rename the branch).".to_string(),
            placeholder: None,
            default_value: Some(current),
            on_submit: Box::new(move |name| {
                Box::pin(async move {
                    let name = name.trim().to_string();
                    if name.is_empty() {
                        return ActionResult::error("name cannot be empty");
                    }
                    let config = this.store.config();
                    let Some(pane) = config.pane(&pane_id) else {
                        return ActionResult::error("pane vanished");
                    };
                    let _ = this.tmux.set_pane_title(&pane.tmux_pane_id, &name);
                    let result = this.store.persist_panes({
                        let pane_id = pane_id.clone();
                        let name = name.clone();
                        move |config| {
                            if let Some(p) = config.pane_mut(&pane_id) {
                                p.slug = name;
                            }
                        }
                    });
                    match result {
                        Ok(_) => ActionResult::success(format!("renamed to '{name}'")),
                        Err(e) => ActionResult::error(format!("rename failed: {e:#}")),
                    }
                })
            }),
        }
    }

    /// New pane on the same worktree (a sibling). Siblings must close
    /// before the owner merges.
    pub async fn duplicate_pane(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id).cloned() else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };
        let Some(worktree) = pane.worktree_path.clone() else {
            return ActionResult::error("shell panes cannot be duplicated");
        };

        let this = self.clone();
        let control = config.control_pane_id.clone();
        let settings = self.store.settings();
        let slug = self.unique_slug(&pane.slug);
        let created = tokio::task::spawn_blocking(move || {
            let new_pane = this.tmux.split_pane(&SplitOpts {
                target: control,
                horizontal: false,
                percent: None,
                cwd: Some(worktree.clone()),
            })?;
            let _ = this.tmux.set_pane_title(&new_pane, &slug);
            if let Some(launch) = launch_command(pane.agent, None, None, settings.permission_mode)
            {
                let _ = this.tmux.send_shell_command(&new_pane, &launch);
            }
            let mut record =
                PaneRecord::new(Uuid::new_v4().to_string(), slug, new_pane, pane.agent);
            record.worktree_path = Some(worktree);
            Ok::<_, dmux_tmux::TmuxError>(record)
        })
        .await;

        match created {
            Ok(Ok(record)) => {
                let persisted = self.store.persist_panes({
                    let record = record.clone();
                    move |config| config.panes.push(record)
                });
                match persisted {
                    Ok(_) => ActionResult::success(format!("duplicated as '{}'", record.slug)),
                    Err(e) => ActionResult::error(format!("duplicate failed: {e:#}")),
                }
            }
            Ok(Err(e)) => ActionResult::error(format!("duplicate failed: {e}")),
            Err(e) => ActionResult::error(format!("duplicate failed: {e}")),
        }
    }

    pub fn open_in_editor(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id) else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };
        let Some(worktree) = &pane.worktree_path else {
            return ActionResult::error("pane has no worktree to open");
        };
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
        let result = self.tmux.split_pane(&SplitOpts {
            target: Some(pane.tmux_pane_id.clone()),
            horizontal: true,
            percent: None,
            cwd: Some(worktree.clone()),
        });
        match result {
            Ok(editor_pane) => {
                let _ = self.tmux.send_shell_command(&editor_pane, &format!("{editor} ."));
                ActionResult::navigation("opened editor", editor_pane)
            }
            Err(e) => ActionResult::error(format!("failed to open editor: {e}")),
        }
    }

    pub fn copy_path(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let config = self.store.config();
        let Some(pane) = config.pane(pane_id) else {
            return ActionResult::error(format!("unknown pane: {pane_id}"));
        };
        let Some(worktree) = &pane.worktree_path else {
            return ActionResult::error("pane has no worktree path");
        };
        let path = worktree.display().to_string();
        match self.tmux.runner().run_with_input(
            &["load-buffer", "-"],
            path.as_bytes(),
            std::time::Duration::from_secs(5),
        ) {
            Ok(_) => ActionResult::success(format!("copied to tmux buffer: {path}")),
            Err(e) => ActionResult::error(format!("copy failed: {e}")),
        }
    }

    pub fn toggle_autopilot(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let pane_id = pane_id.to_string();
        let mut now_on = false;
        let result = self.store.persist_panes(|config| {
            if let Some(pane) = config.pane_mut(&pane_id) {
                pane.autopilot = !pane.autopilot;
                now_on = pane.autopilot;
            }
        });
        match result {
            Ok(_) => ActionResult::success(if now_on {
                "autopilot on"
            } else {
                "autopilot off"
            }),
            Err(e) => ActionResult::error(format!("toggle failed: {e:#}")),
        }
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// Apply a bus event: drop records whose tmux pane vanished, unless a
    /// close lock marks them as intentionally mid-teardown.
    pub async fn reconcile(self: &Arc<Self>, event: &PanesChanged) {
        if event.removed.is_empty() {
            return;
        }
        let config = self.store.config();
        let doomed: Vec<String> = config
            .panes
            .iter()
            .filter(|p| event.removed.contains(&p.tmux_pane_id) && !self.locks.is_locked(&p.id))
            .map(|p| p.id.clone())
            .collect();
        let welcome_gone = config
            .welcome_pane_id
            .as_ref()
            .is_some_and(|id| event.removed.contains(id));

        if doomed.is_empty() && !welcome_gone {
            return;
        }
        for id in &doomed {
            self.store.log(
                LogLevel::Info,
                "lifecycle",
                "pane vanished from tmux, removing record",
                Some(id.clone()),
            );
        }
        let result = self.store.persist_panes(move |config| {
            config.panes.retain(|p| !doomed.contains(&p.id));
            if welcome_gone {
                config.welcome_pane_id = None;
            }
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "reconcile persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusSource;
    use crate::project::ProjectContext;
    use dmux_core::types::ProjectConfig;
    use dmux_git::runner::testing::MockGit;
    use dmux_tmux::executor::testing::MockRunner;

    type TestController = Arc<LifecycleController<MockRunner, MockGit>>;

    fn controller(dir: &Path) -> TestController {
        let ctx = ProjectContext::discover(dir.to_path_buf(), dir.join("home"));
        let store = StateStore::new(ctx.clone(), Settings::default(), ProjectConfig::default());
        let mock = MockRunner::new();
        mock.respond("split-window", "%7\n");
        LifecycleController::new(
            Arc::new(TmuxAdapter::new(mock)),
            Arc::new(Git::new(MockGit::new())),
            store,
            Arc::new(ProviderChain::new(vec![])),
            CloseLocks::new(),
            Arc::new(HookRunner::new(&ctx)),
        )
    }

    fn seed_pane(controller: &TestController, id: &str, tmux_id: &str, worktree: bool) {
        let mut record = PaneRecord::new(
            id.to_string(),
            format!("slug-{id}"),
            tmux_id.to_string(),
            AgentKind::Claude,
        );
        if worktree {
            record.worktree_path =
                Some(controller.store.project().worktree_path(&record.slug));
        }
        let mut config = controller.store.config();
        config.panes.push(record);
        controller.store.update_panes(config);
    }

    // -------------------------------------------------------------------
    // Launch plumbing
    // -------------------------------------------------------------------

    #[test]
    fn launch_command_reads_and_deletes_prompt_file() {
        let cmd = launch_command(
            AgentKind::Claude,
            Some(Path::new("/w/.dmux-prompt")),
            None,
            PermissionMode::AcceptEdits,
        )
        .unwrap();
        assert!(cmd.starts_with("claude --permission-mode acceptEdits"));
        assert!(cmd.contains("cat '/w/.dmux-prompt'"));
        assert!(cmd.contains("rm -f '/w/.dmux-prompt'"));
    }

    #[test]
    fn launch_command_inline_fallback_quotes() {
        let cmd = launch_command(
            AgentKind::Opencode,
            None,
            Some("fix the 'auth' bug"),
            PermissionMode::Unset,
        )
        .unwrap();
        assert!(cmd.starts_with("opencode "));
        assert!(cmd.contains(r#"'fix the '\''auth'\'' bug'"#));
    }

    #[test]
    fn launch_command_shell_pane_is_none() {
        assert!(launch_command(AgentKind::None, None, None, PermissionMode::Unset).is_none());
    }

    #[test]
    fn trust_patterns_match() {
        assert!(trust_prompt_visible("  Do you trust the files in this folder?\n > Yes"));
        assert!(!trust_prompt_visible("$ cargo build\n   Compiling dmux"));
    }

    // -------------------------------------------------------------------
    // Close locks
    // -------------------------------------------------------------------

    #[test]
    fn close_lock_lifecycle_and_sweep() {
        let locks = CloseLocks::new();
        locks.lock("p1");
        assert!(locks.is_locked("p1"));
        assert_eq!(locks.sweep(Duration::from_secs(60)), 0);
        assert!(locks.is_locked("p1"));
        // Zero max age expires everything immediately.
        assert_eq!(locks.sweep(Duration::ZERO), 1);
        assert!(!locks.is_locked("p1"));
        locks.unlock("missing"); // no-op
    }

    // -------------------------------------------------------------------
    // Close dialog + execution
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn close_dialog_hides_clean_options_for_shell_panes() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", false);
        seed_pane(&c, "p2", "%2", true);

        match c.close_pane("p1") {
            ActionResult::Choice { options, .. } => {
                assert_eq!(options.len(), 1);
                assert_eq!(options[0].id, "kill_only");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match c.close_pane("p2") {
            ActionResult::Choice { options, .. } => {
                let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
                assert_eq!(ids, vec!["kill_only", "kill_and_clean", "kill_clean_branch"]);
                assert!(options[2].danger);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_close_kill_clean_branch_runs_all_steps() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", true);

        let result = c.execute_close("p1", CloseMode::KillCleanBranch).await;
        assert!(matches!(result, ActionResult::Success { .. }), "{result:?}");

        let tmux_calls = c.tmux.runner().calls_for("kill-pane");
        assert_eq!(tmux_calls.len(), 1);
        assert_eq!(c.git.runner().calls_matching(&["worktree", "remove"]).len(), 1);
        assert_eq!(c.git.runner().calls_matching(&["branch", "-D"]).len(), 1);

        // Record removed on disk.
        let on_disk: ProjectConfig = serde_json::from_str(
            &std::fs::read_to_string(c.store.project().config_path()).unwrap(),
        )
        .unwrap();
        assert!(on_disk.panes.is_empty());
        assert!(!c.locks.is_locked("p1"));
    }

    #[tokio::test]
    async fn execute_close_tolerates_already_gone_pane() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", true);
        c.tmux.runner().fail("kill-pane", "can't find pane: %1");

        let result = c.execute_close("p1", CloseMode::KillAndClean).await;
        assert!(matches!(result, ActionResult::Success { .. }), "{result:?}");
    }

    // -------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------

    fn removed_event(ids: &[&str]) -> PanesChanged {
        PanesChanged {
            added: vec![],
            removed: ids.iter().map(|s| s.to_string()).collect(),
            source: BusSource::Polling,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reconcile_removes_vanished_panes() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", false);
        seed_pane(&c, "p2", "%2", false);

        c.reconcile(&removed_event(&["%1"])).await;

        let on_disk: ProjectConfig = serde_json::from_str(
            &std::fs::read_to_string(c.store.project().config_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.panes.len(), 1);
        assert_eq!(on_disk.panes[0].id, "p2");
    }

    #[tokio::test]
    async fn reconcile_spares_close_locked_panes() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", false);
        c.locks.lock("p1");

        c.reconcile(&removed_event(&["%1"])).await;

        // Nothing persisted: the config file was never written.
        assert!(!c.store.project().config_path().exists());
    }

    // -------------------------------------------------------------------
    // Agent choice
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn explicit_agent_skips_detection() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        // Seed a control pane id so split targets it.
        c.store.update_panes(ProjectConfig {
            control_pane_id: Some("%0".into()),
            ..ProjectConfig::default()
        });

        let outcome = c
            .create_pane(CreatePaneRequest {
                prompt: String::new(),
                agent: Some(AgentKind::Claude),
            })
            .await
            .unwrap();
        let CreateOutcome::Created(record) = outcome else {
            panic!("expected creation");
        };
        assert_eq!(record.agent, AgentKind::Claude);
        assert_eq!(record.tmux_pane_id, "%7");
        assert!(record.slug.starts_with("dmux-"), "empty prompt uses timestamp slug");
        // Worktree creation and the split both happened.
        assert_eq!(c.git.runner().calls_matching(&["worktree", "add"]).len(), 1);
    }

    #[tokio::test]
    async fn create_pair_shares_base_slug_with_agent_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());

        let (a, b) = c
            .create_pair("add login retries", (AgentKind::Claude, AgentKind::Opencode))
            .await
            .unwrap();

        assert!(a.slug.ends_with("-claude-code"), "{}", a.slug);
        assert!(b.slug.ends_with("-opencode"), "{}", b.slug);
        assert_eq!(
            a.slug.trim_end_matches("-claude-code"),
            b.slug.trim_end_matches("-opencode"),
            "both sides derive from one base slug"
        );
        assert_eq!(a.prompt, "add login retries");

        // Both creations survived the back-to-back writes.
        let on_disk: ProjectConfig = serde_json::from_str(
            &std::fs::read_to_string(c.store.project().config_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.panes.len(), 2);
        assert_eq!(c.git.runner().calls_matching(&["worktree", "add"]).len(), 2);
        // The pause bracket was released.
        assert!(!c.store.watcher_paused());
    }

    #[tokio::test]
    async fn duplicate_shares_the_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path());
        seed_pane(&c, "p1", "%1", true);

        let result = c.duplicate_pane("p1").await;
        assert!(matches!(result, ActionResult::Success { .. }), "{result:?}");
        let on_disk: ProjectConfig = serde_json::from_str(
            &std::fs::read_to_string(c.store.project().config_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.panes.len(), 2);
        let duplicate = &on_disk.panes[1];
        assert_eq!(duplicate.slug, "slug-p1-2", "slug must be uniquified");
        assert_eq!(
            duplicate.worktree_path,
            Some(c.store.project().worktree_path("slug-p1")),
            "sibling shares the original worktree"
        );
    }
}
