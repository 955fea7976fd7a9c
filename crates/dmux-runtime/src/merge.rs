//! Two-phase merge engine.
//!
//! Phase 1 validates and resolves preconditions through `ActionResult`
//! dialogs; phase 2 merges the target into the worktree first (so
//! conflicts land in the agent's worktree), then the feature into the
//! target in the main repo. Every transition returns an `ActionResult`,
//! so the TUI and the HTTP facade drive the exact same machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dmux_core::action::{ActionResult, OptionItem};
use dmux_core::logs::LogLevel;
use dmux_core::types::{AgentKind, PaneRecord};
use dmux_git::runner::GitRunner;
use dmux_llm::{CompletionRequest, strip_code_fence};
use dmux_tmux::SplitOpts;
use dmux_tmux::executor::TmuxCommandRunner;

use crate::gh;
use crate::hookrun::{HookEnv, MERGE_HOOK_TIMEOUT, SYNC_HOOK_TIMEOUT};
use crate::lifecycle::{CloseMode, LifecycleController, launch_command};
use crate::prompts::{commit_message_prompt, conflict_prompt, pr_description_prompt};

/// Everything phase 1 needs to know, gathered in one blocking pass.
#[derive(Debug, Clone)]
struct MergeSnapshot {
    pane: PaneRecord,
    branch: String,
    target: String,
    root: PathBuf,
    worktree: PathBuf,
    ahead: usize,
    main_dirty: bool,
    worktree_dirty: bool,
    conflicts: Vec<String>,
    sibling_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirtyScope {
    Main,
    Worktree,
}

/// Sub-worktrees merge leaves-first so parents absorb children before
/// the root merges into the feature branch.
pub fn order_leaves_first(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    paths
}

/// PR title: the first line of the pane's prompt, capped to GitHub's
/// visible width; the slug when the prompt is empty.
pub fn pr_title(pane: &PaneRecord) -> String {
    let first_line = pane.prompt.lines().next().unwrap_or("").trim();
    let base = if first_line.is_empty() {
        pane.slug.as_str()
    } else {
        first_line
    };
    base.chars().take(72).collect()
}

pub struct MergeEngine<RT, RG> {
    lifecycle: Arc<LifecycleController<RT, RG>>,
}

impl<RT, RG> MergeEngine<RT, RG>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    pub fn new(lifecycle: Arc<LifecycleController<RT, RG>>) -> Arc<Self> {
        Arc::new(MergeEngine { lifecycle })
    }

    fn store(&self) -> &Arc<crate::state::StateStore> {
        &self.lifecycle.store
    }

    // -----------------------------------------------------------------
    // Phase 1: validate
    // -----------------------------------------------------------------

    pub async fn merge_pane(
        self: &Arc<Self>,
        pane_id: &str,
        target_override: Option<String>,
    ) -> ActionResult {
        let snapshot = match self.gather(pane_id, target_override.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => return ActionResult::error(format!("merge validation failed: {e:#}")),
        };

        if snapshot.ahead == 0 {
            return ActionResult::info(format!(
                "'{}' has no commits ahead of '{}', nothing to merge",
                snapshot.branch, snapshot.target
            ));
        }
        if snapshot.main_dirty {
            return self.dirty_dialog(snapshot, DirtyScope::Main, target_override);
        }
        if snapshot.worktree_dirty {
            return self.dirty_dialog(snapshot, DirtyScope::Worktree, target_override);
        }
        if !snapshot.conflicts.is_empty() {
            return self.conflict_dialog(snapshot);
        }
        if !snapshot.sibling_ids.is_empty() {
            return self.siblings_dialog(snapshot, target_override);
        }

        self.clean_confirm(snapshot)
    }

    async fn gather(
        self: &Arc<Self>,
        pane_id: &str,
        target_override: Option<String>,
    ) -> Result<MergeSnapshot> {
        let config = self.store().config();
        let pane = config
            .pane(pane_id)
            .cloned()
            .with_context(|| format!("unknown pane: {pane_id}"))?;
        let worktree = pane
            .worktree_path
            .clone()
            .context("pane has no worktree, nothing to merge")?;
        let branch = format!("{}{}", self.store().settings().branch_prefix, pane.slug);
        let root = self.store().project().root.clone();
        let sibling_ids: Vec<String> = config
            .siblings_of(&pane)
            .into_iter()
            .map(|p| p.id.clone())
            .collect();

        let git = self.lifecycle.git.clone();
        let (target, ahead, main_dirty, worktree_dirty, conflicts) = {
            let root = root.clone();
            let worktree = worktree.clone();
            let branch = branch.clone();
            tokio::task::spawn_blocking(move || {
                let target = match target_override {
                    Some(target) => target,
                    None => git.main_branch(&root),
                };
                let ahead = git.commits_ahead(&root, &branch, &target)?;
                let main_dirty = git.has_uncommitted(&root)?;
                let worktree_dirty = git.has_uncommitted(&worktree)?;
                let conflicts = if ahead > 0 && !main_dirty && !worktree_dirty {
                    git.conflicting_files(&root, &target, &branch)?
                } else {
                    Vec::new()
                };
                Ok::<_, dmux_git::GitError>((target, ahead, main_dirty, worktree_dirty, conflicts))
            })
            .await??
        };

        Ok(MergeSnapshot {
            pane,
            branch,
            target,
            root,
            worktree,
            ahead,
            main_dirty,
            worktree_dirty,
            conflicts,
            sibling_ids,
        })
    }

    // -----------------------------------------------------------------
    // Precondition dialogs
    // -----------------------------------------------------------------

    fn dirty_dialog(
        self: &Arc<Self>,
        snapshot: MergeSnapshot,
        scope: DirtyScope,
        target_override: Option<String>,
    ) -> ActionResult {
        let (title, dir) = match scope {
            DirtyScope::Main => (
                format!("'{}' has uncommitted changes", snapshot.target),
                snapshot.root.clone(),
            ),
            DirtyScope::Worktree => (
                format!("worktree '{}' has uncommitted changes", snapshot.pane.slug),
                snapshot.worktree.clone(),
            ),
        };

        let mut options = vec![
            OptionItem::new("commit_automatic", "Commit with AI message").default_option(),
            OptionItem::new("commit_ai_editable", "Commit with editable AI message"),
            OptionItem::new("commit_manual", "Commit with my own message"),
        ];
        if scope == DirtyScope::Main {
            options.push(OptionItem::new("stash_main", "Stash the changes"));
        }
        options.push(OptionItem::new("cancel", "Cancel"));

        let this = self.clone();
        let pane_id = snapshot.pane.id.clone();
        ActionResult::Choice {
            title,
            message: "The merge needs a clean tree here first.".to_string(),
            options,
            on_select: Box::new(move |choice| {
                Box::pin(async move {
                    match choice.as_str() {
                        "commit_automatic" => {
                            match this.commit_with_ai_message(dir.clone()).await {
                                Ok(()) => this.reenter(&pane_id, target_override).await,
                                Err(e) => {
                                    // AI failure falls back to manual input.
                                    this.store().log(
                                        LogLevel::Warn,
                                        "merge",
                                        format!("auto-commit failed, asking for a message: {e:#}"),
                                        Some(pane_id.clone()),
                                    );
                                    this.manual_commit_input(dir, pane_id, target_override, None)
                                }
                            }
                        }
                        "commit_ai_editable" => {
                            let suggestion = this.generate_commit_message(&dir).await;
                            this.manual_commit_input(dir, pane_id, target_override, suggestion)
                        }
                        "commit_manual" => {
                            this.manual_commit_input(dir, pane_id, target_override, None)
                        }
                        "stash_main" => {
                            let git = this.lifecycle.git.clone();
                            let stash_dir = dir.clone();
                            let stashed = tokio::task::spawn_blocking(move || {
                                git.stash(&stash_dir)
                            })
                            .await;
                            match stashed {
                                Ok(Ok(())) => this.reenter(&pane_id, target_override).await,
                                Ok(Err(e)) => ActionResult::error(format!("stash failed: {e}")),
                                Err(e) => ActionResult::error(format!("stash failed: {e}")),
                            }
                        }
                        _ => ActionResult::info("merge cancelled"),
                    }
                })
            }),
        }
    }

    fn manual_commit_input(
        self: &Arc<Self>,
        dir: PathBuf,
        pane_id: String,
        target_override: Option<String>,
        suggestion: Option<String>,
    ) -> ActionResult {
        let this = self.clone();
        ActionResult::Input {
            title: "Commit message".to_string(),
            message: format!("Committing all changes in {}", dir.display()),
            placeholder: Some("feat: ...".to_string()),
            default_value: suggestion,
            on_submit: Box::new(move |message| {
                Box::pin(async move {
                    let message = message.trim().to_string();
                    if message.is_empty() {
                        return ActionResult::error("commit message cannot be empty");
                    }
                    let git = this.lifecycle.git.clone();
                    let commit_dir = dir.clone();
                    let committed = tokio::task::spawn_blocking(move || {
                        git.stage_all(&commit_dir)?;
                        git.commit(&commit_dir, &message)
                    })
                    .await;
                    match committed {
                        Ok(Ok(())) => this.reenter(&pane_id, target_override).await,
                        Ok(Err(e)) => ActionResult::error(format!("commit failed: {e}")),
                        Err(e) => ActionResult::error(format!("commit failed: {e}")),
                    }
                })
            }),
        }
    }

    async fn commit_with_ai_message(self: &Arc<Self>, dir: PathBuf) -> Result<()> {
        let git = self.lifecycle.git.clone();
        {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || git.stage_all(&dir)).await??;
        }
        // No message means no commit: the caller drops to manual input.
        let message = self
            .generate_commit_message(&dir)
            .await
            .context("AI commit message generation failed")?;
        let git = self.lifecycle.git.clone();
        tokio::task::spawn_blocking(move || git.commit(&dir, &message)).await??;
        Ok(())
    }

    /// Conventional commit message from the staged diff, `None` when the
    /// chain fails; callers fall back to a generic message or an input.
    async fn generate_commit_message(self: &Arc<Self>, dir: &PathBuf) -> Option<String> {
        let git = self.lifecycle.git.clone();
        let diff_dir = dir.clone();
        let diff = tokio::task::spawn_blocking(move || {
            git.stage_all(&diff_dir)?;
            git.diff(&diff_dir, true)
        })
        .await
        .ok()?
        .ok()?;
        let req = CompletionRequest::new(commit_message_prompt(&diff))
            .with_max_tokens(128)
            .with_timeout(Duration::from_secs(15));
        let message = self
            .lifecycle
            .chain
            .complete(&req, &CancellationToken::new())
            .await?;
        let message = strip_code_fence(&message).lines().next()?.trim().to_string();
        (!message.is_empty()).then_some(message)
    }

    async fn reenter(self: &Arc<Self>, pane_id: &str, target: Option<String>) -> ActionResult {
        self.merge_pane(pane_id, target).await
    }

    fn conflict_dialog(self: &Arc<Self>, snapshot: MergeSnapshot) -> ActionResult {
        let files = snapshot.conflicts.join(", ");
        let this = self.clone();
        ActionResult::Choice {
            title: format!("merging '{}' will conflict", snapshot.branch),
            message: format!("Conflicting files: {files}"),
            options: vec![
                OptionItem::new("ai_merge", "Resolve with an AI agent")
                    .describe("opens a conflict-resolution pane in the main repo")
                    .default_option(),
                OptionItem::new("manual_merge", "Resolve manually in the worktree"),
                OptionItem::new("cancel", "Cancel"),
            ],
            on_select: Box::new(move |choice| {
                Box::pin(async move {
                    match choice.as_str() {
                        "ai_merge" => this.spawn_conflict_pane(snapshot).await,
                        "manual_merge" => ActionResult::navigation(
                            format!(
                                "merge '{}' into the worktree and resolve conflicts there",
                                snapshot.target
                            ),
                            snapshot.pane.tmux_pane_id.clone(),
                        ),
                        _ => ActionResult::info("merge cancelled"),
                    }
                })
            }),
        }
    }

    fn siblings_dialog(
        self: &Arc<Self>,
        snapshot: MergeSnapshot,
        target_override: Option<String>,
    ) -> ActionResult {
        let this = self.clone();
        let pane_id = snapshot.pane.id.clone();
        let sibling_ids = snapshot.sibling_ids.clone();
        ActionResult::Confirm {
            title: "Close sibling panes?".to_string(),
            message: format!(
                "{} other pane(s) share this worktree and must close before the merge.",
                sibling_ids.len()
            ),
            confirm_label: Some("Close them".to_string()),
            cancel_label: Some("Cancel".to_string()),
            on_confirm: Box::new(move || {
                Box::pin(async move {
                    for sibling in &sibling_ids {
                        // Kill only: the shared worktree must survive.
                        let result = this
                            .lifecycle
                            .execute_close(sibling, CloseMode::KillOnly)
                            .await;
                        if matches!(result, ActionResult::Error { .. }) {
                            return result;
                        }
                    }
                    // The close persisted to disk; wait for the watcher's
                    // re-read before validating again, or the siblings
                    // would still be visible in the snapshot.
                    for _ in 0..20 {
                        let config = this.store().config();
                        if !sibling_ids.iter().any(|id| config.pane(id).is_some()) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    this.reenter(&pane_id, target_override).await
                })
            }),
            on_cancel: None,
        }
    }

    fn clean_confirm(self: &Arc<Self>, snapshot: MergeSnapshot) -> ActionResult {
        let this = self.clone();
        ActionResult::Confirm {
            title: format!("Merge '{}' into '{}'?", snapshot.branch, snapshot.target),
            message: format!("{} commit(s) will merge.", snapshot.ahead),
            confirm_label: Some("Merge".to_string()),
            cancel_label: Some("Cancel".to_string()),
            on_confirm: Box::new(move || Box::pin(async move { this.execute(snapshot).await })),
            on_cancel: None,
        }
    }

    // -----------------------------------------------------------------
    // Phase 2: execute
    // -----------------------------------------------------------------

    async fn execute(self: &Arc<Self>, snapshot: MergeSnapshot) -> ActionResult {
        let mut env = HookEnv::for_pane(&snapshot.pane, Some(snapshot.branch.clone()));
        env.target_branch = Some(snapshot.target.clone());
        if let Err(e) = self
            .lifecycle
            .hooks
            .run_sync("pre_merge", &env, MERGE_HOOK_TIMEOUT)
            .await
        {
            return ActionResult::error(format!("pre_merge hook blocked the merge: {e:#}"));
        }

        if let Err(e) = self.merge_subtrees(&snapshot).await {
            return ActionResult::error(format!("sub-worktree merge failed: {e:#}"));
        }

        // Target into worktree first: conflicts surface where the agent
        // lives, and the main branch stays clean the whole time.
        let git = self.lifecycle.git.clone();
        let step = {
            let worktree = snapshot.worktree.clone();
            let target = snapshot.target.clone();
            tokio::task::spawn_blocking(move || {
                git.merge(
                    &worktree,
                    &target,
                    dmux_git::repo::MergeOpts {
                        no_edit: true,
                        no_commit: false,
                    },
                )
            })
            .await
        };
        match step {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Unexpected conflicts: let the LLM try before handing the
                // user a dirty worktree.
                tracing::info!(error = %e, "worktree merge conflicted, trying AI resolution");
                if let Err(resolve_err) = self.resolve_conflicts_inline(&snapshot).await {
                    self.store().log(
                        LogLevel::Warn,
                        "merge",
                        format!("AI conflict resolution failed: {resolve_err:#}"),
                        Some(snapshot.pane.id.clone()),
                    );
                    return ActionResult::navigation(
                        "merge conflicts await you in the worktree",
                        snapshot.pane.tmux_pane_id.clone(),
                    );
                }
            }
            Err(e) => return ActionResult::error(format!("merge task failed: {e}")),
        }

        // Feature into target; with the worktree already synced this is
        // conflict-free.
        let git = self.lifecycle.git.clone();
        let finished = {
            let root = snapshot.root.clone();
            let target = snapshot.target.clone();
            let branch = snapshot.branch.clone();
            tokio::task::spawn_blocking(move || {
                git.checkout(&root, &target)?;
                if let Err(e) = git.merge(
                    &root,
                    &branch,
                    dmux_git::repo::MergeOpts {
                        no_edit: true,
                        no_commit: false,
                    },
                ) {
                    let _ = git.merge_abort(&root);
                    return Err(e);
                }
                Ok(())
            })
            .await
        };
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return ActionResult::error(format!("merge into target failed: {e}")),
            Err(e) => return ActionResult::error(format!("merge task failed: {e}")),
        }

        self.store().log(
            LogLevel::Info,
            "merge",
            format!("merged '{}' into '{}'", snapshot.branch, snapshot.target),
            Some(snapshot.pane.id.clone()),
        );
        self.lifecycle.hooks.run_detached("post_merge", &env);

        let this = self.clone();
        let pane_id = snapshot.pane.id.clone();
        let slug = snapshot.pane.slug.clone();
        ActionResult::Confirm {
            title: "Merged".to_string(),
            message: format!("Remove the worktree and branch for '{slug}' and close the pane?"),
            confirm_label: Some("Clean up".to_string()),
            cancel_label: Some("Keep".to_string()),
            on_confirm: Box::new(move || {
                Box::pin(async move {
                    this.lifecycle
                        .execute_close(&pane_id, CloseMode::KillCleanBranch)
                        .await
                })
            }),
            on_cancel: Some(Box::new(move || {
                Box::pin(async move {
                    ActionResult::success("merged; worktree and branch kept")
                })
            })),
        }
    }

    // -----------------------------------------------------------------
    // Pull requests
    // -----------------------------------------------------------------

    /// Open a PR for the pane's branch: pre_pr hook, LLM-generated
    /// description, then (after the user confirms the draft) push and
    /// `gh pr create`.
    pub async fn open_pr(self: &Arc<Self>, pane_id: &str) -> ActionResult {
        let snapshot = match self.gather(pane_id, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => return ActionResult::error(format!("PR validation failed: {e:#}")),
        };
        if snapshot.ahead == 0 {
            return ActionResult::info(format!(
                "'{}' has no commits ahead of '{}', nothing to open a PR for",
                snapshot.branch, snapshot.target
            ));
        }
        if snapshot.worktree_dirty {
            return ActionResult::error(
                "the worktree has uncommitted changes; commit or stash them before opening a PR",
            );
        }

        let mut env = HookEnv::for_pane(&snapshot.pane, Some(snapshot.branch.clone()));
        env.target_branch = Some(snapshot.target.clone());
        if let Err(e) = self
            .lifecycle
            .hooks
            .run_sync("pre_pr", &env, SYNC_HOOK_TIMEOUT)
            .await
        {
            return ActionResult::error(format!("pre_pr hook blocked the PR: {e:#}"));
        }

        let git = self.lifecycle.git.clone();
        let gathered = {
            let root = snapshot.root.clone();
            let log_range = format!("{}..{}", snapshot.target, snapshot.branch);
            let diff_range = format!("{}...{}", snapshot.target, snapshot.branch);
            tokio::task::spawn_blocking(move || {
                let log = git.log_oneline(&root, &log_range, 50)?;
                let diff = git.diff_range(&root, &diff_range)?;
                Ok::<_, dmux_git::GitError>((log, diff))
            })
            .await
        };
        let (log, diff) = match gathered {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return ActionResult::error(format!("failed to read branch history: {e}")),
            Err(e) => return ActionResult::error(format!("failed to read branch history: {e}")),
        };

        let req = CompletionRequest::new(pr_description_prompt(&log, &diff))
            .with_max_tokens(1024)
            .with_timeout(Duration::from_secs(30));
        let body = match self
            .lifecycle
            .chain
            .complete(&req, &CancellationToken::new())
            .await
        {
            Some(text) => strip_code_fence(&text).to_string(),
            // LLM unavailable: the commit list still makes a usable body.
            None => format!("## Commits\n\n```\n{}\n```", log.trim()),
        };
        let title = pr_title(&snapshot.pane);

        let this = self.clone();
        let preview: String = body.chars().take(400).collect();
        ActionResult::Confirm {
            title: format!("Open pull request for '{}'?", snapshot.branch),
            message: format!("{title}\n\n{preview}"),
            confirm_label: Some("Push + open".to_string()),
            cancel_label: Some("Cancel".to_string()),
            on_confirm: Box::new(move || {
                Box::pin(async move { this.publish_pr(snapshot, title, body).await })
            }),
            on_cancel: Some(Box::new(move || {
                Box::pin(async move { ActionResult::info("PR not opened") })
            })),
        }
    }

    async fn publish_pr(
        self: &Arc<Self>,
        snapshot: MergeSnapshot,
        title: String,
        body: String,
    ) -> ActionResult {
        let git = self.lifecycle.git.clone();
        let pushed = {
            let worktree = snapshot.worktree.clone();
            let branch = snapshot.branch.clone();
            tokio::task::spawn_blocking(move || git.push_set_upstream(&worktree, &branch)).await
        };
        match pushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return ActionResult::error(format!("push failed: {e}")),
            Err(e) => return ActionResult::error(format!("push failed: {e}")),
        }

        if !gh::available() {
            return ActionResult::view(format!(
                "branch pushed; gh CLI not found. Run: gh pr create --base {} --head {}",
                snapshot.target, snapshot.branch
            ));
        }

        match gh::create_pr(&snapshot.root, &snapshot.target, &snapshot.branch, &title, &body).await
        {
            Ok(url) => {
                let pane_id = snapshot.pane.id.clone();
                let number = gh::parse_pr_number(&url);
                let persist_url = url.clone();
                let persisted = self.store().persist_panes(move |config| {
                    if let Some(pane) = config.pane_mut(&pane_id) {
                        pane.pr_number = number;
                        pane.pr_url = Some(persist_url);
                        pane.pr_status = Some("open".to_string());
                    }
                });
                if let Err(e) = persisted {
                    tracing::warn!(error = %e, "PR fields not persisted");
                }
                self.store().log(
                    LogLevel::Info,
                    "pr",
                    format!("opened {url}"),
                    Some(snapshot.pane.id.clone()),
                );
                ActionResult::success(format!("opened {url}"))
            }
            Err(e) => ActionResult::error(format!("gh pr create failed: {e:#}")),
        }
    }

    /// Merge hook-created sub-worktrees into the feature branch,
    /// leaves first. A single-root worktree is a no-op.
    async fn merge_subtrees(self: &Arc<Self>, snapshot: &MergeSnapshot) -> Result<()> {
        let git = self.lifecycle.git.clone();
        let root = snapshot.root.clone();
        let feature = snapshot.worktree.clone();
        tokio::task::spawn_blocking(move || {
            let list = git.worktree_list(&root)?;
            let subtrees: Vec<_> = list
                .into_iter()
                .filter(|w| w.path.starts_with(&feature) && w.path != feature)
                .collect();
            if subtrees.is_empty() {
                return Ok(());
            }
            let ordered = order_leaves_first(subtrees.iter().map(|w| w.path.clone()).collect());
            for path in ordered {
                let branch = subtrees
                    .iter()
                    .find(|w| w.path == path)
                    .map(|w| w.branch.clone())
                    .unwrap_or_default();
                if branch.starts_with('(') {
                    continue; // detached/bare entries have nothing to merge
                }
                tracing::info!(branch = %branch, "merging sub-worktree");
                git.merge(
                    &feature,
                    &branch,
                    dmux_git::repo::MergeOpts {
                        no_edit: true,
                        no_commit: false,
                    },
                )
                .with_context(|| format!("merging sub-worktree branch '{branch}'"))?;
            }
            Ok(())
        })
        .await?
    }

    /// In-process conflict resolver: feed each conflicted file to the
    /// LLM, write the resolutions, stage and commit.
    async fn resolve_conflicts_inline(self: &Arc<Self>, snapshot: &MergeSnapshot) -> Result<()> {
        let git = self.lifecycle.git.clone();
        let worktree = snapshot.worktree.clone();
        let conflicted: Vec<String> = {
            let worktree = worktree.clone();
            tokio::task::spawn_blocking(move || git.status_porcelain(&worktree))
                .await??
                .into_iter()
                .filter(|e| e.code.contains('U'))
                .map(|e| e.path)
                .collect()
        };
        if conflicted.is_empty() {
            bail!("merge failed but no conflicted files found");
        }

        for file in &conflicted {
            let path = worktree.join(file);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading conflicted file {file}"))?;
            let req = CompletionRequest::new(format!(
                "Resolve the git conflict markers in this file, preserving both \
                 sets of changes wherever possible. Respond with the complete \
                 resolved file content and nothing else.\n\nFile: {file}\n\n{content}"
            ))
            .with_max_tokens(8192)
            .with_timeout(Duration::from_secs(60));
            let resolved = self
                .lifecycle
                .chain
                .complete(&req, &CancellationToken::new())
                .await
                .with_context(|| format!("LLM produced no resolution for {file}"))?;
            let resolved = strip_code_fence(&resolved);
            if resolved.contains("<<<<<<<") {
                bail!("resolution for {file} still contains conflict markers");
            }
            std::fs::write(&path, format!("{resolved}\n"))
                .with_context(|| format!("writing resolved {file}"))?;
        }

        let git = self.lifecycle.git.clone();
        let message = format!(
            "merge {} into {} (conflicts auto-resolved)",
            snapshot.target, snapshot.branch
        );
        tokio::task::spawn_blocking(move || {
            git.stage_all(&worktree)?;
            git.commit(&worktree, &message)
        })
        .await??;
        Ok(())
    }

    /// Phase-1 `ai_merge`: a dedicated agent pane in the main repo works
    /// the conflict while the user watches.
    async fn spawn_conflict_pane(self: &Arc<Self>, snapshot: MergeSnapshot) -> ActionResult {
        let agent = match snapshot.pane.agent {
            AgentKind::None => AgentKind::Claude,
            other => other,
        };
        let prompt = conflict_prompt(&snapshot.branch, &snapshot.target, &snapshot.conflicts);
        let settings = self.store().settings();
        let config = self.store().config();
        let control = config.control_pane_id.clone();

        let this = self.clone();
        let root = snapshot.root.clone();
        let branch = snapshot.branch.clone();
        let slug = format!("merge-{}", snapshot.pane.slug);
        let prompt_for_pane = prompt.clone();
        let spawned = tokio::task::spawn_blocking(move || {
            let prompt = prompt_for_pane;
            let git = this.lifecycle.git.clone();
            // A stale half-done merge would poison the fresh one.
            if git.merge_in_progress(&root) {
                let _ = git.merge_abort(&root);
            }

            let pane_id = this.lifecycle.tmux.split_pane(&SplitOpts {
                target: control,
                horizontal: false,
                percent: None,
                cwd: Some(root.clone()),
            })?;
            let _ = this.lifecycle.tmux.set_pane_title(&pane_id, &slug);
            let _ = this
                .lifecycle
                .tmux
                .send_shell_command(&pane_id, &format!("git merge {branch} --no-edit"));

            let prompt_path = root.join(".dmux").join("merge-prompt");
            let launch = match std::fs::write(&prompt_path, &prompt) {
                Ok(()) => launch_command(agent, Some(&prompt_path), None, settings.permission_mode),
                Err(_) => launch_command(agent, None, Some(&prompt), settings.permission_mode),
            };
            if let Some(launch) = launch {
                let _ = this.lifecycle.tmux.send_shell_command(&pane_id, &launch);
            }
            Ok::<_, anyhow::Error>((pane_id, slug))
        })
        .await;

        match spawned {
            Ok(Ok((tmux_pane_id, slug))) => {
                let mut record = PaneRecord::new(
                    Uuid::new_v4().to_string(),
                    slug,
                    tmux_pane_id.clone(),
                    agent,
                );
                record.prompt = prompt;
                let persisted = self.store().persist_panes({
                    let record = record.clone();
                    move |config| config.panes.push(record)
                });
                if let Err(e) = persisted {
                    tracing::warn!(error = %e, "conflict pane record not persisted");
                }
                ActionResult::navigation(
                    "conflict-resolution agent started in the main repo",
                    tmux_pane_id,
                )
            }
            Ok(Err(e)) => ActionResult::error(format!("failed to start conflict pane: {e:#}")),
            Err(e) => ActionResult::error(format!("failed to start conflict pane: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hookrun::HookRunner;
    use crate::lifecycle::CloseLocks;
    use crate::project::ProjectContext;
    use crate::state::StateStore;
    use dmux_core::settings::Settings;
    use dmux_core::types::ProjectConfig;
    use dmux_git::Git;
    use dmux_git::runner::testing::MockGit;
    use dmux_llm::{CompletionProvider, LlmError, ProviderChain};
    use dmux_tmux::TmuxAdapter;
    use dmux_tmux::executor::testing::MockRunner;
    use std::path::Path;

    type TestEngine = Arc<MergeEngine<MockRunner, MockGit>>;

    struct FixedProvider(&'static str);

    #[async_trait::async_trait]
    impl CompletionProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn available(&self) -> bool {
            true
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    fn engine(dir: &Path, llm: Option<&'static str>) -> (TestEngine, crate::watcher::ConfigWatcher) {
        let ctx = ProjectContext::discover(dir.to_path_buf(), dir.join("home"));
        let store = StateStore::new(ctx.clone(), Settings::default(), ProjectConfig::default());
        // The real watcher closes the persist/re-read loop the engine
        // relies on between steps.
        let watcher = crate::watcher::spawn(store.clone(), CancellationToken::new()).unwrap();
        let mock = MockRunner::new();
        mock.respond("split-window", "%9\n");
        let chain = match llm {
            Some(text) => ProviderChain::new(vec![Box::new(FixedProvider(text))]),
            None => ProviderChain::new(vec![]),
        };
        let lifecycle = crate::lifecycle::LifecycleController::new(
            Arc::new(TmuxAdapter::new(mock)),
            Arc::new(Git::new(MockGit::new())),
            store,
            Arc::new(chain),
            CloseLocks::new(),
            Arc::new(HookRunner::new(&ctx)),
        );
        (MergeEngine::new(lifecycle), watcher)
    }

    fn seed_worktree_pane(engine: &TestEngine, id: &str) {
        let store = &engine.lifecycle.store;
        let mut record = dmux_core::types::PaneRecord::new(
            id.to_string(),
            format!("feat-{id}"),
            format!("%{id}"),
            dmux_core::types::AgentKind::Claude,
        );
        record.worktree_path = Some(store.project().worktree_path(&record.slug));
        let mut config = store.config();
        config.panes.push(record);
        store.update_panes(config);
    }

    fn git(engine: &TestEngine) -> &MockGit {
        engine.lifecycle.git.runner()
    }

    #[test]
    fn leaves_first_ordering_is_deepest_first() {
        let ordered = order_leaves_first(vec![
            PathBuf::from("/w/feat"),
            PathBuf::from("/w/feat/sub/a/b"),
            PathBuf::from("/w/feat/sub"),
        ]);
        assert_eq!(
            ordered,
            vec![
                PathBuf::from("/w/feat/sub/a/b"),
                PathBuf::from("/w/feat/sub"),
                PathBuf::from("/w/feat"),
            ]
        );
    }

    #[tokio::test]
    async fn nothing_to_merge_is_an_info() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "0\n");

        let result = e.merge_pane("1", None).await;
        match result {
            ActionResult::Info { message, .. } => assert!(message.contains("nothing to merge")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn main_dirty_offers_stash_worktree_dirty_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "2\n");
        // Root dirty, worktree clean.
        git(&e).respond_in(&dir.path().display().to_string(), &["status"], " M app.ts\n");
        git(&e).respond_in("worktrees/feat-1", &["status"], "");

        match e.merge_pane("1", None).await {
            ActionResult::Choice { options, .. } => {
                let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
                assert!(ids.contains(&"stash_main"));
                assert!(ids.contains(&"commit_automatic"));
                assert!(ids.contains(&"cancel"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Now root clean, worktree dirty: no stash option.
        git(&e).respond_in(&dir.path().display().to_string(), &["status"], "");
        git(&e).respond_in("worktrees/feat-1", &["status"], "?? new.ts\n");
        match e.merge_pane("1", None).await {
            ActionResult::Choice { options, .. } => {
                let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
                assert!(!ids.contains(&"stash_main"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dirty_worktree_ai_commit_then_merge_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), Some("feat: add X"));
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        git(&e).respond_in("worktrees/feat-1", &["status"], " M lib.rs\n");

        let ActionResult::Choice { on_select, .. } = e.merge_pane("1", None).await else {
            panic!("expected dirty dialog");
        };

        // Before resolving, the worktree becomes clean (the commit runs).
        git(&e).respond_in("worktrees/feat-1", &["status"], "");
        let next = on_select("commit_automatic".to_string()).await;

        // Commit happened with the AI message.
        let commits = git(&e).calls_in("worktrees/feat-1", &["commit"]);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0], vec!["commit", "-m", "feat: add X"]);

        // And the flow re-entered validation, landing on the clean confirm.
        match next {
            ActionResult::Confirm { title, .. } => assert!(title.contains("Merge 'feat-1'")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn predicted_conflict_offers_ai_and_manual() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        git(&e).fail_with_stdout(&["merge-tree"], 1, "oid\nfile.ts\n");

        let ActionResult::Choice { options, on_select, .. } = e.merge_pane("1", None).await else {
            panic!("expected conflict dialog");
        };
        let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["ai_merge", "manual_merge", "cancel"]);

        let result = on_select("ai_merge".to_string()).await;
        match result {
            ActionResult::Navigation { target_pane_id, .. } => {
                assert_eq!(target_pane_id, "%9");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The conflict pane ran `git merge <branch> --no-edit` via tmux.
        let sent = e.lifecycle.tmux.runner().calls_for("send-keys");
        assert!(
            sent.iter()
                .any(|call| call.iter().any(|a| a.contains("git merge feat-1 --no-edit"))),
            "merge command not sent: {sent:?}"
        );
    }

    #[tokio::test]
    async fn stale_merge_is_aborted_before_ai_conflict_pane() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        git(&e).fail_with_stdout(&["merge-tree"], 1, "oid\nfile.ts\n");
        // MERGE_HEAD exists.
        git(&e).respond(&["rev-parse", "--verify", "--quiet", "MERGE_HEAD"], "abc\n");

        let ActionResult::Choice { on_select, .. } = e.merge_pane("1", None).await else {
            panic!("expected conflict dialog");
        };
        on_select("ai_merge".to_string()).await;
        assert_eq!(git(&e).calls_matching(&["merge", "--abort"]).len(), 1);
    }

    #[tokio::test]
    async fn clean_merge_execute_merges_both_sides_then_offers_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");

        let ActionResult::Confirm { on_confirm, .. } = e.merge_pane("1", None).await else {
            panic!("expected clean confirm");
        };
        let result = on_confirm().await;

        // target into worktree, then checkout+merge in root.
        assert_eq!(git(&e).calls_in("worktrees/feat-1", &["merge", "--no-edit"]).len(), 1);
        let root = dir.path().display().to_string();
        assert_eq!(git(&e).calls_in(&root, &["checkout"]).len(), 1);
        assert_eq!(git(&e).calls_in(&root, &["merge", "--no-edit", "feat-1"]).len(), 1);

        let ActionResult::Confirm { title, on_confirm, .. } = result else {
            panic!("expected cleanup confirm, got something else");
        };
        assert_eq!(title, "Merged");

        // Cleanup delegates to kill_clean_branch.
        let cleanup = on_confirm().await;
        assert!(matches!(cleanup, ActionResult::Success { .. }), "{cleanup:?}");
        assert_eq!(git(&e).calls_matching(&["worktree", "remove"]).len(), 1);
        assert_eq!(git(&e).calls_matching(&["branch", "-D", "feat-1"]).len(), 1);
    }

    #[tokio::test]
    async fn surprise_conflict_with_failing_llm_navigates_to_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None); // empty chain: AI resolution must fail
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        // The worktree merge explodes with conflicts at execute time.
        git(&e).fail_in("worktrees/feat-1", &["merge", "--no-edit"], 1, "CONFLICT");
        git(&e).respond_in("worktrees/feat-1", &["status"], "UU src/lib.rs\n");

        let ActionResult::Confirm { on_confirm, .. } = e.merge_pane("1", None).await else {
            panic!("expected clean confirm");
        };
        let result = on_confirm().await;
        match result {
            ActionResult::Navigation { target_pane_id, message } => {
                assert_eq!(target_pane_id, "%1");
                assert!(message.contains("conflicts"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn siblings_must_close_before_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        // A sibling sharing the same worktree path.
        {
            let store = &e.lifecycle.store;
            let mut config = store.config();
            let mut sibling = config.panes[0].clone();
            sibling.id = "sib".into();
            sibling.tmux_pane_id = "%8".into();
            config.panes.push(sibling);
            store.update_panes(config);
        }
        git(&e).respond(&["rev-list"], "1\n");

        let ActionResult::Confirm { title, on_confirm, .. } = e.merge_pane("1", None).await else {
            panic!("expected siblings confirm");
        };
        assert!(title.contains("sibling"));

        let next = on_confirm().await;
        // Sibling killed (kill only: worktree untouched so far).
        let kills = e.lifecycle.tmux.runner().calls_for("kill-pane");
        assert!(kills.iter().any(|c| c.contains(&"%8".to_string())));
        // Re-entered: now the clean confirm.
        match next {
            ActionResult::Confirm { title, .. } => assert!(title.contains("Merge 'feat-1'")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // Pull requests
    // -------------------------------------------------------------------

    #[test]
    fn pr_title_prefers_prompt_first_line() {
        let mut pane = dmux_core::types::PaneRecord::new(
            "p1".into(),
            "fix-auth".into(),
            "%1".into(),
            dmux_core::types::AgentKind::Claude,
        );
        assert_eq!(pr_title(&pane), "fix-auth");

        pane.prompt = "Fix the auth bug\nwith more detail below".into();
        assert_eq!(pr_title(&pane), "Fix the auth bug");

        pane.prompt = "x".repeat(100);
        assert_eq!(pr_title(&pane).chars().count(), 72);
    }

    #[tokio::test]
    async fn open_pr_with_nothing_ahead_is_info() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "0\n");

        match e.open_pr("1").await {
            ActionResult::Info { message, .. } => assert!(message.contains("nothing to open")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_pr_refuses_dirty_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        git(&e).respond_in("worktrees/feat-1", &["status"], " M lib.rs\n");

        match e.open_pr("1").await {
            ActionResult::Error { message, .. } => assert!(message.contains("uncommitted")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_pr_blocked_by_failing_pre_pr_hook() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None);
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "2\n");

        let hook = dir.path().join(".dmux-hooks").join("pre_pr");
        std::fs::create_dir_all(hook.parent().unwrap()).unwrap();
        std::fs::write(&hook, "#!/bin/sh\nexit 3\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        match e.open_pr("1").await {
            ActionResult::Error { message, .. } => assert!(message.contains("pre_pr")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_pr_drafts_description_from_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), Some("Adds login retry handling."));
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "2\n");
        git(&e).respond(&["log", "--oneline"], "abc1234 add retry\n");

        let result = e.open_pr("1").await;
        let ActionResult::Confirm { title, message, .. } = result else {
            panic!("expected draft confirm, got something else");
        };
        assert!(title.contains("feat-1"));
        assert!(message.contains("Adds login retry handling."));
        // History was read for the description.
        assert_eq!(git(&e).calls_matching(&["log", "--oneline"]).len(), 1);
        assert_eq!(git(&e).calls_matching(&["diff", "main...feat-1"]).len(), 1);
        // Publishing waits for the confirm: nothing pushed yet.
        assert!(git(&e).calls_matching(&["push"]).is_empty());
    }

    #[tokio::test]
    async fn open_pr_falls_back_to_commit_list_body() {
        let dir = tempfile::tempdir().unwrap();
        let (e, _watcher) = engine(dir.path(), None); // no LLM
        seed_worktree_pane(&e, "1");
        git(&e).respond(&["rev-list"], "1\n");
        git(&e).respond(&["log", "--oneline"], "abc1234 fix the auth bug\n");

        let ActionResult::Confirm { message, .. } = e.open_pr("1").await else {
            panic!("expected draft confirm");
        };
        assert!(message.contains("abc1234 fix the auth bug"));
    }
}
