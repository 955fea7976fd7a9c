//! Action system: one dispatcher for the TUI and the HTTP facade, plus
//! the callback registry that lets HTTP clients resolve dialog steps
//! asynchronously via `/api/callbacks/...`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dmux_core::action::{ActionFuture, ActionResult, ChoiceCallback, ConfirmCallback, InputCallback};
use dmux_core::settings::Settings;
use dmux_core::types::{AgentKind, PaneRecord};
use dmux_git::runner::GitRunner;
use dmux_tmux::executor::TmuxCommandRunner;

use crate::lifecycle::LifecycleController;
use crate::merge::MergeEngine;

pub const CALLBACK_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ActionDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

const fn descriptor(id: &'static str, label: &'static str, description: &'static str) -> ActionDescriptor {
    ActionDescriptor {
        id,
        label,
        description,
    }
}

/// Actions valid for this pane right now. The menu and the HTTP action
/// list both come from here, so invalid operations are unreachable
/// rather than merely erroring.
pub fn available_actions(pane: &PaneRecord, _settings: &Settings) -> Vec<ActionDescriptor> {
    let mut actions = vec![
        descriptor("view", "View", "focus this pane"),
        descriptor("close", "Close", "close the pane, optionally cleaning up"),
        descriptor("rename", "Rename", "change the pane title"),
    ];
    if pane.worktree_path.is_some() {
        actions.push(descriptor("merge", "Merge", "merge this worktree into the main branch"));
        actions.push(descriptor("open_pr", "Open PR", "push the branch and open a pull request"));
        actions.push(descriptor("duplicate", "Duplicate", "second pane on the same worktree"));
        actions.push(descriptor("open_editor", "Open editor", "open $EDITOR in the worktree"));
        actions.push(descriptor("copy_path", "Copy path", "copy the worktree path"));
    }
    if pane.agent != AgentKind::None {
        actions.push(descriptor(
            "toggle_autopilot",
            "Toggle autopilot",
            "auto-accept risk-free option dialogs",
        ));
    }
    actions
}

// ---------------------------------------------------------------------------
// Callback registry
// ---------------------------------------------------------------------------

enum StoredCallback {
    Confirm {
        on_confirm: ConfirmCallback,
        on_cancel: Option<ConfirmCallback>,
    },
    Choice {
        on_select: ChoiceCallback,
    },
    Input {
        on_submit: InputCallback,
    },
}

struct RegistryEntry {
    callback: StoredCallback,
    expires: Instant,
}

/// Parks dialog callbacks for HTTP clients. Entries expire after
/// [`CALLBACK_TTL`] and are garbage-collected periodically.
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    ttl: Duration,
}

impl CallbackRegistry {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(CallbackRegistry {
            entries: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    /// Encode an `ActionResult` for the wire. Interactive variants park
    /// their callbacks here and carry a `callbackId` the client posts
    /// back to.
    pub fn encode(&self, result: ActionResult) -> Value {
        match result {
            ActionResult::View { message } => json!({"type": "view", "message": message}),
            ActionResult::Navigation {
                message,
                target_pane_id,
            } => json!({"type": "navigation", "message": message, "targetPaneId": target_pane_id}),
            ActionResult::Info {
                message,
                dismissable,
            } => json!({"type": "info", "message": message, "dismissable": dismissable}),
            ActionResult::Success {
                message,
                dismissable,
            } => json!({"type": "success", "message": message, "dismissable": dismissable}),
            ActionResult::Error {
                message,
                dismissable,
            } => json!({"type": "error", "message": message, "dismissable": dismissable}),
            ActionResult::Progress {
                message,
                kind,
                timeout_ms,
            } => json!({
                "type": "progress",
                "message": message,
                "progressType": kind,
                "timeoutMs": timeout_ms,
            }),
            ActionResult::Confirm {
                title,
                message,
                confirm_label,
                cancel_label,
                on_confirm,
                on_cancel,
            } => {
                let id = self.store(StoredCallback::Confirm {
                    on_confirm,
                    on_cancel,
                });
                json!({
                    "type": "confirm",
                    "title": title,
                    "message": message,
                    "confirmLabel": confirm_label,
                    "cancelLabel": cancel_label,
                    "callbackId": id,
                })
            }
            ActionResult::Choice {
                title,
                message,
                options,
                on_select,
            } => {
                let id = self.store(StoredCallback::Choice { on_select });
                json!({
                    "type": "choice",
                    "title": title,
                    "message": message,
                    "options": options,
                    "callbackId": id,
                })
            }
            ActionResult::Input {
                title,
                message,
                placeholder,
                default_value,
                on_submit,
            } => {
                let id = self.store(StoredCallback::Input { on_submit });
                json!({
                    "type": "input",
                    "title": title,
                    "message": message,
                    "placeholder": placeholder,
                    "defaultValue": default_value,
                    "callbackId": id,
                })
            }
        }
    }

    fn store(&self, callback: StoredCallback) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries.lock().unwrap().insert(
            id.clone(),
            RegistryEntry {
                callback,
                expires: Instant::now() + self.ttl,
            },
        );
        id
    }

    fn take(&self, id: &str) -> Option<StoredCallback> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.remove(id)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.callback)
    }

    pub fn resolve_confirm(&self, id: &str, confirmed: bool) -> Option<ActionFuture> {
        match self.take(id)? {
            StoredCallback::Confirm {
                on_confirm,
                on_cancel,
            } => {
                if confirmed {
                    Some(on_confirm())
                } else {
                    match on_cancel {
                        Some(on_cancel) => Some(on_cancel()),
                        None => Some(Box::pin(std::future::ready(ActionResult::info(
                            "cancelled",
                        )))),
                    }
                }
            }
            _ => None,
        }
    }

    pub fn resolve_choice(&self, id: &str, option_id: String) -> Option<ActionFuture> {
        match self.take(id)? {
            StoredCallback::Choice { on_select } => Some(on_select(option_id)),
            _ => None,
        }
    }

    pub fn resolve_input(&self, id: &str, value: String) -> Option<ActionFuture> {
        match self.take(id)? {
            StoredCallback::Input { on_submit } => Some(on_submit(value)),
            _ => None,
        }
    }

    pub fn gc(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = registry.gc();
                        if swept > 0 {
                            tracing::debug!(count = swept, "expired dialog callbacks");
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ActionDispatcher<RT, RG> {
    pub lifecycle: Arc<LifecycleController<RT, RG>>,
    pub merge: Arc<MergeEngine<RT, RG>>,
}

impl<RT, RG> ActionDispatcher<RT, RG>
where
    RT: TmuxCommandRunner + 'static,
    RG: GitRunner + 'static,
{
    pub fn new(
        lifecycle: Arc<LifecycleController<RT, RG>>,
        merge: Arc<MergeEngine<RT, RG>>,
    ) -> Arc<Self> {
        Arc::new(ActionDispatcher { lifecycle, merge })
    }

    pub async fn dispatch(&self, pane_id: &str, action_id: &str) -> ActionResult {
        match action_id {
            "view" => {
                let config = self.lifecycle.store.config();
                match config.pane(pane_id) {
                    Some(pane) => {
                        let _ = self.lifecycle.tmux.select_pane(&pane.tmux_pane_id);
                        ActionResult::navigation("focused", pane.tmux_pane_id.clone())
                    }
                    None => ActionResult::error(format!("unknown pane: {pane_id}")),
                }
            }
            "close" => self.lifecycle.close_pane(pane_id),
            "rename" => self.lifecycle.rename_pane(pane_id),
            "duplicate" => self.lifecycle.duplicate_pane(pane_id).await,
            "open_editor" => self.lifecycle.open_in_editor(pane_id),
            "copy_path" => self.lifecycle.copy_path(pane_id),
            "toggle_autopilot" => self.lifecycle.toggle_autopilot(pane_id),
            "merge" => self.merge.merge_pane(pane_id, None).await,
            "open_pr" => self.merge.open_pr(pane_id).await,
            other => ActionResult::error(format!("unknown action: {other}")),
        }
    }
}
