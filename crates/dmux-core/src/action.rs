//! The uniform action-result contract.
//!
//! Every user-visible operation (TUI keybinding, HTTP action route, popup
//! follow-up) resolves to an `ActionResult`. Dialog variants carry boxed
//! async callbacks that themselves return the next `ActionResult`, so
//! multi-step wizards (the merge flows, pane close) need no UI-specific
//! code. The TUI drives callbacks directly; the HTTP facade parks them in a
//! registry and resolves them from `/api/callbacks/...` later.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

/// Invoked when a confirm dialog resolves (confirm or cancel side).
pub type ConfirmCallback = Box<dyn FnOnce() -> ActionFuture + Send>;
/// Invoked with the id of the selected option.
pub type ChoiceCallback = Box<dyn FnOnce(String) -> ActionFuture + Send>;
/// Invoked with the submitted text.
pub type InputCallback = Box<dyn FnOnce(String) -> ActionFuture + Send>;

/// One option in a choice dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionItem {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub danger: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

impl OptionItem {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        OptionItem {
            id: id.into(),
            label: label.into(),
            description: None,
            danger: false,
            default: false,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn danger(mut self) -> Self {
        self.danger = true;
        self
    }

    #[must_use]
    pub fn default_option(mut self) -> Self {
        self.default = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Spinner,
    Bar,
}

pub enum ActionResult {
    /// Plain message; the UI should keep focus where it is.
    View { message: String },
    /// Message plus a pane the UI should focus.
    Navigation {
        message: String,
        target_pane_id: String,
    },
    Info {
        message: String,
        dismissable: bool,
    },
    Success {
        message: String,
        dismissable: bool,
    },
    Error {
        message: String,
        dismissable: bool,
    },
    Confirm {
        title: String,
        message: String,
        confirm_label: Option<String>,
        cancel_label: Option<String>,
        on_confirm: ConfirmCallback,
        on_cancel: Option<ConfirmCallback>,
    },
    Choice {
        title: String,
        message: String,
        options: Vec<OptionItem>,
        on_select: ChoiceCallback,
    },
    Input {
        title: String,
        message: String,
        placeholder: Option<String>,
        default_value: Option<String>,
        on_submit: InputCallback,
    },
    Progress {
        message: String,
        kind: ProgressKind,
        timeout_ms: Option<u64>,
    },
}

impl ActionResult {
    pub fn view(message: impl Into<String>) -> Self {
        ActionResult::View {
            message: message.into(),
        }
    }

    pub fn navigation(message: impl Into<String>, target_pane_id: impl Into<String>) -> Self {
        ActionResult::Navigation {
            message: message.into(),
            target_pane_id: target_pane_id.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        ActionResult::Info {
            message: message.into(),
            dismissable: true,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        ActionResult::Success {
            message: message.into(),
            dismissable: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ActionResult::Error {
            message: message.into(),
            dismissable: true,
        }
    }

    /// Wire-level discriminant, also used by the HTTP facade.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionResult::View { .. } => "view",
            ActionResult::Navigation { .. } => "navigation",
            ActionResult::Info { .. } => "info",
            ActionResult::Success { .. } => "success",
            ActionResult::Error { .. } => "error",
            ActionResult::Confirm { .. } => "confirm",
            ActionResult::Choice { .. } => "choice",
            ActionResult::Input { .. } => "input",
            ActionResult::Progress { .. } => "progress",
        }
    }

    /// Whether this result needs a follow-up interaction (dialog variants).
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            ActionResult::Confirm { .. } | ActionResult::Choice { .. } | ActionResult::Input { .. }
        )
    }
}

impl fmt::Debug for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionResult::View { message } => f.debug_struct("View").field("message", message).finish(),
            ActionResult::Navigation {
                message,
                target_pane_id,
            } => f
                .debug_struct("Navigation")
                .field("message", message)
                .field("target_pane_id", target_pane_id)
                .finish(),
            ActionResult::Info { message, .. } => {
                f.debug_struct("Info").field("message", message).finish()
            }
            ActionResult::Success { message, .. } => {
                f.debug_struct("Success").field("message", message).finish()
            }
            ActionResult::Error { message, .. } => {
                f.debug_struct("Error").field("message", message).finish()
            }
            ActionResult::Confirm { title, .. } => f
                .debug_struct("Confirm")
                .field("title", title)
                .finish_non_exhaustive(),
            ActionResult::Choice { title, options, .. } => f
                .debug_struct("Choice")
                .field("title", title)
                .field("options", &options.iter().map(|o| &o.id).collect::<Vec<_>>())
                .finish_non_exhaustive(),
            ActionResult::Input { title, .. } => f
                .debug_struct("Input")
                .field("title", title)
                .finish_non_exhaustive(),
            ActionResult::Progress { message, kind, .. } => f
                .debug_struct("Progress")
                .field("message", message)
                .field("kind", kind)
                .finish(),
        }
    }
}

/// Box a plain value as an already-resolved action future.
pub fn resolved(result: ActionResult) -> ActionFuture {
    Box::pin(std::future::ready(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_all_variants() {
        assert_eq!(ActionResult::view("v").kind(), "view");
        assert_eq!(ActionResult::navigation("m", "%1").kind(), "navigation");
        assert_eq!(ActionResult::info("i").kind(), "info");
        assert_eq!(ActionResult::success("s").kind(), "success");
        assert_eq!(ActionResult::error("e").kind(), "error");
    }

    #[test]
    fn interactive_only_for_dialogs() {
        assert!(!ActionResult::info("i").is_interactive());
        let choice = ActionResult::Choice {
            title: "t".into(),
            message: "m".into(),
            options: vec![OptionItem::new("a", "A")],
            on_select: Box::new(|_| resolved(ActionResult::success("done"))),
        };
        assert!(choice.is_interactive());
    }

    #[tokio::test]
    async fn choice_callback_chains_to_next_result() {
        let choice = ActionResult::Choice {
            title: "Close pane".into(),
            message: "how?".into(),
            options: vec![OptionItem::new("kill_only", "Kill only").default_option()],
            on_select: Box::new(|id| {
                resolved(ActionResult::success(format!("selected {id}")))
            }),
        };
        let ActionResult::Choice { on_select, .. } = choice else {
            panic!("expected choice");
        };
        let next = on_select("kill_only".into()).await;
        match next {
            ActionResult::Success { message, .. } => assert_eq!(message, "selected kill_only"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn option_item_builder() {
        let opt = OptionItem::new("kill_clean_branch", "Kill + clean + delete branch")
            .describe("removes worktree and branch")
            .danger();
        assert!(opt.danger);
        assert!(!opt.default);
        assert_eq!(opt.description.as_deref(), Some("removes worktree and branch"));
    }
}
