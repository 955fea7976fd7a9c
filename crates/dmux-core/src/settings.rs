//! Settings model: project-scope `.dmux/settings.json` merged over the
//! global `~/.dmux.global.json`. Unknown keys survive a rewrite.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::AgentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlugProvider {
    #[default]
    Auto,
    Openrouter,
    Claude,
    Codex,
}

fn default_use_tmux_hooks() -> bool {
    true
}

/// `defaultAgent` uses `""` for "not set".
fn empty_as_none<'de, D>(de: D) -> Result<Option<AgentKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(de)?;
    match s.as_deref() {
        None | Some("") => Ok(None),
        Some(other) => AgentKind::parse(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub permission_mode: PermissionMode,
    pub enable_autopilot_by_default: bool,
    #[serde(deserialize_with = "empty_as_none")]
    pub default_agent: Option<AgentKind>,
    pub slug_provider: SlugProvider,
    #[serde(default = "default_use_tmux_hooks")]
    pub use_tmux_hooks: bool,
    /// Base branch for new worktrees; empty means current HEAD.
    pub base_branch: String,
    /// Prefix for worktree branches, validated like a ref fragment.
    pub branch_prefix: String,
    /// Keys we do not recognize, carried through rewrites untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            permission_mode: PermissionMode::Unset,
            enable_autopilot_by_default: false,
            default_agent: None,
            slug_provider: SlugProvider::Auto,
            use_tmux_hooks: true,
            base_branch: String::new(),
            branch_prefix: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// Merge project-scope settings over global-scope settings. Merging is
    /// done at the JSON level so only keys the project file actually sets
    /// shadow the global values.
    pub fn merged(global: Value, project: Value) -> Result<Settings, serde_json::Error> {
        let mut base = match global {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Value::Object(overlay) = project {
            for (k, v) in overlay {
                base.insert(k, v);
            }
        }
        serde_json::from_value(Value::Object(base))
    }

    /// Patch settings with a partial JSON object (the `PATCH /api/settings`
    /// body): known and unknown keys alike are overlaid.
    pub fn patched(&self, patch: &Value) -> Result<Settings, serde_json::Error> {
        let current = serde_json::to_value(self)?;
        Settings::merged(current, patch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.permission_mode, PermissionMode::Unset);
        assert_eq!(s.slug_provider, SlugProvider::Auto);
        assert!(s.use_tmux_hooks);
        assert!(!s.enable_autopilot_by_default);
        assert!(s.default_agent.is_none());
    }

    #[test]
    fn parses_all_recognized_keys() {
        let s: Settings = serde_json::from_value(json!({
            "permissionMode": "acceptEdits",
            "enableAutopilotByDefault": true,
            "defaultAgent": "opencode",
            "slugProvider": "openrouter",
            "useTmuxHooks": false,
            "baseBranch": "develop",
            "branchPrefix": "dmux/",
        }))
        .unwrap();
        assert_eq!(s.permission_mode, PermissionMode::AcceptEdits);
        assert!(s.enable_autopilot_by_default);
        assert_eq!(s.default_agent, Some(AgentKind::Opencode));
        assert_eq!(s.slug_provider, SlugProvider::Openrouter);
        assert!(!s.use_tmux_hooks);
        assert_eq!(s.base_branch, "develop");
        assert_eq!(s.branch_prefix, "dmux/");
    }

    #[test]
    fn empty_default_agent_means_unset() {
        let s: Settings = serde_json::from_value(json!({"defaultAgent": ""})).unwrap();
        assert!(s.default_agent.is_none());
    }

    #[test]
    fn unknown_agent_in_settings_is_an_error() {
        let r: Result<Settings, _> = serde_json::from_value(json!({"defaultAgent": "cursor"}));
        assert!(r.is_err());
    }

    #[test]
    fn project_shadows_global_per_key() {
        let merged = Settings::merged(
            json!({"baseBranch": "main", "branchPrefix": "team/"}),
            json!({"baseBranch": "develop"}),
        )
        .unwrap();
        assert_eq!(merged.base_branch, "develop");
        assert_eq!(merged.branch_prefix, "team/");
    }

    #[test]
    fn unknown_keys_round_trip() {
        let s: Settings =
            serde_json::from_value(json!({"futureKnob": 3, "baseBranch": "main"})).unwrap();
        let out = serde_json::to_value(&s).unwrap();
        assert_eq!(out["futureKnob"], 3);
        assert_eq!(out["baseBranch"], "main");
    }

    #[test]
    fn patch_overlays_known_keys() {
        let s = Settings::default();
        let patched = s.patched(&json!({"useTmuxHooks": false})).unwrap();
        assert!(!patched.use_tmux_hooks);
        assert_eq!(patched.slug_provider, SlugProvider::Auto);
    }
}
