//! Slug derivation: short branch-safe names for panes and their branches.

use chrono::{DateTime, Utc};

use crate::types::AgentKind;

const MAX_SLUG_LEN: usize = 40;

/// Sanitize free text into a branch-safe slug: lowercase alphanumerics and
/// single dashes, at most 40 chars, never starting or ending with a dash.
/// Returns `None` when nothing survives sanitization.
pub fn slugify(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len().min(MAX_SLUG_LEN));
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                if out.len() + 1 >= MAX_SLUG_LEN {
                    break;
                }
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
            if out.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Fallback when slug generation fails: `dmux-<unix-ts>`.
pub fn fallback_slug(now: DateTime<Utc>) -> String {
    format!("dmux-{}", now.timestamp())
}

/// Suffix appended to A/B pair slugs so each agent gets its own branch.
pub fn agent_suffix(agent: AgentKind) -> Option<&'static str> {
    match agent {
        AgentKind::Claude => Some("-claude-code"),
        AgentKind::Opencode => Some("-opencode"),
        AgentKind::Codex => Some("-codex"),
        AgentKind::None => None,
    }
}

/// Append the agent suffix to a base slug. Idempotent: appending to a slug
/// that already carries the suffix returns it unchanged.
pub fn append_agent_suffix(base: &str, agent: AgentKind) -> String {
    match agent_suffix(agent) {
        Some(suffix) if !base.ends_with(suffix) => format!("{base}{suffix}"),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic_prompt() {
        assert_eq!(
            slugify("Fix the auth bug").as_deref(),
            Some("fix-the-auth-bug")
        );
    }

    #[test]
    fn slugify_collapses_punctuation_runs() {
        assert_eq!(
            slugify("add   --- OAuth2.0 support!!").as_deref(),
            Some("add-oauth2-0-support")
        );
    }

    #[test]
    fn slugify_caps_length_without_trailing_dash() {
        let long = "a very long prompt that keeps going and going and going and going";
        let slug = slugify(long).unwrap();
        assert!(slug.len() <= 40, "len={}", slug.len());
        assert!(!slug.ends_with('-'));
        assert!(!slug.starts_with('-'));
    }

    #[test]
    fn slugify_rejects_empty_input() {
        assert_eq!(slugify(""), None);
        assert_eq!(slugify("!!! ???"), None);
    }

    #[test]
    fn fallback_uses_timestamp() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(fallback_slug(now), "dmux-1700000000");
    }

    #[test]
    fn suffix_append_is_idempotent() {
        let once = append_agent_suffix("fix-auth", AgentKind::Claude);
        assert_eq!(once, "fix-auth-claude-code");
        let twice = append_agent_suffix(&once, AgentKind::Claude);
        assert_eq!(twice, once);
    }

    #[test]
    fn suffix_for_shell_panes_is_noop() {
        assert_eq!(append_agent_suffix("fix-auth", AgentKind::None), "fix-auth");
    }
}
