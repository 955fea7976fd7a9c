//! Browser key events translated to tmux `send-keys` arguments.
//!
//! The HTTP facade receives `{key, ctrlKey, altKey, shiftKey, metaKey}`
//! bodies using KeyboardEvent names. Three dispatch shapes come out:
//! named tokens, literal text (`-l`), or a raw byte paste for sequences
//! send-keys cannot spell (Shift+Enter's CSI).

use crate::error::TmuxError;

/// A key press as reported by the browser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpec {
    pub key: String,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl KeySpec {
    pub fn plain(key: impl Into<String>) -> Self {
        KeySpec {
            key: key.into(),
            ..KeySpec::default()
        }
    }

    fn has_modifier(&self) -> bool {
        self.ctrl || self.alt || self.meta
    }
}

/// How the key press must be delivered to tmux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDispatch {
    /// `send-keys <tokens...>`
    Tokens(Vec<String>),
    /// `send-keys -l <text>`
    Literal(String),
    /// Delivered via `load-buffer` + `paste-buffer -p`.
    Paste(Vec<u8>),
}

/// KeyboardEvent name to tmux key token, usable in both directions.
const SPECIAL_KEYS: &[(&str, &str)] = &[
    ("Enter", "Enter"),
    ("Tab", "Tab"),
    ("Backspace", "BSpace"),
    ("Delete", "DC"),
    ("Escape", "Escape"),
    ("ArrowUp", "Up"),
    ("ArrowDown", "Down"),
    ("ArrowLeft", "Left"),
    ("ArrowRight", "Right"),
    ("Home", "Home"),
    ("End", "End"),
    ("PageUp", "PageUp"),
    ("PageDown", "PageDown"),
];

/// Shift+Enter as the CSI-u style sequence agents expect for newline
/// without submit. send-keys has no name for it.
const SHIFT_ENTER_SEQ: &[u8] = b"\x1b[13;2~";

pub fn special_token(name: &str) -> Option<&'static str> {
    SPECIAL_KEYS
        .iter()
        .find(|(k, _)| *k == name)
        .map(|(_, t)| *t)
}

pub fn special_name(token: &str) -> Option<&'static str> {
    SPECIAL_KEYS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(k, _)| *k)
}

/// Translate a key spec into its tmux dispatch.
pub fn translate(spec: &KeySpec) -> Result<KeyDispatch, TmuxError> {
    // Sequences with no send-keys spelling.
    if spec.key == "Enter" && spec.shift && !spec.has_modifier() {
        return Ok(KeyDispatch::Paste(SHIFT_ENTER_SEQ.to_vec()));
    }
    if spec.key == "Tab" && spec.shift && !spec.has_modifier() {
        return Ok(KeyDispatch::Tokens(vec!["BTab".into()]));
    }

    if let Some(token) = special_token(&spec.key) {
        return Ok(KeyDispatch::Tokens(vec![prefixed(spec, token)]));
    }

    // Space is special only when it needs a modifier prefix.
    if spec.key == " " {
        if spec.has_modifier() {
            return Ok(KeyDispatch::Tokens(vec![prefixed(spec, "Space")]));
        }
        return Ok(KeyDispatch::Literal(" ".into()));
    }

    // Function keys pass through by name.
    if is_function_key(&spec.key) {
        return Ok(KeyDispatch::Tokens(vec![prefixed(spec, &spec.key)]));
    }

    // Printable characters. Shift is already baked into the char.
    let mut chars = spec.key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if !c.is_control() {
            if spec.has_modifier() {
                return Ok(KeyDispatch::Tokens(vec![prefixed(spec, &c.to_string())]));
            }
            return Ok(KeyDispatch::Literal(c.to_string()));
        }
    }

    Err(TmuxError::Parse(format!("unsupported key: {:?}", spec.key)))
}

/// Apply modifier prefixes in tmux's canonical C-M-S order. Meta (cmd)
/// has no tmux spelling of its own and rides the M- prefix.
fn prefixed(spec: &KeySpec, token: &str) -> String {
    let mut out = String::new();
    if spec.ctrl {
        out.push_str("C-");
    }
    if spec.alt || spec.meta {
        out.push_str("M-");
    }
    // Shift on printable chars is already in the char; only named keys
    // take an explicit S-.
    if spec.shift && token.len() > 1 {
        out.push_str("S-");
    }
    out.push_str(token);
    out
}

fn is_function_key(key: &str) -> bool {
    key.len() >= 2
        && key.starts_with('F')
        && key[1..].chars().all(|c| c.is_ascii_digit())
}
