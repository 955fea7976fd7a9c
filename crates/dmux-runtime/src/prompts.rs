//! Prompt construction and response parsing for every LLM call the
//! engine makes: pane classification, option extraction, summaries,
//! slugs, commit messages, PR descriptions and conflict resolution.

use serde::Deserialize;

use dmux_core::types::{DialogChoice, PotentialHarm};
use dmux_llm::strip_code_fence;

// ---------------------------------------------------------------------------
// Stage A: state classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    OptionDialog,
    InProgress,
    OpenPrompt,
}

/// The classifier looks at the last 10 lines; the rest of the capture is
/// context only.
pub fn classification_prompt(content: &str) -> String {
    let tail: Vec<&str> = content.lines().rev().take(10).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    format!(
        "You are watching a terminal running an AI coding agent. Classify the \
         agent's current state from its visible output.\n\n\
         Focus on the LAST 10 LINES:\n\
         ---\n{}\n---\n\n\
         Rules:\n\
         - If the output contains \"(esc to interrupt)\" or a spinner/progress \
         indicator, the agent is busy: answer in_progress.\n\
         - If the last lines show a question with numbered or lettered choices \
         (1., 2., a), y/n), the agent is blocked on a decision: answer \
         option_dialog.\n\
         - Otherwise the agent is waiting at an open prompt: answer \
         open_prompt.\n\n\
         Respond with JSON only: {{\"state\": \"option_dialog\" | \"in_progress\" | \"open_prompt\"}}",
        tail.join("\n")
    )
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    state: String,
}

pub fn parse_classification(text: &str) -> Option<Classification> {
    let parsed: ClassificationResponse = serde_json::from_str(strip_code_fence(text)).ok()?;
    match parsed.state.as_str() {
        "option_dialog" => Some(Classification::OptionDialog),
        "in_progress" => Some(Classification::InProgress),
        "open_prompt" => Some(Classification::OpenPrompt),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Stage B: option extraction
// ---------------------------------------------------------------------------

pub fn options_prompt(content: &str) -> String {
    format!(
        "An AI coding agent is showing an option dialog in a terminal. Extract \
         the question and the selectable options from this output:\n\n\
         ---\n{content}\n---\n\n\
         For each option give the keystrokes that select it (e.g. \"1\", \"y\", \
         \"Enter\"). Also judge whether accepting could cause harm (deleting \
         files, running destructive commands, pushing, installing).\n\n\
         Respond with JSON only:\n\
         {{\"question\": \"...\", \"options\": [{{\"action\": \"...\", \"keys\": [\"...\"], \
         \"description\": \"...\"}}], \"potential_harm\": {{\"hasRisk\": false, \
         \"description\": \"...\"}}}}"
    )
}

/// `keys` arrives as either a string or a list; normalize to a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeysField {
    One(String),
    Many(Vec<String>),
}

impl From<KeysField> for Vec<String> {
    fn from(value: KeysField) -> Self {
        match value {
            KeysField::One(s) => vec![s],
            KeysField::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOption {
    action: String,
    #[serde(default)]
    keys: Option<KeysField>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    question: String,
    #[serde(default)]
    options: Vec<RawOption>,
    #[serde(default)]
    potential_harm: Option<PotentialHarm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedOptions {
    pub question: String,
    pub options: Vec<DialogChoice>,
    pub potential_harm: Option<PotentialHarm>,
}

pub fn parse_options(text: &str) -> Option<ExtractedOptions> {
    let raw: RawExtraction = serde_json::from_str(strip_code_fence(text)).ok()?;
    Some(ExtractedOptions {
        question: raw.question,
        options: raw
            .options
            .into_iter()
            .map(|o| DialogChoice {
                action: o.action,
                keys: o.keys.map(Vec::from).unwrap_or_default(),
                description: o.description,
            })
            .collect(),
        potential_harm: raw.potential_harm,
    })
}

// ---------------------------------------------------------------------------
// Stage B: summary
// ---------------------------------------------------------------------------

pub fn summary_prompt(content: &str) -> String {
    format!(
        "An AI coding agent has finished working and is back at an open \
         prompt. Summarize what it did in one or two past-tense sentences, \
         based on this terminal output:\n\n\
         ---\n{content}\n---\n\n\
         Respond with JSON only: {{\"summary\": \"...\"}}"
    )
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

pub fn parse_summary(text: &str) -> Option<String> {
    let parsed: SummaryResponse = serde_json::from_str(strip_code_fence(text)).ok()?;
    let summary = parsed.summary.trim().to_string();
    (!summary.is_empty()).then_some(summary)
}

// ---------------------------------------------------------------------------
// Slug / commit / PR / conflict prompts
// ---------------------------------------------------------------------------

pub fn slug_prompt(user_prompt: &str) -> String {
    format!(
        "Turn this task description into a short git branch name: lowercase \
         words separated by dashes, at most 4 words, no prefix.\n\n\
         Task: {user_prompt}\n\n\
         Respond with the branch name only, nothing else."
    )
}

pub fn commit_message_prompt(diff: &str) -> String {
    // Very large diffs blow the context for no benefit.
    let truncated: String = diff.chars().take(8000).collect();
    format!(
        "Write a conventional commit message (type: subject, max 72 chars, \
         no body) for this diff:\n\n{truncated}\n\n\
         Respond with the commit message only."
    )
}

pub fn pr_description_prompt(log: &str, diff: &str) -> String {
    let truncated: String = diff.chars().take(8000).collect();
    format!(
        "Write a pull request description (markdown, a Summary section and a \
         bullet list of changes) for these commits and diff.\n\n\
         Commits:\n{log}\n\nDiff:\n{truncated}"
    )
}

/// Prompt given to the agent launched in the conflict-resolution pane.
pub fn conflict_prompt(feature_branch: &str, target_branch: &str, files: &[String]) -> String {
    format!(
        "This repository has merge conflicts from merging '{feature_branch}' \
         into '{target_branch}'. Conflicted files:\n{}\n\n\
         Resolve every conflict by PRESERVING BOTH sets of changes wherever \
         possible; the feature work and the target branch work are both \
         wanted. Remove all conflict markers, then run `git add` on the \
         resolved files and `git commit` to finish the merge. Do not push.",
        files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
