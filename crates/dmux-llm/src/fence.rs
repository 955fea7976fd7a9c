//! Code-fence stripping for providers that wrap JSON in markdown.

/// Strip a leading/trailing markdown code fence (```json ... ```).
/// Text without a fence passes through untouched.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_code_fence(r#"{"a":1}"#), r#"{"a":1}"#);
    }

    #[test]
    fn strips_json_fence() {
        let fenced = "```json\n{\"summary\":\"done\"}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"summary\":\"done\"}");
    }

    #[test]
    fn strips_bare_fence() {
        let fenced = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\":1}");
    }

    #[test]
    fn tolerates_missing_closing_fence() {
        let fenced = "```json\n{\"a\":1}";
        assert_eq!(strip_code_fence(fenced), "{\"a\":1}");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(strip_code_fence("  {\"a\":1}  \n"), "{\"a\":1}");
    }
}
