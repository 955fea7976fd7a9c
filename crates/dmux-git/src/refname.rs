//! Branch name validation per `git-check-ref-format` rules.

use crate::error::GitError;

/// Characters git forbids anywhere in a ref component.
const FORBIDDEN_CHARS: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\'];

/// Validate a branch name (or a branch-prefix fragment) before it is
/// handed to `git worktree add -b`.
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    let reject = |reason: &'static str| Err(GitError::InvalidRef(name.to_string(), reason));

    if name.is_empty() {
        return reject("empty");
    }
    if name.starts_with('-') {
        return reject("leading dash");
    }
    if name.starts_with('/') {
        return reject("leading slash");
    }
    if name.ends_with('/') {
        return reject("trailing slash");
    }
    if name.ends_with('.') {
        return reject("trailing dot");
    }
    if name.ends_with(".lock") {
        return reject("'.lock' suffix");
    }
    if name.contains("..") {
        return reject("double dot");
    }
    if name.contains("@{") {
        return reject("'@{' sequence");
    }
    if name.contains("//") {
        return reject("empty path component");
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return match c {
            ' ' => reject("whitespace"),
            _ => reject("forbidden character"),
        };
    }
    if name.chars().any(|c| c.is_control()) {
        return reject("control character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_branch_names() {
        for name in [
            "main",
            "fix-auth-bug",
            "dmux/fix-auth-bug",
            "feature/login.v2",
            "fix-auth-bug-claude-code",
        ] {
            assert!(validate_branch_name(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_the_documented_set() {
        for name in [
            "has space",
            "a..b",
            "til~de",
            "car^et",
            "co:lon",
            "que?stion",
            "st*ar",
            "brack[et",
            "back\\slash",
            "-leading",
            "trailing/",
        ] {
            assert!(validate_branch_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn rejects_git_specific_forms() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("branch.lock").is_err());
        assert!(validate_branch_name("a@{b").is_err());
        assert!(validate_branch_name("/abs").is_err());
        assert!(validate_branch_name("end.").is_err());
        assert!(validate_branch_name("a//b").is_err());
        assert!(validate_branch_name("ctl\x07char").is_err());
    }

    #[test]
    fn error_carries_the_offending_name() {
        match validate_branch_name("has space") {
            Err(GitError::InvalidRef(name, _)) => assert_eq!(name, "has space"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
