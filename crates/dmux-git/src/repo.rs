//! Repository operations. Every method takes the working directory
//! explicitly; dmux constantly alternates between the main repo and the
//! feature worktrees.

use std::path::Path;

use crate::error::GitError;
use crate::runner::GitRunner;

/// One `status --porcelain` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character XY status code.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOpts {
    pub no_edit: bool,
    pub no_commit: bool,
}

pub struct Git<R> {
    runner: R,
}

impl<R: GitRunner> Git<R> {
    pub fn new(runner: R) -> Self {
        Git { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    // -----------------------------------------------------------------
    // Branch queries
    // -----------------------------------------------------------------

    pub fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.runner.run(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Detect the main branch: `origin/HEAD` symbolic ref first, then
    /// local `main`, then `master`, defaulting to `main`.
    pub fn main_branch(&self, dir: &Path) -> String {
        if let Ok(out) = self
            .runner
            .run(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"])
        {
            if let Some(name) = out.trim().strip_prefix("refs/remotes/origin/") {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(dir, candidate) {
                return candidate.to_string();
            }
        }
        "main".to_string()
    }

    pub fn branch_exists(&self, dir: &Path, name: &str) -> bool {
        let target = format!("refs/heads/{name}");
        self.runner
            .run_unchecked(dir, &["rev-parse", "--verify", "--quiet", &target])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    pub fn toplevel(&self, dir: &Path) -> Result<std::path::PathBuf, GitError> {
        let out = self.runner.run(dir, &["rev-parse", "--show-toplevel"])?;
        Ok(std::path::PathBuf::from(out.trim()))
    }

    /// Commits on `feature` that `target` lacks.
    pub fn commits_ahead(&self, dir: &Path, feature: &str, target: &str) -> Result<usize, GitError> {
        let range = format!("{target}..{feature}");
        let out = self.runner.run(dir, &["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .map_err(|_| GitError::Parse(format!("rev-list --count returned {out:?}")))
    }

    // -----------------------------------------------------------------
    // Working tree state
    // -----------------------------------------------------------------

    pub fn status_porcelain(&self, dir: &Path) -> Result<Vec<StatusEntry>, GitError> {
        let out = self.runner.run(dir, &["status", "--porcelain"])?;
        Ok(out
            .lines()
            .filter(|l| l.len() > 3)
            .map(|line| StatusEntry {
                code: line[..2].to_string(),
                path: line[3..].to_string(),
            })
            .collect())
    }

    pub fn has_uncommitted(&self, dir: &Path) -> Result<bool, GitError> {
        Ok(!self.status_porcelain(dir)?.is_empty())
    }

    pub fn diff(&self, dir: &Path, cached: bool) -> Result<String, GitError> {
        if cached {
            self.runner.run(dir, &["diff", "--cached"])
        } else {
            self.runner.run(dir, &["diff"])
        }
    }

    pub fn stage_all(&self, dir: &Path) -> Result<(), GitError> {
        self.runner.run(dir, &["add", "-A"])?;
        Ok(())
    }

    pub fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.runner.run(dir, &["commit", "-m", message])?;
        Ok(())
    }

    /// Stash everything including untracked files.
    pub fn stash(&self, dir: &Path) -> Result<(), GitError> {
        self.runner
            .run(dir, &["stash", "push", "--include-untracked"])?;
        Ok(())
    }

    pub fn checkout(&self, dir: &Path, r#ref: &str) -> Result<(), GitError> {
        self.runner.run(dir, &["checkout", r#ref])?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------

    pub fn merge(&self, dir: &Path, r#ref: &str, opts: MergeOpts) -> Result<(), GitError> {
        let mut args = vec!["merge"];
        if opts.no_edit {
            args.push("--no-edit");
        }
        if opts.no_commit {
            args.push("--no-commit");
        }
        args.push(r#ref);
        self.runner.run(dir, &args)?;
        Ok(())
    }

    pub fn merge_abort(&self, dir: &Path) -> Result<(), GitError> {
        self.runner.run(dir, &["merge", "--abort"])?;
        Ok(())
    }

    /// Whether a merge is in progress (MERGE_HEAD exists).
    pub fn merge_in_progress(&self, dir: &Path) -> bool {
        self.runner
            .run_unchecked(dir, &["rev-parse", "--verify", "--quiet", "MERGE_HEAD"])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Dry-run conflict probe via `merge-tree --write-tree`: the merge is
    /// computed in memory, no working tree is touched. Returns the
    /// conflicting paths, empty when the merge is clean. Old gits without
    /// `--write-tree` report a single opaque entry.
    pub fn conflicting_files(
        &self,
        dir: &Path,
        target: &str,
        feature: &str,
    ) -> Result<Vec<String>, GitError> {
        let out = self.runner.run_unchecked(
            dir,
            &["merge-tree", "--write-tree", "--name-only", target, feature],
        )?;
        match out.exit_code {
            0 => Ok(Vec::new()),
            1 => Ok(out
                .stdout
                .lines()
                .skip(1) // first line is the tree oid
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect()),
            _ => {
                tracing::warn!(stderr = %out.stderr, "merge-tree probe unsupported, assuming conflicts unknown");
                Ok(vec!["(unknown conflicts)".to_string()])
            }
        }
    }

    // -----------------------------------------------------------------
    // Branch mutation
    // -----------------------------------------------------------------

    pub fn branch_delete(&self, dir: &Path, name: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.runner.run(dir, &["branch", flag, name])?;
        Ok(())
    }

    pub fn log_oneline(&self, dir: &Path, range: &str, limit: usize) -> Result<String, GitError> {
        let n = format!("-{limit}");
        self.runner.run(dir, &["log", "--oneline", &n, range])
    }

    /// Diff against an arbitrary range spec (`main...feature`).
    pub fn diff_range(&self, dir: &Path, range: &str) -> Result<String, GitError> {
        self.runner.run(dir, &["diff", range])
    }

    pub fn push(&self, dir: &Path) -> Result<(), GitError> {
        self.runner.run(dir, &["push"])?;
        Ok(())
    }

    /// Push a branch and set its upstream, as PR creation needs.
    pub fn push_set_upstream(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.runner.run(dir, &["push", "-u", "origin", branch])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockGit;
    use std::path::PathBuf;

    fn dir() -> PathBuf {
        PathBuf::from("/repo")
    }

    #[test]
    fn main_branch_prefers_origin_head() {
        let mock = MockGit::new();
        mock.respond(
            &["symbolic-ref", "refs/remotes/origin/HEAD"],
            "refs/remotes/origin/trunk\n",
        );
        let git = Git::new(mock);
        assert_eq!(git.main_branch(&dir()), "trunk");
    }

    #[test]
    fn main_branch_falls_back_to_main_then_master() {
        let mock = MockGit::new();
        mock.fail(&["symbolic-ref"], 128, "ref refs/remotes/origin/HEAD is not a symbolic ref");
        mock.fail(
            &["rev-parse", "--verify", "--quiet", "refs/heads/main"],
            1,
            "",
        );
        let git = Git::new(mock);
        // main missing, master reachable (default-success mock).
        assert_eq!(git.main_branch(&dir()), "master");
    }

    #[test]
    fn status_porcelain_parses_codes_and_paths() {
        let mock = MockGit::new();
        mock.respond(&["status", "--porcelain"], " M src/main.rs\n?? notes.txt\n");
        let git = Git::new(mock);
        let entries = git.status_porcelain(&dir()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].code, " M");
        assert_eq!(entries[0].path, "src/main.rs");
        assert_eq!(entries[1].code, "??");
        assert!(git.has_uncommitted(&dir()).unwrap());
    }

    #[test]
    fn commits_ahead_builds_range() {
        let mock = MockGit::new();
        mock.respond(&["rev-list", "--count", "main..fix-auth"], "3\n");
        let git = Git::new(mock);
        assert_eq!(git.commits_ahead(&dir(), "fix-auth", "main").unwrap(), 3);
    }

    #[test]
    fn conflicting_files_clean_merge_is_empty() {
        let mock = MockGit::new();
        mock.respond(&["merge-tree"], "abc123\n");
        let git = Git::new(mock);
        assert!(git.conflicting_files(&dir(), "main", "x").unwrap().is_empty());
    }

    #[test]
    fn conflicting_files_lists_paths_on_exit_one() {
        let mock = MockGit::new();
        mock.fail_with_stdout(&["merge-tree"], 1, "abc123\nfile.ts\nsrc/other.ts\n");
        let git = Git::new(mock);
        let files = git.conflicting_files(&dir(), "main", "x").unwrap();
        assert_eq!(files, vec!["file.ts", "src/other.ts"]);
    }

    #[test]
    fn merge_flags_compose() {
        let mock = MockGit::new();
        let git = Git::new(mock);
        git.merge(
            &dir(),
            "fix-auth",
            MergeOpts {
                no_edit: true,
                no_commit: false,
            },
        )
        .unwrap();
        let calls = git.runner().calls_matching(&["merge"]);
        assert_eq!(calls[0], vec!["merge", "--no-edit", "fix-auth"]);
    }

    #[test]
    fn merge_in_progress_probes_merge_head() {
        let mock = MockGit::new();
        mock.fail(&["rev-parse", "--verify", "--quiet", "MERGE_HEAD"], 1, "");
        let git = Git::new(mock);
        assert!(!git.merge_in_progress(&dir()));
    }

    #[test]
    fn push_set_upstream_names_origin_and_branch() {
        let mock = MockGit::new();
        let git = Git::new(mock);
        git.push_set_upstream(&dir(), "fix-auth").unwrap();
        let calls = git.runner().calls_matching(&["push"]);
        assert_eq!(calls[0], vec!["push", "-u", "origin", "fix-auth"]);
    }

    #[test]
    fn diff_range_passes_range_spec() {
        let mock = MockGit::new();
        mock.respond(&["diff", "main...fix-auth"], "+added line\n");
        let git = Git::new(mock);
        assert_eq!(
            git.diff_range(&dir(), "main...fix-auth").unwrap(),
            "+added line\n"
        );
    }

    #[test]
    fn branch_delete_force_flag() {
        let mock = MockGit::new();
        let git = Git::new(mock);
        git.branch_delete(&dir(), "x", true).unwrap();
        git.branch_delete(&dir(), "y", false).unwrap();
        let calls = git.runner().calls_matching(&["branch"]);
        assert_eq!(calls[0][1], "-D");
        assert_eq!(calls[1][1], "-d");
    }
}
