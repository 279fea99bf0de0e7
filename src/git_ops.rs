//! Version-control primitives used while splitting a diff
//!
//! [`GitGateway`] is the seam the executors work through. [`Git`] implements
//! it with git2 for refs and commits and shells out to the `git` binary for
//! the porcelain that libgit2 lacks (`apply --cached`, `stash push
//! --keep-index`).

use crate::util::{run_command_with_input, CommandRunResult};
use git2::{BranchType, ErrorCode, Oid, Repository, ResetType, Signature, StatusOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 30;

/// Marker in the message of stash entries this tool creates
pub const STASH_MARKER: &str = "git-split-temp";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("git {op} failed: {message}")]
pub struct GitError {
    pub op: &'static str,
    pub message: String,
}

impl GitError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }

    /// A restore that stopped on merge conflicts
    pub fn is_conflict(&self) -> bool {
        self.message.contains("CONFLICT")
    }
}

fn git2_err(op: &'static str) -> impl Fn(git2::Error) -> GitError {
    move |e| GitError::new(op, e.message().to_string())
}

/// What to diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRange {
    /// Everything in the working tree and index relative to `HEAD`
    WorkingTree,
    /// Changes on `head` since it forked from `base` (`base...head`)
    Since { base: String, head: String },
}

pub trait GitGateway {
    /// Branch name, or `None` when `HEAD` is detached
    fn current_branch(&self) -> Result<Option<String>, GitError>;
    /// Commit id `HEAD` points at
    fn head(&self) -> Result<String, GitError>;
    /// Create `name` at `HEAD` and switch to it, leaving files untouched
    fn create_branch(&self, name: &str) -> Result<(), GitError>;
    fn switch_branch(&self, name: &str) -> Result<(), GitError>;
    fn delete_branch(&self, name: &str) -> Result<(), GitError>;
    fn diff(&self, range: &DiffRange) -> Result<String, GitError>;
    fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError>;
    /// Unstage everything; working tree files are kept
    fn reset_index(&self) -> Result<(), GitError>;
    fn apply_to_index(&self, patch: &str) -> Result<(), GitError>;
    /// Commit the index and return the new commit id
    fn commit(&self, message: &str) -> Result<String, GitError>;
    fn has_untracked(&self) -> Result<bool, GitError>;
    /// Save unstaged (and optionally untracked) changes aside, keeping the
    /// index. Returns whether a stash entry was actually created.
    fn stash_push(&self, message: &str, include_untracked: bool) -> Result<bool, GitError>;
    fn stash_pop(&self) -> Result<(), GitError>;
    /// Messages of the current stash entries, newest first
    fn stash_entries(&self) -> Result<Vec<String>, GitError>;
    /// Move the branch tip to `target`, keeping index and files
    fn soft_reset(&self, target: &str) -> Result<(), GitError>;
}

/// Repository on disk
pub struct Git {
    root: PathBuf,
    timeout: Duration,
}

impl Git {
    /// Open the repository containing `path`
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let repo = Repository::discover(path).map_err(|e| {
            GitError::new(
                "open",
                format!("'{}' is not inside a git repository ({})", path.display(), e.message()),
            )
        })?;
        let root = repo
            .workdir()
            .ok_or_else(|| GitError::new("open", "bare repositories have no working tree"))?
            .to_path_buf();
        Ok(Self {
            root,
            timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo(&self, op: &'static str) -> Result<Repository, GitError> {
        Repository::open(&self.root).map_err(git2_err(op))
    }

    fn run(
        &self,
        op: &'static str,
        args: &[&str],
        input: Option<&str>,
    ) -> Result<CommandRunResult, GitError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(args);
        let output = run_command_with_input(&mut cmd, input, self.timeout)
            .map_err(|e| GitError::new(op, e))?;
        if output.timed_out {
            return Err(GitError::new(
                op,
                format!("timed out after {}s", self.timeout.as_secs()),
            ));
        }
        Ok(output)
    }

    fn run_ok(
        &self,
        op: &'static str,
        args: &[&str],
        input: Option<&str>,
    ) -> Result<String, GitError> {
        let output = self.run(op, args, input)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(GitError::new(op, output.diagnostic()))
        }
    }

    fn stash_tip(&self) -> Result<Option<Oid>, GitError> {
        let repo = self.repo("stash")?;
        match repo.refname_to_id("refs/stash") {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(git2_err("stash")(e)),
        }
    }
}

impl GitGateway for Git {
    fn current_branch(&self) -> Result<Option<String>, GitError> {
        let repo = self.repo("branch")?;
        if repo.head_detached().map_err(git2_err("branch"))? {
            return Ok(None);
        }
        let result = match repo.head() {
            Ok(head) => Ok(head.shorthand().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = repo.find_reference("HEAD").map_err(git2_err("branch"))?;
                Ok(head
                    .symbolic_target()
                    .map(|t| t.trim_start_matches("refs/heads/").to_string()))
            }
            Err(e) => Err(git2_err("branch")(e)),
        };
        result
    }

    fn head(&self) -> Result<String, GitError> {
        let repo = self.repo("rev-parse")?;
        let head = repo.head().map_err(|e| {
            if e.code() == ErrorCode::UnbornBranch {
                GitError::new("rev-parse", "the repository has no commits yet")
            } else {
                git2_err("rev-parse")(e)
            }
        })?;
        let commit = head.peel_to_commit().map_err(git2_err("rev-parse"))?;
        Ok(commit.id().to_string())
    }

    fn create_branch(&self, name: &str) -> Result<(), GitError> {
        let repo = self.repo("branch")?;
        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(git2_err("branch"))?;
        let branch = repo.branch(name, &head, false).map_err(git2_err("branch"))?;
        let refname = branch
            .get()
            .name()
            .ok_or_else(|| GitError::new("branch", "branch name is not valid UTF-8"))?
            .to_string();
        repo.set_head(&refname).map_err(git2_err("checkout"))?;
        Ok(())
    }

    fn switch_branch(&self, name: &str) -> Result<(), GitError> {
        self.run_ok("checkout", &["checkout", "--quiet", name], None)
            .map(|_| ())
    }

    fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        if self.current_branch()?.as_deref() == Some(name) {
            return Err(GitError::new(
                "branch -D",
                format!("refusing to delete checked out branch '{}'", name),
            ));
        }
        let repo = self.repo("branch -D")?;
        let mut branch = repo
            .find_branch(name, BranchType::Local)
            .map_err(git2_err("branch -D"))?;
        branch.delete().map_err(git2_err("branch -D"))
    }

    fn diff(&self, range: &DiffRange) -> Result<String, GitError> {
        let mut args = vec![
            "-c",
            "core.quotePath=false",
            "diff",
            "--no-color",
            "--no-ext-diff",
            "--src-prefix=a/",
            "--dst-prefix=b/",
        ];
        let spec;
        match range {
            DiffRange::WorkingTree => args.push("HEAD"),
            DiffRange::Since { base, head } => {
                spec = format!("{}...{}", base, head);
                args.push(&spec);
            }
        }
        args.push("--");
        self.run_ok("diff", &args, None)
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError> {
        let repo = self.repo("merge-base")?;
        let resolve = |spec: &str| -> Result<Oid, GitError> {
            repo.revparse_single(spec)
                .and_then(|o| o.peel_to_commit())
                .map(|c| c.id())
                .map_err(|e| GitError::new("merge-base", format!("{}: {}", spec, e.message())))
        };
        let base = repo
            .merge_base(resolve(a)?, resolve(b)?)
            .map_err(git2_err("merge-base"))?;
        Ok(base.to_string())
    }

    fn reset_index(&self) -> Result<(), GitError> {
        self.run_ok("reset", &["reset", "--quiet"], None).map(|_| ())
    }

    fn apply_to_index(&self, patch: &str) -> Result<(), GitError> {
        self.run_ok("apply", &["apply", "--cached", "-"], Some(patch))
            .map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<String, GitError> {
        let repo = self.repo("commit")?;
        let mut index = repo.index().map_err(git2_err("commit"))?;
        if index.has_conflicts() {
            return Err(GitError::new("commit", "the index has unresolved conflicts"));
        }

        let tree_id = index.write_tree().map_err(git2_err("commit"))?;
        let tree = repo.find_tree(tree_id).map_err(git2_err("commit"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit().map_err(git2_err("commit"))?),
            Err(err)
                if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) =>
            {
                None
            }
            Err(err) => return Err(git2_err("commit")(err)),
        };

        let config = repo.config().map_err(git2_err("commit"))?;
        let name = config
            .get_string("user.name")
            .unwrap_or_else(|_| "git-split".to_string());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| "git-split@local".to_string());
        let sig = Signature::now(&name, &email).map_err(git2_err("commit"))?;

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(git2_err("commit"))?;
        Ok(oid.to_string())
    }

    fn has_untracked(&self) -> Result<bool, GitError> {
        let repo = self.repo("status")?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts)).map_err(git2_err("status"))?;
        Ok(statuses.iter().any(|entry| entry.status().is_wt_new()))
    }

    fn stash_push(&self, message: &str, include_untracked: bool) -> Result<bool, GitError> {
        let before = self.stash_tip()?;
        let mut args = vec!["stash", "push", "--keep-index", "-m", message];
        if include_untracked {
            args.push("--include-untracked");
        }
        let output = self.run("stash push", &args, None)?;
        if !output.success() {
            let diagnostic = output.diagnostic();
            if !diagnostic.contains("No local changes") {
                return Err(GitError::new("stash push", diagnostic));
            }
        }
        Ok(self.stash_tip()? != before)
    }

    fn stash_pop(&self) -> Result<(), GitError> {
        let output = self.run("stash pop", &["stash", "pop"], None)?;
        if output.success() {
            return Ok(());
        }
        // Conflict markers are reported on stdout
        let message = format!("{}\n{}", output.stdout.trim(), output.stderr.trim());
        Err(GitError::new("stash pop", message.trim().to_string()))
    }

    fn stash_entries(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_ok("stash list", &["stash", "list", "--format=%gs"], None)?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn soft_reset(&self, target: &str) -> Result<(), GitError> {
        let repo = self.repo("reset --soft")?;
        let object = repo
            .revparse_single(target)
            .map_err(git2_err("reset --soft"))?;
        repo.reset(&object, ResetType::Soft, None)
            .map_err(git2_err("reset --soft"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use git2::{Repository, Signature};
    use std::path::{Path, PathBuf};
    use std::process::Command;

    pub fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().to_path_buf();

        Repository::init(&repo_path).expect("Failed to init repo");

        let repo = Repository::open(&repo_path).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        // Initial commit so HEAD exists
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        (temp_dir, repo_path)
    }

    pub fn commit_test_file(repo_path: &Path, rel_path: &str, content: &str, message: &str) {
        let full_path = repo_path.join(rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full_path, content).unwrap();

        let repo = Repository::open(repo_path).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap();
    }

    /// Run git in the repository and return stdout
    pub fn git(repo_path: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .current_dir(repo_path)
            .env("LC_ALL", "C")
            .args(args)
            .output()
            .expect("git is installed");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    /// Commit subjects from HEAD back to the root, newest first
    pub fn log_subjects(repo_path: &Path) -> Vec<String> {
        git(repo_path, &["log", "--format=%s"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Twenty numbered lines, the shape most tests edit
    pub fn numbered(prefix: &str) -> String {
        (1..=20).map(|n| format!("{}{}\n", prefix, n)).collect()
    }

    pub fn edit_line(content: &str, line: usize, replacement: &str) -> String {
        content
            .lines()
            .enumerate()
            .map(|(i, l)| {
                if i + 1 == line {
                    format!("{}\n", replacement)
                } else {
                    format!("{}\n", l)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::diff::parse_hunks;

    // ========================================================================
    // Branch and ref tests
    // ========================================================================

    #[test]
    fn test_open_outside_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Git::open(dir.path()).err().unwrap();
        assert_eq!(err.op, "open");
    }

    #[test]
    fn test_open_from_subdirectory_finds_root() {
        let (_tmp, repo_path) = create_temp_repo();
        let nested = repo_path.join("src").join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        let git = Git::open(&nested).unwrap();
        assert_eq!(
            git.root().canonicalize().unwrap(),
            repo_path.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_create_switch_and_delete_branch() {
        let (_tmp, repo_path) = create_temp_repo();
        let git = Git::open(&repo_path).unwrap();
        let original = git.current_branch().unwrap().unwrap();
        let head = git.head().unwrap();

        git.create_branch("git-split-draft-test").unwrap();
        assert_eq!(
            git.current_branch().unwrap().as_deref(),
            Some("git-split-draft-test")
        );
        assert_eq!(git.head().unwrap(), head);

        assert!(git.delete_branch("git-split-draft-test").is_err());
        git.switch_branch(&original).unwrap();
        git.delete_branch("git-split-draft-test").unwrap();
    }

    // ========================================================================
    // Index and commit tests
    // ========================================================================

    #[test]
    fn test_apply_hunk_to_index_and_commit() {
        let (_tmp, repo_path) = create_temp_repo();
        let original = numbered("line");
        commit_test_file(&repo_path, "f.txt", &original, "add f");
        let edited = edit_line(&edit_line(&original, 2, "TWO"), 18, "EIGHTEEN");
        std::fs::write(repo_path.join("f.txt"), &edited).unwrap();

        let git = Git::open(&repo_path).unwrap();
        let diff = git.diff(&DiffRange::WorkingTree).unwrap();
        let hunks = parse_hunks(&diff);
        assert_eq!(hunks.len(), 2);

        git.reset_index().unwrap();
        git.apply_to_index(&hunks[1].content).unwrap();
        let sha = git.commit("only the second hunk").unwrap();
        assert_eq!(git.head().unwrap(), sha);

        let remaining = git.diff(&DiffRange::WorkingTree).unwrap();
        assert!(remaining.contains("+TWO"));
        assert!(!remaining.contains("+EIGHTEEN"));
        assert_eq!(log_subjects(&repo_path)[0], "only the second hunk");
    }

    #[test]
    fn test_apply_rejects_patch_that_does_not_match() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "f.txt", "a\nb\nc\n", "add f");
        let git = Git::open(&repo_path).unwrap();
        let bogus = "diff --git a/f.txt b/f.txt\n--- a/f.txt\n+++ b/f.txt\n@@ -1,3 +1,3 @@\n a\n-zzz\n+yyy\n c\n";
        let err = git.apply_to_index(bogus).unwrap_err();
        assert_eq!(err.op, "apply");
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_soft_reset_keeps_files() {
        let (_tmp, repo_path) = create_temp_repo();
        let git = Git::open(&repo_path).unwrap();
        let start = git.head().unwrap();
        commit_test_file(&repo_path, "f.txt", "content\n", "add f");

        git.soft_reset(&start).unwrap();
        git.reset_index().unwrap();
        assert_eq!(git.head().unwrap(), start);
        assert_eq!(
            std::fs::read_to_string(repo_path.join("f.txt")).unwrap(),
            "content\n"
        );
        assert!(git.has_untracked().unwrap());
    }

    #[test]
    fn test_merge_base_and_range_diff() {
        let (_tmp, repo_path) = create_temp_repo();
        let git = Git::open(&repo_path).unwrap();
        let main = git.current_branch().unwrap().unwrap();
        let fork = git.head().unwrap();

        git.create_branch("feature").unwrap();
        commit_test_file(&repo_path, "feature.txt", "new\n", "feature work");

        assert_eq!(git.merge_base(&main, "feature").unwrap(), fork);
        let diff = git
            .diff(&DiffRange::Since {
                base: main.clone(),
                head: "HEAD".to_string(),
            })
            .unwrap();
        assert!(diff.contains("diff --git a/feature.txt b/feature.txt"));
    }

    // ========================================================================
    // Stash tests
    // ========================================================================

    #[test]
    fn test_stash_push_reports_whether_entry_was_created() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "f.txt", "a\n", "add f");
        let git = Git::open(&repo_path).unwrap();

        assert!(!git.stash_push(STASH_MARKER, false).unwrap());

        std::fs::write(repo_path.join("f.txt"), "b\n").unwrap();
        assert!(git.stash_push(STASH_MARKER, false).unwrap());
        assert_eq!(std::fs::read_to_string(repo_path.join("f.txt")).unwrap(), "a\n");
        assert!(git.stash_entries().unwrap()[0].contains(STASH_MARKER));

        git.stash_pop().unwrap();
        assert_eq!(std::fs::read_to_string(repo_path.join("f.txt")).unwrap(), "b\n");
        assert!(git.stash_entries().unwrap().is_empty());
    }

    #[test]
    fn test_stash_keeps_index_and_includes_untracked_on_request() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_test_file(&repo_path, "f.txt", "a\n", "add f");
        std::fs::write(repo_path.join("f.txt"), "staged\n").unwrap();
        git(&repo_path, &["add", "f.txt"]);
        std::fs::write(repo_path.join("new.txt"), "untracked\n").unwrap();

        let git = Git::open(&repo_path).unwrap();
        assert!(git.has_untracked().unwrap());
        assert!(git.stash_push(STASH_MARKER, true).unwrap());
        assert!(!repo_path.join("new.txt").exists());
        assert_eq!(
            std::fs::read_to_string(repo_path.join("f.txt")).unwrap(),
            "staged\n"
        );

        git.stash_pop().unwrap();
        assert!(repo_path.join("new.txt").exists());
    }
}
