use git_split::diff::{split_diff, Hunk};
use git_split::executor::{ExecError, NormalExecutor, RollbackStatus};
use git_split::git_ops::{Git, GitGateway};
use git_split::llm::{Auth, ClassificationPort, Provider, ProviderError};
use git_split::plan::{Goal, PlanBuilder};
use git_split::rotation::{RotatingClient, RotationPolicy};
use git_split::workflow::{load_diff, prepare_rollback, DiffSource, Preparation};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn git(repo: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .current_dir(repo)
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

fn repo_with_files() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path();
    git(path, &["init", "--quiet"]);
    git(path, &["config", "user.name", "Test User"]);
    git(path, &["config", "user.email", "test@example.com"]);
    let lines: String = (1..=20).map(|n| format!("line {}\n", n)).collect();
    std::fs::write(path.join("api.rs"), &lines).unwrap();
    std::fs::write(path.join("docs.md"), &lines).unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "--quiet", "-m", "initial"]);
    dir
}

fn edit(path: &Path, file: &str, line: usize, text: &str) {
    let content = std::fs::read_to_string(path.join(file)).unwrap();
    let edited: String = content
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i + 1 == line {
                format!("{}\n", text)
            } else {
                format!("{}\n", l)
            }
        })
        .collect();
    std::fs::write(path.join(file), edited).unwrap();
}

fn subjects(path: &Path) -> Vec<String> {
    git(path, &["log", "--format=%s"])
        .lines()
        .map(str::to_string)
        .collect()
}

/// Sends `.rs` hunks to goal 1 and everything else to goal 2
struct ByExtension {
    calls: Mutex<usize>,
}

impl ClassificationPort for ByExtension {
    async fn identify_goals(
        &self,
        _auth: &Auth,
        _hunks: &[Hunk],
        _context: &str,
    ) -> Result<Vec<Goal>, ProviderError> {
        Ok(vec![
            Goal::new(1, "feat: rework the api"),
            Goal::new(2, "docs: describe the api"),
        ])
    }

    async fn classify(
        &self,
        _auth: &Auth,
        hunk: &Hunk,
        _goals: &[Goal],
        _context: &str,
    ) -> Result<u32, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        Ok(if hunk.file.ends_with(".rs") { 1 } else { 2 })
    }
}

fn quick_policy() -> RotationPolicy {
    RotationPolicy {
        wait: Duration::from_millis(5),
        max_sweeps: 1,
        local_retries: 1,
        initial_backoff: Duration::from_millis(1),
        countdown_interval: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn working_tree_changes_become_one_commit_per_goal() {
    let dir = repo_with_files();
    let path = dir.path();
    edit(path, "api.rs", 2, "fn api_v2() {}");
    edit(path, "api.rs", 18, "fn helper() {}");
    edit(path, "docs.md", 5, "The api now has a v2.");

    let repo = Git::open(path).unwrap();
    let loaded = load_diff(&repo, &DiffSource::WorkingTree, chrono::Utc::now()).unwrap();
    let hunks = split_diff(&loaded.text).hunks;
    assert_eq!(hunks.len(), 3);

    let port = ByExtension {
        calls: Mutex::new(0),
    };
    let mut client = RotatingClient::new(
        port,
        Provider::Ollama,
        quick_policy(),
        CancellationToken::new(),
    );
    let (plan, report) = PlanBuilder::build(&mut client, &hunks, "").await.unwrap();
    assert_eq!(report.assigned, 3);
    assert_eq!(report.unresolved, 0);
    assert_eq!(*client.client().calls.lock().unwrap(), 3);

    let mut guard = prepare_rollback(&repo, &loaded.preparation).unwrap();
    let report = NormalExecutor::new(&repo, CancellationToken::new()).run(&plan, &mut guard);

    assert!(report.succeeded(), "{}", report.render());
    assert_eq!(
        subjects(path),
        vec!["docs: describe the api", "feat: rework the api", "initial"]
    );
    assert!(git(path, &["status", "--porcelain"]).is_empty());
    assert_eq!(
        git(path, &["show", "--name-only", "--format=", "HEAD~1"]).trim(),
        "api.rs"
    );
}

#[tokio::test]
async fn unclassifiable_hunks_stay_in_the_working_tree() {
    struct OnlyDocs;

    impl ClassificationPort for OnlyDocs {
        async fn identify_goals(
            &self,
            _auth: &Auth,
            _hunks: &[Hunk],
            _context: &str,
        ) -> Result<Vec<Goal>, ProviderError> {
            Ok(vec![Goal::new(1, "docs: typo")])
        }

        async fn classify(
            &self,
            _auth: &Auth,
            hunk: &Hunk,
            _goals: &[Goal],
            _context: &str,
        ) -> Result<u32, ProviderError> {
            if hunk.file == "docs.md" {
                Ok(1)
            } else {
                Err(ProviderError::other("reply named no goal"))
            }
        }
    }

    let dir = repo_with_files();
    let path = dir.path();
    edit(path, "api.rs", 10, "fn unsure() {}");
    edit(path, "docs.md", 10, "typo fixed");

    let repo = Git::open(path).unwrap();
    let loaded = load_diff(&repo, &DiffSource::WorkingTree, chrono::Utc::now()).unwrap();
    let hunks = split_diff(&loaded.text).hunks;

    let mut client = RotatingClient::new(
        OnlyDocs,
        Provider::Ollama,
        quick_policy(),
        CancellationToken::new(),
    );
    let (plan, report) = PlanBuilder::build(&mut client, &hunks, "").await.unwrap();
    assert_eq!(report.unresolved, 1);

    let mut guard = prepare_rollback(&repo, &loaded.preparation).unwrap();
    let report = NormalExecutor::new(&repo, CancellationToken::new()).run(&plan, &mut guard);
    assert!(report.succeeded());
    assert_eq!(subjects(path)[0], "docs: typo");
    assert_eq!(git(path, &["status", "--porcelain"]).trim(), "M api.rs");
}

#[test]
fn diff_file_that_stops_applying_keeps_earlier_commits() {
    let dir = repo_with_files();
    let path = dir.path();
    edit(path, "api.rs", 3, "fn from_patch() {}");
    edit(path, "docs.md", 3, "patched docs");
    let patch = git(path, &["diff"]);
    git(path, &["checkout", "--quiet", "--", "."]);

    let patch_path = dir.path().join("changes.patch");
    std::fs::write(&patch_path, &patch).unwrap();
    // docs.md moves on, so the second hunk no longer applies
    edit(path, "docs.md", 3, "someone else edited this");
    git(path, &["commit", "--quiet", "-am", "concurrent edit"]);

    let repo = Git::open(path).unwrap();
    let loaded = load_diff(&repo, &DiffSource::File(patch_path), chrono::Utc::now()).unwrap();
    assert_eq!(loaded.preparation, Preparation::NoRollback);

    let hunks = split_diff(&loaded.text).hunks;
    let (plan, _) = PlanBuilder::manual(&hunks, |hunk| {
        Some(if hunk.file == "api.rs" {
            "feat: patched api".to_string()
        } else {
            "docs: patched docs".to_string()
        })
    });

    let mut guard = prepare_rollback(&repo, &loaded.preparation).unwrap();
    let report = NormalExecutor::new(&repo, CancellationToken::new()).run(&plan, &mut guard);

    assert!(matches!(report.error, Some(ExecError::PatchApply { goal: 2, .. })));
    assert_eq!(report.rollback, Some(RollbackStatus::NotAvailable));
    assert_eq!(subjects(path)[0], "feat: patched api");
    assert!(report.render().contains("No rollback point"));
    assert_eq!(repo.head().unwrap().len(), 40);
}
