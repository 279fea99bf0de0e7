//! The split pipeline: diff source -> hunks -> plan -> commits
//!
//! The pieces that touch the repository (`load_diff`, `prepare_rollback`,
//! `finish_draft`) and the plan editor (`apply_edit`) are plain functions so
//! they can be tested without a terminal. `run_split` wires them to stdin and
//! stdout for the CLI.

use crate::config::{fallback_secret, Settings};
use crate::credentials::CredentialStore;
use crate::diff::{split_diff, DiffSplit, Hunk};
use crate::executor::{ExecError, NormalExecutor, RollbackGuard, StepExecutor, TerminalDecisions};
use crate::git_ops::{DiffRange, Git, GitError, GitGateway};
use crate::llm::{Capability, HttpClassifier, Provider};
use crate::plan::{EditCommand, Plan, PlanBuilder, PlanError, EDITOR_HELP};
use crate::rotation::{RotatingClient, RotationError};
use crate::verify::VerifyCommand;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

const DRAFT_BRANCH_PREFIX: &str = "git-split-draft";

// ============================================================================
// Diff sources
// ============================================================================

/// Where the diff to split comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffSource {
    /// Uncommitted changes against `HEAD`
    WorkingTree,
    /// Commits on the current branch since it forked from `target`
    Branch { target: String },
    /// A patch file; it has no relationship to `HEAD`, so no rollback
    File(PathBuf),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not inside a git repository ({0})")]
    NotARepository(GitError),
    #[error("could not create a draft branch: {0}")]
    DraftBranch(GitError),
    #[error("could not read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} contains no diff", .0.display())]
    EmptyDiffFile(PathBuf),
    #[error(transparent)]
    Git(#[from] GitError),
}

/// What has to happen right before execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// Roll back to the current `HEAD` on failure
    CaptureHead,
    /// Move the branch tip back to where it forked so the branch's own
    /// changes become uncommitted again; roll back to the original tip
    MoveToMergeBase { base: String },
    NoRollback,
}

/// Branch created when the user asked to split against the branch they are on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftBranch {
    pub name: String,
    pub original: String,
    /// Commit the draft started at
    pub start: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftOutcome {
    /// Nothing was committed; switched back and deleted
    Deleted,
    /// Holds new commits; left for the user
    Kept(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDiff {
    pub text: String,
    pub preparation: Preparation,
    pub draft: Option<DraftBranch>,
}

impl LoadedDiff {
    fn from_file(text: String) -> Self {
        Self {
            text,
            preparation: Preparation::NoRollback,
            draft: None,
        }
    }
}

pub fn read_diff_file(path: &Path) -> Result<String, SourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| SourceError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(SourceError::EmptyDiffFile(path.to_path_buf()));
    }
    Ok(text)
}

/// `git-split-draft-20250101-120000-1a2b3c4d`
pub fn draft_branch_name(now: DateTime<Utc>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        DRAFT_BRANCH_PREFIX,
        now.format("%Y%m%d-%H%M%S"),
        &id[..8]
    )
}

pub fn load_diff<G: GitGateway + ?Sized>(
    git: &G,
    source: &DiffSource,
    now: DateTime<Utc>,
) -> Result<LoadedDiff, SourceError> {
    match source {
        DiffSource::File(path) => Ok(LoadedDiff::from_file(read_diff_file(path)?)),
        DiffSource::WorkingTree => Ok(LoadedDiff {
            text: git.diff(&DiffRange::WorkingTree)?,
            preparation: Preparation::CaptureHead,
            draft: None,
        }),
        DiffSource::Branch { target } => {
            let current = git.current_branch()?;
            if current.as_deref() == Some(target.as_str()) {
                let start = git.head()?;
                let name = draft_branch_name(now);
                git.create_branch(&name).map_err(SourceError::DraftBranch)?;
                debug!(branch = %name, "created draft branch");
                return Ok(LoadedDiff {
                    text: git.diff(&DiffRange::WorkingTree)?,
                    preparation: Preparation::CaptureHead,
                    draft: Some(DraftBranch {
                        name,
                        original: target.clone(),
                        start,
                    }),
                });
            }

            let base = git.merge_base(target, "HEAD")?;
            Ok(LoadedDiff {
                text: git.diff(&DiffRange::Since {
                    base: target.clone(),
                    head: "HEAD".to_string(),
                })?,
                preparation: Preparation::MoveToMergeBase { base },
                draft: None,
            })
        }
    }
}

/// Arm the rollback guard and put the repository in the state the plan's
/// hunks apply to.
pub fn prepare_rollback<G: GitGateway + ?Sized>(
    git: &G,
    preparation: &Preparation,
) -> Result<RollbackGuard, GitError> {
    match preparation {
        Preparation::CaptureHead => RollbackGuard::capture(git),
        Preparation::MoveToMergeBase { base } => {
            let guard = RollbackGuard::capture(git)?;
            git.soft_reset(base)?;
            Ok(guard)
        }
        Preparation::NoRollback => Ok(RollbackGuard::disabled()),
    }
}

/// Delete the draft branch unless something was committed on it.
pub fn finish_draft<G: GitGateway + ?Sized>(
    git: &G,
    draft: &DraftBranch,
) -> Result<DraftOutcome, GitError> {
    if git.head()? != draft.start {
        return Ok(DraftOutcome::Kept(draft.name.clone()));
    }
    git.switch_branch(&draft.original)?;
    git.delete_branch(&draft.name)?;
    Ok(DraftOutcome::Deleted)
}

// ============================================================================
// Plan editing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Updated(String),
    Execute,
    Quit,
}

pub fn apply_edit(plan: &mut Plan, command: EditCommand) -> Result<EditOutcome, PlanError> {
    Ok(match command {
        EditCommand::Move { from, to, file } => {
            let moved = plan.move_file(from, to, &file)?;
            EditOutcome::Updated(format!(
                "Moved {} hunk(s) of {} from goal {} to goal {}.",
                moved, file, from, to
            ))
        }
        EditCommand::Rename { goal, desc } => {
            plan.rename(goal, desc)?;
            EditOutcome::Updated(format!("Renamed goal {}.", goal))
        }
        EditCommand::Discard { goal } => {
            let dropped = plan.discard(goal)?;
            EditOutcome::Updated(format!(
                "Discarded {} hunk(s) from goal {}; they stay uncommitted.",
                dropped, goal
            ))
        }
        EditCommand::Create { desc } => {
            let id = plan.create(desc);
            EditOutcome::Updated(format!("Created goal {}.", id))
        }
        EditCommand::Execute => EditOutcome::Execute,
        EditCommand::Quit => EditOutcome::Quit,
    })
}

/// `--context` accepts either text or a path to a file holding it
pub fn read_file_or_text(input: &str) -> Result<String> {
    let path = Path::new(input);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file {}", path.display()));
    }
    Ok(input.to_string())
}

// ============================================================================
// CLI pipeline
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExecMode {
    /// Create every commit in one go
    #[default]
    Normal,
    /// Review each commit with only its changes in the working tree
    StepByStep,
}

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub source: DiffSource,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub mode: ExecMode,
    /// Skip the confirmation prompts
    pub execute: bool,
    pub edit_plan: bool,
    pub context: Option<String>,
    pub test_cmd: Option<String>,
    /// Name goals by hand instead of asking a model
    pub manual: bool,
}

/// Run `split` end to end and return the process exit code.
pub async fn run_split(
    opts: SplitOptions,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let git = match Git::open(&cwd) {
        Ok(git) => Some(git.with_timeout(settings.git_timeout)),
        Err(err) if matches!(opts.source, DiffSource::File(_)) => {
            eprintln!(
                "Warning: {}. The plan can be shown but not executed.",
                SourceError::NotARepository(err)
            );
            None
        }
        Err(err) => return Err(SourceError::NotARepository(err).into()),
    };

    let loaded = match (&git, &opts.source) {
        (Some(git), source) => load_diff(git, source, Utc::now())?,
        (None, DiffSource::File(path)) => LoadedDiff::from_file(read_diff_file(path)?),
        (None, _) => bail!("not inside a git repository"),
    };
    if let Some(draft) = &loaded.draft {
        println!(
            "You are on '{}'; working on the draft branch '{}'.",
            draft.original, draft.name
        );
    }

    let result = split_loaded(&opts, settings, git.as_ref(), &loaded, &cancel).await;

    if let (Some(git), Some(draft)) = (&git, &loaded.draft) {
        match finish_draft(git, draft) {
            Ok(DraftOutcome::Deleted) => debug!(branch = %draft.name, "deleted draft branch"),
            Ok(DraftOutcome::Kept(name)) => println!(
                "Commits were created on the draft branch '{}'. Merge it into '{}' when you are done.",
                name, draft.original
            ),
            Err(err) => eprintln!(
                "Warning: could not clean up the draft branch '{}': {}",
                draft.name, err
            ),
        }
    }
    result
}

async fn split_loaded(
    opts: &SplitOptions,
    settings: &Settings,
    git: Option<&Git>,
    loaded: &LoadedDiff,
    cancel: &CancellationToken,
) -> Result<i32> {
    let DiffSplit { hunks, skipped } = split_diff(&loaded.text);
    for section in &skipped {
        let file = section.file.as_deref().unwrap_or("<unknown path>");
        warn!(file, reason = section.reason.label(), "skipped diff section");
        eprintln!("  Skipped {} ({})", file, section.reason.label());
    }
    if hunks.is_empty() {
        eprintln!("No hunks to process.");
        return Ok(EXIT_FAILED);
    }
    let files: BTreeSet<&str> = hunks.iter().map(|h| h.file.as_str()).collect();
    println!("Found {} hunk(s) in {} file(s).", hunks.len(), files.len());

    let context = match &opts.context {
        Some(input) => read_file_or_text(input)?,
        None => String::new(),
    };

    let plan = if opts.manual {
        build_manual(&hunks).await?
    } else {
        match build_with_model(opts, settings, &hunks, &context, cancel).await {
            Ok(plan) => plan,
            Err(err)
                if matches!(
                    err.downcast_ref::<RotationError>(),
                    Some(RotationError::Cancelled)
                ) =>
            {
                eprintln!("Interrupted. Nothing was committed.");
                return Ok(EXIT_INTERRUPTED);
            }
            Err(err) => return Err(err),
        }
    };

    println!("\n{}", plan.render());
    if plan.non_empty_goals().next().is_none() {
        println!("Nothing to commit.");
        return Ok(EXIT_OK);
    }

    let Some(git) = git else {
        println!("No repository here; the plan was not executed.");
        return Ok(EXIT_OK);
    };

    let Some(plan) = choose_action(opts, plan, cancel).await? else {
        println!("Cancelled. Nothing was committed.");
        return Ok(EXIT_OK);
    };
    if plan.non_empty_goals().next().is_none() {
        println!("Nothing to commit.");
        return Ok(EXIT_OK);
    }

    if loaded.preparation == Preparation::NoRollback {
        eprintln!(
            "Warning: the diff comes from a file. Commits only apply if it matches the repository, and nothing can be rolled back."
        );
        if !opts.execute && !confirm("Continue? (y/N): ", cancel).await {
            println!("Cancelled. Nothing was committed.");
            return Ok(EXIT_OK);
        }
    }

    let mut guard = prepare_rollback(git, &loaded.preparation)?;
    if let Some(point) = guard.point() {
        println!("Rollback point: {}", crate::util::prefix_chars(point, 8));
    }

    let verify = opts
        .test_cmd
        .as_ref()
        .map(|cmd| VerifyCommand::new(git.root(), cmd.clone()));
    let report = match opts.mode {
        ExecMode::Normal => NormalExecutor::new(git, cancel.clone())
            .with_verification(verify)
            .run(&plan, &mut guard),
        ExecMode::StepByStep => {
            if verify.is_some() {
                eprintln!("Note: --test-cmd only runs in normal mode.");
            }
            StepExecutor::new(git, cancel.clone())
                .run(&plan, &mut guard, &mut TerminalDecisions)
                .await
        }
    };

    println!("\n{}", report.render());
    Ok(match &report.error {
        None => EXIT_OK,
        Some(ExecError::Cancelled) => EXIT_INTERRUPTED,
        Some(_) => EXIT_FAILED,
    })
}

async fn build_with_model(
    opts: &SplitOptions,
    settings: &Settings,
    hunks: &[Hunk],
    context: &str,
    cancel: &CancellationToken,
) -> Result<Plan> {
    let provider = opts.provider.unwrap_or(settings.provider);
    let provider_settings = settings.provider_settings(provider, opts.model.as_deref());

    let store = if provider.requires_key() {
        match CredentialStore::open(&settings.database_path) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(error = %err, "credential store unavailable");
                eprintln!(
                    "Warning: could not open the API key database at {}: {}",
                    settings.database_path.display(),
                    err
                );
                None
            }
        }
    } else {
        None
    };
    let pooled = match &store {
        Some(store) => store.active_count(provider.as_str())?,
        None => 0,
    };
    let fallback = fallback_secret(provider);

    let capability = Capability::resolve(&provider_settings, pooled > 0 || fallback.is_some());
    if let Capability::Unavailable(reason) = &capability {
        let env_hint = provider
            .key_env_var()
            .map(|var| format!(" or set {}", var))
            .unwrap_or_default();
        bail!(
            "{}\nAdd a key with `git-split api-key add {} <KEY>`{}.",
            reason,
            provider,
            env_hint
        );
    }
    println!("Using {} ({}).", provider, provider_settings.model);

    let classifier = HttpClassifier::new(capability, settings.request_timeout_secs)?;
    let mut client = RotatingClient::new(
        classifier,
        provider,
        settings.rotation_policy(),
        cancel.clone(),
    )
    .with_fallback_secret(fallback);
    if let Some(store) = store {
        client = client.with_store(store);
    }

    println!("Identifying goals...");
    let (plan, report) = PlanBuilder::build(&mut client, hunks, context).await?;
    if plan.goal_count() == 0 {
        bail!("No goals were identified.");
    }
    println!(
        "Assigned {} hunk(s) to {} goal(s).",
        report.assigned,
        plan.goal_count()
    );
    if report.unresolved > 0 {
        eprintln!(
            "Warning: {} hunk(s) could not be classified and stay uncommitted.",
            report.unresolved
        );
    }
    Ok(plan)
}

async fn build_manual(hunks: &[Hunk]) -> Result<Plan> {
    let hunks = hunks.to_vec();
    let (plan, report) = tokio::task::spawn_blocking(move || {
        println!("Name the goal (commit message) for each hunk.");
        println!("'.' reuses the previous name, an empty line leaves the hunk out.");
        let total = hunks.len();
        let mut position = 0;
        let mut last: Option<String> = None;
        PlanBuilder::manual(&hunks, |hunk| {
            position += 1;
            let answer = prompt_goal_name(hunk, position, total)?;
            let name = match answer.as_str() {
                "" => return None,
                "." => last.clone()?,
                _ => answer,
            };
            last = Some(name.clone());
            Some(name)
        })
    })
    .await
    .context("Manual classification stopped unexpectedly")?;

    if report.unresolved > 0 {
        println!("{} hunk(s) left out of the plan.", report.unresolved);
    }
    Ok(plan)
}

fn prompt_goal_name(hunk: &Hunk, position: usize, total: usize) -> Option<String> {
    println!();
    println!(
        "[{}/{}] {} {}",
        position,
        total,
        hunk.file,
        hunk.header_line().unwrap_or_default()
    );
    let body: Vec<&str> = hunk
        .content
        .lines()
        .skip_while(|line| !line.starts_with("@@"))
        .skip(1)
        .take(12)
        .collect();
    for line in body {
        println!("    {}", line);
    }
    print!("Goal: ");
    let _ = io::stdout().flush();

    let mut buf = String::new();
    match io::stdin().lock().read_line(&mut buf) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(buf.trim().to_string()),
    }
}

async fn choose_action(
    opts: &SplitOptions,
    plan: Plan,
    cancel: &CancellationToken,
) -> Result<Option<Plan>> {
    if opts.execute {
        return Ok(Some(plan));
    }
    if !opts.edit_plan {
        loop {
            let Some(answer) =
                read_line("What now? (e)xecute, (ed)it plan, (c)ancel [e]: ", cancel).await
            else {
                return Ok(None);
            };
            match answer.to_lowercase().as_str() {
                "" | "e" => return Ok(Some(plan)),
                "ed" => break,
                "c" => return Ok(None),
                _ => println!("Please answer e, ed or c."),
            }
        }
    }
    edit_plan(plan, cancel).await
}

async fn edit_plan(mut plan: Plan, cancel: &CancellationToken) -> Result<Option<Plan>> {
    println!("{}", EDITOR_HELP);
    loop {
        let Some(line) = read_line("plan> ", cancel).await else {
            return Ok(None);
        };
        let command = match EditCommand::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        if let EditCommand::Discard { goal } = &command {
            let prompt = format!("Discard every hunk of goal {}? (y/N): ", goal);
            if plan.get(*goal).is_some() && !confirm(&prompt, cancel).await {
                continue;
            }
        }
        match apply_edit(&mut plan, command) {
            Ok(EditOutcome::Updated(message)) => {
                println!("{}", message);
                println!("{}", plan.render());
            }
            Ok(EditOutcome::Execute) => return Ok(Some(plan)),
            Ok(EditOutcome::Quit) => return Ok(None),
            Err(err) => println!("{}", err),
        }
    }
}

/// One line from stdin, or `None` on end of input or cancellation
async fn read_line(prompt: &str, cancel: &CancellationToken) -> Option<String> {
    print!("{}", prompt);
    let _ = io::stdout().flush();

    let read = tokio::task::spawn_blocking(|| {
        let mut buf = String::new();
        io::stdin().lock().read_line(&mut buf).map(|n| (n, buf))
    });
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = read => match result {
            Ok(Ok((0, _))) | Ok(Err(_)) | Err(_) => None,
            Ok(Ok((_, line))) => Some(line.trim().to_string()),
        },
    }
}

async fn confirm(prompt: &str, cancel: &CancellationToken) -> bool {
    matches!(
        read_line(prompt, cancel).await.as_deref().map(str::to_lowercase).as_deref(),
        Some("y" | "yes")
    )
}
