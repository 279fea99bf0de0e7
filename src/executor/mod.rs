//! Turning a plan into commits
//!
//! [`NormalExecutor`] commits every goal in one go and is all-or-nothing.
//! [`StepExecutor`] leaves only one goal's changes in the working tree at a
//! time and asks a [`DecisionPort`] before each commit. Both report through
//! [`ExecutionReport`] and undo their work through a [`RollbackGuard`].

mod decision;
mod normal;
mod rollback;
mod step;


pub use decision::{Checkpoint, Decision, DecisionPort, ScriptedDecisions, TerminalDecisions};
pub use normal::NormalExecutor;
pub use rollback::{manual_commands, RollbackGuard};
pub use step::StepExecutor;

use crate::git_ops::GitError;
use crate::verify::VerifyResult;
use thiserror::Error;

/// Where an execution currently is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecState {
    #[default]
    Idle,

    /// Staging the hunks of a goal (normal mode)
    Applying { goal: u32 },

    /// Creating the commit for a goal
    Committing { goal: u32 },

    /// Staging the hunks of a goal (step-by-step mode)
    Staging { goal: u32 },

    /// Setting everything outside the goal aside
    Isolating { goal: u32 },

    /// Waiting for the user to confirm, skip or abort
    AwaitingDecision { goal: u32 },

    Skipping { goal: u32 },

    Aborting { goal: u32 },

    /// Running the verification command
    Verifying,

    RollingBack,

    Done,

    Failed,
}

impl ExecState {
    pub fn status_text(&self) -> &'static str {
        match self {
            ExecState::Idle => "Ready",
            ExecState::Applying { .. } => "Applying hunks...",
            ExecState::Committing { .. } => "Committing...",
            ExecState::Staging { .. } => "Staging hunks...",
            ExecState::Isolating { .. } => "Isolating changes...",
            ExecState::AwaitingDecision { .. } => "Waiting for decision",
            ExecState::Skipping { .. } => "Skipping goal",
            ExecState::Aborting { .. } => "Aborting...",
            ExecState::Verifying => "Running verification...",
            ExecState::RollingBack => "Rolling back...",
            ExecState::Done => "Done",
            ExecState::Failed => "Failed",
        }
    }

    pub fn current_goal(&self) -> Option<u32> {
        match self {
            ExecState::Applying { goal }
            | ExecState::Committing { goal }
            | ExecState::Staging { goal }
            | ExecState::Isolating { goal }
            | ExecState::AwaitingDecision { goal }
            | ExecState::Skipping { goal }
            | ExecState::Aborting { goal } => Some(*goal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecState::Done | ExecState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("hunk {hunk} of {file} (goal {goal}) does not apply: {source}")]
    PatchApply {
        goal: u32,
        file: String,
        hunk: usize,
        source: GitError,
    },

    #[error("could not commit goal {goal}: {source}")]
    CommitCreation { goal: u32, source: GitError },

    #[error("could not set aside the changes outside goal {goal}: {source}")]
    Isolation { goal: u32, source: GitError },

    #[error("could not restore the changes set aside for goal {goal}: {source}")]
    Restore { goal: u32, source: GitError },

    #[error("verification command `{command}` failed")]
    Verification { command: String, output: String },

    #[error("cancelled")]
    Cancelled,

    #[error("aborted at goal {goal}")]
    Aborted { goal: u32 },

    #[error(transparent)]
    Repository(#[from] GitError),
}

/// What happened to the rollback point after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    /// No rollback point (diff read from a file); commits made so far remain
    NotAvailable,
    /// The guard already rolled back once; nothing further was undone
    AlreadyUsed,
    RolledBack { to: String },
    Failed {
        error: String,
        manual_commands: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedGoal {
    pub goal: u32,
    pub description: String,
    pub sha: String,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub commits: Vec<CommittedGoal>,
    pub skipped: Vec<u32>,
    pub verification: Option<VerifyResult>,
    pub error: Option<ExecError>,
    /// Set whenever a failure had to deal with the rollback point
    pub rollback: Option<RollbackStatus>,
    /// Steps the user has to finish by hand
    pub manual_steps: Vec<String>,
    pub state: ExecState,
}

impl ExecutionReport {
    fn new() -> Self {
        Self {
            commits: Vec::new(),
            skipped: Vec::new(),
            verification: None,
            error: None,
            rollback: None,
            manual_steps: Vec::new(),
            state: ExecState::Idle,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.state == ExecState::Done
    }

    /// Commits that are still on the branch after the execution
    pub fn surviving_commits(&self) -> &[CommittedGoal] {
        match self.rollback {
            Some(RollbackStatus::RolledBack { .. }) => &[],
            _ => &self.commits,
        }
    }

    /// Human readable summary for the terminal
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if self.succeeded() {
            lines.push(format!("Created {} commit(s).", self.commits.len()));
        } else if let Some(err) = &self.error {
            lines.push(format!("Execution failed: {}", err));
        }

        for commit in self.surviving_commits() {
            lines.push(format!(
                "  {} {}",
                crate::util::prefix_chars(&commit.sha, 8),
                commit.description
            ));
        }
        if !self.skipped.is_empty() {
            let ids: Vec<String> = self.skipped.iter().map(|g| g.to_string()).collect();
            lines.push(format!("Skipped goal(s): {}", ids.join(", ")));
        }
        if let Some(verification) = &self.verification {
            if !verification.passed && !verification.output.is_empty() {
                lines.push(format!("Output of `{}`:", verification.command));
                lines.push(verification.output.clone());
            }
        }

        match &self.rollback {
            Some(RollbackStatus::RolledBack { to }) => lines.push(format!(
                "Rolled back to {}. Your changes are back in the working tree.",
                crate::util::prefix_chars(to, 8)
            )),
            Some(RollbackStatus::NotAvailable) => lines.push(format!(
                "No rollback point for this diff source; {} commit(s) remain on the branch.",
                self.commits.len()
            )),
            Some(RollbackStatus::AlreadyUsed) => lines.push(
                "The rollback point was already used; nothing further was undone.".to_string(),
            ),
            Some(RollbackStatus::Failed { error, .. }) => {
                lines.push(format!("Rollback failed: {}", error));
            }
            None => {}
        }

        let mut manual: Vec<&str> = self.manual_steps.iter().map(String::as_str).collect();
        if let Some(RollbackStatus::Failed {
            manual_commands, ..
        }) = &self.rollback
        {
            manual.extend(manual_commands.iter().map(String::as_str));
        }
        if !manual.is_empty() {
            lines.push("To recover manually, run:".to_string());
            lines.extend(manual.iter().map(|step| format!("  {}", step)));
        }
        lines.join("\n")
    }
}
