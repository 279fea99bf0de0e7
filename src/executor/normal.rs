use super::{CommittedGoal, ExecError, ExecState, ExecutionReport, RollbackGuard};
use crate::git_ops::GitGateway;
use crate::plan::Plan;
use crate::verify::{self, VerifyCommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commits every goal in ascending order without stopping
///
/// Any failure rolls the whole plan back when a rollback point exists.
pub struct NormalExecutor<'a, G: GitGateway + ?Sized> {
    git: &'a G,
    verify: Option<VerifyCommand>,
    cancel: CancellationToken,
    state: ExecState,
}

impl<'a, G: GitGateway + ?Sized> NormalExecutor<'a, G> {
    pub fn new(git: &'a G, cancel: CancellationToken) -> Self {
        Self {
            git,
            verify: None,
            cancel,
            state: ExecState::Idle,
        }
    }

    /// Run `command` after the last commit; failure rolls everything back
    pub fn with_verification(mut self, command: Option<VerifyCommand>) -> Self {
        self.verify = command;
        self
    }

    pub fn state(&self) -> &ExecState {
        &self.state
    }

    fn transition(&mut self, next: ExecState) {
        debug!(from = ?self.state, to = ?next, "normal executor");
        self.state = next;
    }

    pub fn run(&mut self, plan: &Plan, guard: &mut RollbackGuard) -> ExecutionReport {
        let mut report = ExecutionReport::new();
        match self.commit_all(plan, &mut report) {
            Ok(()) => {
                self.transition(ExecState::Done);
            }
            Err(err) => {
                warn!(error = %err, "execution failed");
                self.transition(ExecState::RollingBack);
                if !guard.is_armed() {
                    if let Err(reset_err) = self.git.reset_index() {
                        warn!(error = %reset_err, "could not clear the index after the failure");
                    }
                }
                report.rollback = Some(guard.rollback(self.git));
                report.error = Some(err);
                self.transition(ExecState::Failed);
            }
        }
        report.state = self.state.clone();
        report
    }

    fn commit_all(&mut self, plan: &Plan, report: &mut ExecutionReport) -> Result<(), ExecError> {
        for (goal, entry) in plan.non_empty_goals() {
            if self.cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }

            self.transition(ExecState::Applying { goal });
            self.git.reset_index()?;
            for (idx, hunk) in entry.hunks.iter().enumerate() {
                self.git
                    .apply_to_index(&hunk.content)
                    .map_err(|source| ExecError::PatchApply {
                        goal,
                        file: hunk.file.clone(),
                        hunk: idx + 1,
                        source,
                    })?;
            }

            self.transition(ExecState::Committing { goal });
            let sha = self
                .git
                .commit(&entry.desc)
                .map_err(|source| ExecError::CommitCreation { goal, source })?;
            info!(goal, sha = %sha, "committed goal");
            println!(
                "✓ Goal {}: {} ({})",
                goal,
                entry.desc,
                crate::util::prefix_chars(&sha, 8)
            );
            report.commits.push(CommittedGoal {
                goal,
                description: entry.desc.clone(),
                sha,
            });
        }

        if let Some(command) = self.verify.clone() {
            self.transition(ExecState::Verifying);
            let result = verify::run(&command.root, &command.command, command.timeout);
            let passed = result.passed;
            let output = result.output.clone();
            report.verification = Some(result);
            if !passed {
                return Err(ExecError::Verification {
                    command: command.command.clone(),
                    output,
                });
            }
        }
        Ok(())
    }
}
