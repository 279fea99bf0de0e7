use super::{
    manual_commands, Checkpoint, CommittedGoal, Decision, DecisionPort, ExecError, ExecState,
    ExecutionReport, RollbackGuard,
};
use crate::git_ops::{GitError, GitGateway, STASH_MARKER};
use crate::plan::Plan;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the changes outside the current goal were set aside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Isolation {
    /// Whether a stash entry exists that has to be restored
    stashed: bool,
    include_untracked: bool,
}

enum Stop {
    /// Roll back and fail
    Fail(ExecError),
    /// Leave the repository as it is; the user finishes by hand
    Manual(ExecError, Vec<String>),
}

impl From<ExecError> for Stop {
    fn from(err: ExecError) -> Self {
        Stop::Fail(err)
    }
}

impl From<GitError> for Stop {
    fn from(err: GitError) -> Self {
        Stop::Fail(ExecError::Repository(err))
    }
}

/// Walks the plan one goal at a time, leaving only that goal's changes in
/// the working tree while the user decides
pub struct StepExecutor<'a, G: GitGateway + ?Sized> {
    git: &'a G,
    cancel: CancellationToken,
    state: ExecState,
}

impl<'a, G: GitGateway + ?Sized> StepExecutor<'a, G> {
    pub fn new(git: &'a G, cancel: CancellationToken) -> Self {
        Self {
            git,
            cancel,
            state: ExecState::Idle,
        }
    }

    pub fn state(&self) -> &ExecState {
        &self.state
    }

    fn transition(&mut self, next: ExecState) {
        debug!(from = ?self.state, to = ?next, "step executor");
        self.state = next;
    }

    pub async fn run<D: DecisionPort>(
        &mut self,
        plan: &Plan,
        guard: &mut RollbackGuard,
        decisions: &mut D,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::new();
        self.warn_about_leftover_stashes();

        match self.walk(plan, guard, decisions, &mut report).await {
            Ok(()) => self.transition(ExecState::Done),
            Err(Stop::Fail(err)) => {
                warn!(error = %err, "step-by-step execution failed");
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
            Err(Stop::Manual(err, steps)) => {
                warn!(error = %err, "step-by-step execution stopped");
                report.error = Some(err);
                report.manual_steps = steps;
                self.transition(ExecState::Failed);
            }
        }
        report.state = self.state.clone();
        report
    }

    async fn walk<D: DecisionPort>(
        &mut self,
        plan: &Plan,
        guard: &RollbackGuard,
        decisions: &mut D,
        report: &mut ExecutionReport,
    ) -> Result<(), Stop> {
        let total = plan.non_empty_goals().count();

        for (position, (goal, entry)) in plan.non_empty_goals().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ExecError::Cancelled.into());
            }

            self.transition(ExecState::Staging { goal });
            self.git.reset_index()?;
            for (idx, hunk) in entry.hunks.iter().enumerate() {
                if let Err(source) = self.git.apply_to_index(&hunk.content) {
                    return Err(ExecError::PatchApply {
                        goal,
                        file: hunk.file.clone(),
                        hunk: idx + 1,
                        source,
                    }
                    .into());
                }
            }

            self.transition(ExecState::Isolating { goal });
            let isolation = self.isolate(goal)?;
            debug!(goal, ?isolation, "isolated goal");

            self.transition(ExecState::AwaitingDecision { goal });
            let checkpoint = Checkpoint {
                goal,
                description: &entry.desc,
                hunks: &entry.hunks,
                position: position + 1,
                total,
            };
            let decision = tokio::select! {
                _ = self.cancel.cancelled() => None,
                decision = decisions.decide(&checkpoint) => Some(decision),
            };

            match decision {
                Some(Decision::Confirm) => {
                    self.transition(ExecState::Committing { goal });
                    self.restore(goal, isolation, guard)?;
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
                Some(Decision::Skip) => {
                    self.transition(ExecState::Skipping { goal });
                    self.restore(goal, isolation, guard)?;
                    self.git.reset_index()?;
                    info!(goal, "skipped goal");
                    report.skipped.push(goal);
                }
                Some(Decision::Abort) => {
                    self.transition(ExecState::Aborting { goal });
                    self.restore_best_effort(goal, isolation);
                    return Err(ExecError::Aborted { goal }.into());
                }
                None => {
                    self.transition(ExecState::Aborting { goal });
                    self.restore_best_effort(goal, isolation);
                    return Err(ExecError::Cancelled.into());
                }
            }
        }

        self.git.reset_index()?;
        Ok(())
    }

    fn isolate(&self, goal: u32) -> Result<Isolation, Stop> {
        let include_untracked = self.git.has_untracked()?;
        match self.git.stash_push(STASH_MARKER, include_untracked) {
            Ok(stashed) => Ok(Isolation {
                stashed,
                include_untracked,
            }),
            Err(source) => Err(ExecError::Isolation { goal, source }.into()),
        }
    }

    /// Bring the set-aside changes back. A failure leaves the stash entry in
    /// place and stops without touching anything else.
    fn restore(&self, goal: u32, isolation: Isolation, guard: &RollbackGuard) -> Result<(), Stop> {
        if !isolation.stashed {
            return Ok(());
        }
        self.git.stash_pop().map_err(|source| {
            let mut steps = Vec::new();
            if source.is_conflict() {
                steps.push("git status        # resolve the conflicted files".to_string());
                steps.push("git stash drop    # once the conflicts are resolved".to_string());
            } else {
                steps.push("git stash list    # the entry is marked git-split-temp".to_string());
                steps.push("git stash pop".to_string());
            }
            if let Some(point) = guard.point() {
                steps.push(format!(
                    "# to undo the commits made so far: {}",
                    manual_commands(point).join(" && ")
                ));
            }
            Stop::Manual(ExecError::Restore { goal, source }, steps)
        })
    }

    fn restore_best_effort(&self, goal: u32, isolation: Isolation) {
        if !isolation.stashed {
            return;
        }
        if let Err(err) = self.git.stash_pop() {
            warn!(goal, error = %err, "could not restore set-aside changes; they remain in the stash");
            eprintln!(
                "Warning: your other changes are still in the stash ({}). Run `git stash pop` to restore them.",
                STASH_MARKER
            );
        }
    }

    fn warn_about_leftover_stashes(&self) {
        if let Ok(entries) = self.git.stash_entries() {
            let leftovers = entries.iter().filter(|e| e.contains(STASH_MARKER)).count();
            if leftovers > 0 {
                warn!(leftovers, "stash entries from an earlier run exist");
                eprintln!(
                    "Note: {} stash entr{} from an earlier git-split run exist; see `git stash list`.",
                    leftovers,
                    if leftovers == 1 { "y" } else { "ies" }
                );
            }
        }
    }
}
