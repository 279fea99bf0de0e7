use super::RollbackStatus;
use crate::git_ops::{GitError, GitGateway};
use tracing::{debug, warn};

/// The commit to return to if an execution fails
///
/// Only diffs read from the live repository get a rollback point; a diff
/// loaded from a file has no relationship to `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackGuard {
    point: Option<String>,
    spent: bool,
}

impl RollbackGuard {
    /// Remember the current `HEAD`
    pub fn capture<G: GitGateway + ?Sized>(git: &G) -> Result<Self, GitError> {
        let point = git.head()?;
        debug!(point = %point, "captured rollback point");
        Ok(Self {
            point: Some(point),
            spent: false,
        })
    }

    pub fn at(sha: impl Into<String>) -> Self {
        Self {
            point: Some(sha.into()),
            spent: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            point: None,
            spent: false,
        }
    }

    pub fn point(&self) -> Option<&str> {
        self.point.as_deref()
    }

    pub fn is_armed(&self) -> bool {
        self.point.is_some()
    }

    /// Move the branch back to the rollback point and clear the index,
    /// leaving every file as it is. The guard is spent afterwards.
    pub fn rollback<G: GitGateway + ?Sized>(&mut self, git: &G) -> RollbackStatus {
        let Some(point) = self.point.take() else {
            return if self.spent {
                RollbackStatus::AlreadyUsed
            } else {
                RollbackStatus::NotAvailable
            };
        };
        self.spent = true;

        let result = git.soft_reset(&point).and_then(|_| git.reset_index());
        match result {
            Ok(()) => {
                debug!(point = %point, "rolled back");
                RollbackStatus::RolledBack { to: point }
            }
            Err(err) => {
                warn!(point = %point, error = %err, "rollback failed");
                RollbackStatus::Failed {
                    error: err.to_string(),
                    manual_commands: manual_commands(&point),
                }
            }
        }
    }
}

/// Commands that undo an execution by hand
pub fn manual_commands(point: &str) -> Vec<String> {
    vec![format!("git reset --soft {}", point), "git reset".to_string()]
}
