//! Commit plans
//!
//! A plan maps goal ids to a commit message and the hunks that belong in that
//! commit. Goals iterate in ascending id order, which is also commit order.

use crate::diff::Hunk;
use crate::llm::ClassificationPort;
use crate::rotation::{RotatingClient, RotationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use thiserror::Error;

/// A logical change that becomes one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: u32,
    pub description: String,
}

impl Goal {
    pub fn new(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalEntry {
    pub desc: String,
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("goal {0} does not exist")]
    UnknownGoal(u32),
    #[error("goal {goal} has no hunks for {file}")]
    FileNotInGoal { goal: u32, file: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    goals: BTreeMap<u32, GoalEntry>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan with the given goals and no hunks yet
    pub fn with_goals(goals: &[Goal]) -> Self {
        let mut plan = Self::new();
        for goal in goals {
            plan.goals.entry(goal.id).or_insert_with(|| GoalEntry {
                desc: goal.description.clone(),
                hunks: Vec::new(),
            });
        }
        plan
    }

    pub fn get(&self, id: u32) -> Option<&GoalEntry> {
        self.goals.get(&id)
    }

    /// Goals in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &GoalEntry)> {
        self.goals.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn goal_count(&self) -> usize {
        self.goals.len()
    }

    pub fn total_hunks(&self) -> usize {
        self.goals.values().map(|g| g.hunks.len()).sum()
    }

    /// Goals that would produce a commit
    pub fn non_empty_goals(&self) -> impl Iterator<Item = (u32, &GoalEntry)> {
        self.iter().filter(|(_, entry)| !entry.hunks.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.total_hunks() == 0
    }

    pub fn goals(&self) -> Vec<Goal> {
        self.iter()
            .map(|(id, entry)| Goal::new(id, entry.desc.clone()))
            .collect()
    }

    /// Append a hunk to an existing goal
    pub fn assign(&mut self, goal: u32, hunk: Hunk) -> Result<(), PlanError> {
        let entry = self
            .goals
            .get_mut(&goal)
            .ok_or(PlanError::UnknownGoal(goal))?;
        entry.hunks.push(hunk);
        Ok(())
    }

    /// Move every hunk of `file` from one goal to another. Returns how many
    /// hunks moved.
    pub fn move_file(&mut self, from: u32, to: u32, file: &str) -> Result<usize, PlanError> {
        if !self.goals.contains_key(&to) {
            return Err(PlanError::UnknownGoal(to));
        }
        let source = self
            .goals
            .get_mut(&from)
            .ok_or(PlanError::UnknownGoal(from))?;

        let (moving, staying): (Vec<Hunk>, Vec<Hunk>) =
            source.hunks.drain(..).partition(|h| h.file == file);
        source.hunks = staying;

        if moving.is_empty() {
            return Err(PlanError::FileNotInGoal {
                goal: from,
                file: file.to_string(),
            });
        }

        let moved = moving.len();
        if let Some(target) = self.goals.get_mut(&to) {
            target.hunks.extend(moving);
        }
        Ok(moved)
    }

    pub fn rename(&mut self, goal: u32, desc: impl Into<String>) -> Result<(), PlanError> {
        let entry = self
            .goals
            .get_mut(&goal)
            .ok_or(PlanError::UnknownGoal(goal))?;
        entry.desc = desc.into();
        Ok(())
    }

    /// Empty a goal. Returns the number of hunks dropped.
    pub fn discard(&mut self, goal: u32) -> Result<usize, PlanError> {
        let entry = self
            .goals
            .get_mut(&goal)
            .ok_or(PlanError::UnknownGoal(goal))?;
        let dropped = entry.hunks.len();
        entry.hunks.clear();
        Ok(dropped)
    }

    /// Add an empty goal and return its id
    pub fn create(&mut self, desc: impl Into<String>) -> u32 {
        let id = self.goals.keys().next_back().map(|max| max + 1).unwrap_or(1);
        self.goals.insert(
            id,
            GoalEntry {
                desc: desc.into(),
                hunks: Vec::new(),
            },
        );
        id
    }

    /// Listing shown before execution and in the plan editor
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (id, entry) in self.iter() {
            let _ = writeln!(out, "Goal {}: {}", id, entry.desc);
            if entry.hunks.is_empty() {
                let _ = writeln!(out, "    (empty)");
                continue;
            }
            let mut files: Vec<(&str, usize, usize, usize)> = Vec::new();
            for hunk in &entry.hunks {
                let (adds, removes) = hunk.line_stats();
                match files.iter_mut().find(|f| f.0 == hunk.file) {
                    Some(f) => {
                        f.1 += 1;
                        f.2 += adds;
                        f.3 += removes;
                    }
                    None => files.push((&hunk.file, 1, adds, removes)),
                }
            }
            for (file, count, adds, removes) in files {
                let noun = if count == 1 { "hunk" } else { "hunks" };
                let _ = writeln!(out, "    {} ({} {}, +{} -{})", file, count, noun, adds, removes);
            }
        }
        out
    }
}

/// Outcome counters for plan construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub assigned: usize,
    pub unresolved: usize,
}

pub struct PlanBuilder;

impl PlanBuilder {
    /// Identify goals once, then classify each hunk in order.
    ///
    /// Hunks whose classification fails or names an unknown goal are dropped
    /// and counted. Cancellation and failure to identify goals abort the
    /// build.
    pub async fn build<P: ClassificationPort>(
        client: &mut RotatingClient<P>,
        hunks: &[Hunk],
        context: &str,
    ) -> Result<(Plan, BuildReport), RotationError> {
        let mut goals = client.identify_goals(hunks, context).await?;
        dedupe_goals(&mut goals);
        tracing::debug!(count = goals.len(), "identified goals");

        let mut plan = Plan::with_goals(&goals);
        let mut report = BuildReport::default();

        for (idx, hunk) in hunks.iter().enumerate() {
            match client.classify(hunk, &goals, context).await {
                Ok(id) => {
                    if plan.assign(id, hunk.clone()).is_ok() {
                        report.assigned += 1;
                    } else {
                        tracing::warn!(file = %hunk.file, goal = id, "classified into unknown goal");
                        report.unresolved += 1;
                    }
                }
                Err(RotationError::Cancelled) => return Err(RotationError::Cancelled),
                Err(err) => {
                    tracing::warn!(file = %hunk.file, hunk = idx, error = %err, "classification failed");
                    report.unresolved += 1;
                }
            }
        }

        Ok((plan, report))
    }

    /// Build a plan from names given per hunk. `None` leaves the hunk out.
    /// Goals are numbered in the order names first appear.
    pub fn manual<F>(hunks: &[Hunk], mut assign: F) -> (Plan, BuildReport)
    where
        F: FnMut(&Hunk) -> Option<String>,
    {
        let mut plan = Plan::new();
        let mut ids: HashMap<String, u32> = HashMap::new();
        let mut report = BuildReport::default();

        for hunk in hunks {
            let name = assign(hunk)
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            let Some(name) = name else {
                report.unresolved += 1;
                continue;
            };
            let id = match ids.get(&name) {
                Some(id) => *id,
                None => {
                    let id = plan.create(name.clone());
                    ids.insert(name, id);
                    id
                }
            };
            if plan.assign(id, hunk.clone()).is_ok() {
                report.assigned += 1;
            }
        }

        (plan, report)
    }
}

fn dedupe_goals(goals: &mut Vec<Goal>) {
    let mut seen = std::collections::HashSet::new();
    goals.retain(|g| seen.insert(g.id));
}

// ============================================================================
// Plan editor commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditCommand {
    Move { from: u32, to: u32, file: String },
    Rename { goal: u32, desc: String },
    Discard { goal: u32 },
    Create { desc: String },
    Execute,
    Quit,
}

pub const EDITOR_HELP: &str = "Commands:
  m <from> <to> <file>   move a file's hunks between goals
  r <id> <message>       rename a goal
  d <id>                 discard a goal's hunks
  n <message>            create a new goal
  e                      execute the plan
  q                      quit without committing";

impl EditCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match cmd {
            "m" => {
                let mut parts = rest.splitn(3, char::is_whitespace);
                let from = parse_id(parts.next())?;
                let to = parse_id(parts.next())?;
                let file = parts.next().map(str::trim).unwrap_or_default();
                if file.is_empty() {
                    return Err("usage: m <from> <to> <file>".to_string());
                }
                Ok(EditCommand::Move {
                    from,
                    to,
                    file: file.to_string(),
                })
            }
            "r" => {
                let (id, desc) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "usage: r <id> <message>".to_string())?;
                let desc = desc.trim();
                if desc.is_empty() {
                    return Err("usage: r <id> <message>".to_string());
                }
                Ok(EditCommand::Rename {
                    goal: parse_id(Some(id))?,
                    desc: desc.to_string(),
                })
            }
            "d" => Ok(EditCommand::Discard {
                goal: parse_id(Some(rest))?,
            }),
            "n" => {
                if rest.is_empty() {
                    return Err("usage: n <message>".to_string());
                }
                Ok(EditCommand::Create {
                    desc: rest.to_string(),
                })
            }
            "e" => Ok(EditCommand::Execute),
            "q" => Ok(EditCommand::Quit),
            "" => Err(EDITOR_HELP.to_string()),
            other => Err(format!("unknown command '{}'\n{}", other, EDITOR_HELP)),
        }
    }
}

fn parse_id(token: Option<&str>) -> Result<u32, String> {
    let token = token.map(str::trim).unwrap_or_default();
    token
        .parse()
        .map_err(|_| format!("'{}' is not a goal id", token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_hunks;

    fn hunk(file: &str, n: usize) -> Hunk {
        Hunk {
            file: file.to_string(),
            content: format!(
                "diff --git a/{f} b/{f}\n--- a/{f}\n+++ b/{f}\n@@ -{n} +{n} @@\n-old\n+new\n",
                f = file,
                n = n
            ),
        }
    }

    fn sample_plan() -> Plan {
        let mut plan = Plan::with_goals(&[Goal::new(1, "feat A"), Goal::new(2, "fix B")]);
        plan.assign(1, hunk("a.rs", 1)).unwrap();
        plan.assign(1, hunk("a.rs", 9)).unwrap();
        plan.assign(1, hunk("c.rs", 1)).unwrap();
        plan.assign(2, hunk("b.rs", 1)).unwrap();
        plan
    }

    #[test]
    fn test_move_file_relocates_all_hunks_for_file() {
        let mut plan = sample_plan();
        assert_eq!(plan.move_file(1, 2, "a.rs").unwrap(), 2);
        assert_eq!(plan.get(1).unwrap().hunks.len(), 1);
        assert_eq!(plan.get(2).unwrap().hunks.len(), 3);
        assert_eq!(plan.total_hunks(), 4);
    }

    #[test]
    fn test_move_file_errors() {
        let mut plan = sample_plan();
        assert_eq!(plan.move_file(7, 2, "a.rs"), Err(PlanError::UnknownGoal(7)));
        assert_eq!(plan.move_file(1, 9, "a.rs"), Err(PlanError::UnknownGoal(9)));
        assert_eq!(
            plan.move_file(2, 1, "a.rs"),
            Err(PlanError::FileNotInGoal {
                goal: 2,
                file: "a.rs".to_string()
            })
        );
        // Failed moves leave the plan untouched
        assert_eq!(plan, sample_plan());
    }

    #[test]
    fn test_rename_and_discard() {
        let mut plan = sample_plan();
        plan.rename(2, "fix: handle B").unwrap();
        assert_eq!(plan.get(2).unwrap().desc, "fix: handle B");
        assert_eq!(plan.rename(3, "x"), Err(PlanError::UnknownGoal(3)));

        assert_eq!(plan.discard(1).unwrap(), 3);
        assert!(plan.get(1).unwrap().hunks.is_empty());
        assert_eq!(plan.non_empty_goals().count(), 1);
        assert_eq!(plan.discard(5), Err(PlanError::UnknownGoal(5)));
    }

    #[test]
    fn test_create_allocates_max_plus_one() {
        let mut empty = Plan::new();
        assert_eq!(empty.create("first"), 1);

        let mut plan = Plan::with_goals(&[Goal::new(2, "a"), Goal::new(7, "b")]);
        assert_eq!(plan.create("c"), 8);
        assert_eq!(plan.goal_count(), 3);
    }

    #[test]
    fn test_hunk_count_conserved_across_edits() {
        let mut plan = sample_plan();
        let total = plan.total_hunks();

        plan.move_file(1, 2, "c.rs").unwrap();
        let new_goal = plan.create("docs");
        plan.move_file(2, new_goal, "b.rs").unwrap();
        plan.rename(new_goal, "docs: tidy").unwrap();
        assert_eq!(plan.total_hunks(), total);

        let discarded = plan.discard(2).unwrap();
        assert_eq!(plan.total_hunks(), total - discarded);
    }

    #[test]
    fn test_iteration_is_ascending() {
        let plan = Plan::with_goals(&[Goal::new(3, "c"), Goal::new(1, "a"), Goal::new(2, "b")]);
        let ids: Vec<u32> = plan.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_manual_assignment_numbers_goals_by_first_use() {
        let hunks = vec![hunk("a.rs", 1), hunk("b.rs", 1), hunk("c.rs", 1), hunk("d.rs", 1)];
        let mut names = vec![Some("refactor"), Some("docs"), None, Some("refactor")].into_iter();
        let (plan, report) =
            PlanBuilder::manual(&hunks, |_| names.next().flatten().map(str::to_string));

        assert_eq!(report, BuildReport { assigned: 3, unresolved: 1 });
        assert_eq!(plan.get(1).unwrap().desc, "refactor");
        assert_eq!(plan.get(1).unwrap().hunks.len(), 2);
        assert_eq!(plan.get(2).unwrap().desc, "docs");
    }

    #[test]
    fn test_render_groups_by_file() {
        let plan = sample_plan();
        let text = plan.render();
        assert!(text.contains("Goal 1: feat A"));
        assert!(text.contains("a.rs (2 hunks, +2 -2)"));
        assert!(text.contains("b.rs (1 hunk, +1 -1)"));
    }

    #[test]
    fn test_parse_edit_commands() {
        assert_eq!(
            EditCommand::parse("m 1 2 src/my file.rs").unwrap(),
            EditCommand::Move {
                from: 1,
                to: 2,
                file: "src/my file.rs".to_string()
            }
        );
        assert_eq!(
            EditCommand::parse("r 3 feat: better name").unwrap(),
            EditCommand::Rename {
                goal: 3,
                desc: "feat: better name".to_string()
            }
        );
        assert_eq!(EditCommand::parse(" d 2 ").unwrap(), EditCommand::Discard { goal: 2 });
        assert_eq!(
            EditCommand::parse("n chore: deps").unwrap(),
            EditCommand::Create {
                desc: "chore: deps".to_string()
            }
        );
        assert_eq!(EditCommand::parse("e").unwrap(), EditCommand::Execute);
        assert_eq!(EditCommand::parse("q").unwrap(), EditCommand::Quit);
        assert!(EditCommand::parse("m 1 x f").is_err());
        assert!(EditCommand::parse("m 1 2").is_err());
        assert!(EditCommand::parse("r 1").is_err());
        assert!(EditCommand::parse("z").is_err());
    }

    #[test]
    fn test_plan_from_parsed_diff_keeps_every_hunk() {
        let diff = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-1\n+2\n@@ -5 +5 @@\n-5\n+6\n";
        let hunks = parse_hunks(diff);
        let (plan, _) = PlanBuilder::manual(&hunks, |_| Some("all".to_string()));
        assert_eq!(plan.total_hunks(), hunks.len());
    }
}
