use crate::diff::Hunk;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, Write};

/// The user's answer at a step-by-step checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Confirm,
    Skip,
    Abort,
}

impl Decision {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "c" | "confirm" | "y" | "yes" => Some(Decision::Confirm),
            "s" | "skip" => Some(Decision::Skip),
            "a" | "abort" | "q" | "quit" => Some(Decision::Abort),
            _ => None,
        }
    }
}

/// What the user is asked about: one goal, isolated in the working tree
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<'a> {
    pub goal: u32,
    pub description: &'a str,
    pub hunks: &'a [Hunk],
    /// 1-based position among the goals being executed
    pub position: usize,
    pub total: usize,
}

impl Checkpoint<'_> {
    /// Per-file line counts for the goal
    pub fn file_summary(&self) -> Vec<String> {
        let mut files: BTreeMap<&str, (usize, usize, usize)> = BTreeMap::new();
        for hunk in self.hunks {
            let (added, removed) = hunk.line_stats();
            let entry = files.entry(hunk.file.as_str()).or_default();
            entry.0 += 1;
            entry.1 += added;
            entry.2 += removed;
        }
        files
            .into_iter()
            .map(|(file, (hunks, added, removed))| {
                format!("{} ({} hunk(s), +{} -{})", file, hunks, added, removed)
            })
            .collect()
    }
}

/// Asks whether to commit the goal currently isolated in the working tree
#[allow(async_fn_in_trait)]
pub trait DecisionPort {
    async fn decide(&mut self, checkpoint: &Checkpoint<'_>) -> Decision;
}

/// Replays a fixed list of decisions; aborts once the list runs out
#[derive(Debug, Default)]
pub struct ScriptedDecisions {
    script: VecDeque<Decision>,
    asked: Vec<u32>,
}

impl ScriptedDecisions {
    pub fn new(script: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            script: script.into_iter().collect(),
            asked: Vec::new(),
        }
    }

    /// Goals the executor asked about, in order
    pub fn asked(&self) -> &[u32] {
        &self.asked
    }
}

impl DecisionPort for ScriptedDecisions {
    async fn decide(&mut self, checkpoint: &Checkpoint<'_>) -> Decision {
        self.asked.push(checkpoint.goal);
        self.script.pop_front().unwrap_or(Decision::Abort)
    }
}

/// Prompts on the terminal
#[derive(Debug, Default)]
pub struct TerminalDecisions;

impl DecisionPort for TerminalDecisions {
    async fn decide(&mut self, checkpoint: &Checkpoint<'_>) -> Decision {
        println!();
        println!(
            "[{}/{}] Goal {}: {}",
            checkpoint.position, checkpoint.total, checkpoint.goal, checkpoint.description
        );
        for line in checkpoint.file_summary() {
            println!("    {}", line);
        }
        println!("Only this goal's changes are in your working tree now. Review or test them.");

        loop {
            print!("Commit goal {}? [c]onfirm / [s]kip / [a]bort all: ", checkpoint.goal);
            let _ = io::stdout().flush();

            let line = tokio::task::spawn_blocking(|| {
                let mut buf = String::new();
                io::stdin().lock().read_line(&mut buf).map(|n| (n, buf))
            })
            .await;

            match line {
                Ok(Ok((0, _))) | Ok(Err(_)) | Err(_) => return Decision::Abort,
                Ok(Ok((_, input))) => match Decision::parse(&input) {
                    Some(decision) => return decision,
                    None => println!("Please answer c, s or a."),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision() {
        assert_eq!(Decision::parse(" C\n"), Some(Decision::Confirm));
        assert_eq!(Decision::parse("skip"), Some(Decision::Skip));
        assert_eq!(Decision::parse("a"), Some(Decision::Abort));
        assert_eq!(Decision::parse("maybe"), None);
    }

    #[test]
    fn test_file_summary_groups_hunks() {
        let hunks = vec![
            Hunk {
                file: "b.rs".to_string(),
                content: "@@ -1 +1 @@\n-x\n+y\n".to_string(),
            },
            Hunk {
                file: "a.rs".to_string(),
                content: "@@ -1 +1,2 @@\n x\n+y\n".to_string(),
            },
            Hunk {
                file: "b.rs".to_string(),
                content: "@@ -9 +9 @@\n-x\n+y\n".to_string(),
            },
        ];
        let checkpoint = Checkpoint {
            goal: 1,
            description: "feat",
            hunks: &hunks,
            position: 1,
            total: 1,
        };
        assert_eq!(
            checkpoint.file_summary(),
            vec![
                "a.rs (1 hunk(s), +1 -0)".to_string(),
                "b.rs (2 hunk(s), +2 -2)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_decisions_abort_when_exhausted() {
        let mut port = ScriptedDecisions::new([Decision::Skip]);
        let checkpoint = Checkpoint {
            goal: 4,
            description: "x",
            hunks: &[],
            position: 1,
            total: 2,
        };
        assert_eq!(port.decide(&checkpoint).await, Decision::Skip);
        assert_eq!(port.decide(&checkpoint).await, Decision::Abort);
        assert_eq!(port.asked(), &[4, 4]);
    }
}
