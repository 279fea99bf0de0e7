use crate::diff::{diff_summary, Hunk, SUMMARY_MAX_CHARS};
use crate::plan::Goal;

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPTS
// ═══════════════════════════════════════════════════════════════════════════════

pub const GOALS_SYSTEM: &str = r#"You are a software architect who organizes git history.
Group the code changes you are shown into logical, ATOMIC goals. Each goal becomes one commit.

RULES:
- One goal covers one or two closely related files or one small, specific feature.
- Split large changes with independent parts into separate goals.
- Group changes only when they depend on each other, not because they look alike.
- Prefer several small goals over a few large ones.
- Each goal must be reviewable on its own.
- Descriptions are short conventional commit messages, e.g. "feat: add login endpoint",
  "fix: close file handle in exporter", "refactor: extract validation module".

Respond ONLY with JSON:
{"goals": [{"id": 1, "description": "feat: ..."}, {"id": 2, "description": "fix: ..."}]}
Ids start at 1 and are unique."#;

pub const CLASSIFY_SYSTEM: &str = r#"You assign one diff hunk to the goal it belongs to.

INSTRUCTIONS:
- Pick the goal that best describes the purpose of the hunk.
- If the hunk serves several purposes, pick the most important one.
- If nothing fits clearly, pick the closest goal.

Respond ONLY with the goal id number."#;

fn context_section(context: &str) -> String {
    let context = context.trim();
    if context.is_empty() {
        String::new()
    } else {
        format!("Context from the author about these changes:\n{}\n\n", context)
    }
}

pub fn goals_user_prompt(hunks: &[Hunk], context: &str) -> String {
    format!(
        "{}Changes:\n{}",
        context_section(context),
        diff_summary(hunks, SUMMARY_MAX_CHARS)
    )
}

pub fn classify_user_prompt(hunk: &Hunk, goals: &[Goal], context: &str) -> String {
    let goal_list: String = goals
        .iter()
        .map(|g| format!("{}: {}\n", g.id, g.description))
        .collect();
    format!(
        "{}Available goals:\n{}\nHunk from {}:\n{}",
        context_section(context),
        goal_list,
        hunk.file,
        hunk.classification_excerpt()
    )
}
