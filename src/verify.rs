//! Post-commit verification
//!
//! Runs the user's `--test-cmd` once the last goal has been committed. A
//! failing command fails the execution so the commits get rolled back.

use crate::util::run_command_with_timeout;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 600;
const MAX_OUTPUT_CHARS: usize = 1800;

/// A shell command to run from the repository root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyCommand {
    pub command: String,
    pub root: PathBuf,
    pub timeout: Duration,
}

impl VerifyCommand {
    pub fn new(root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
            timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub command: String,
    pub passed: bool,
    /// Combined stdout/stderr (truncated)
    pub output: String,
    pub duration_ms: u64,
}

/// Run `command_line` through the shell from the repository root.
pub fn run(repo_root: &Path, command_line: &str, timeout: Duration) -> VerifyResult {
    let start = Instant::now();
    let mut cmd = shell_command(command_line);
    cmd.current_dir(repo_root);

    let (passed, output) = match run_command_with_timeout(&mut cmd, timeout) {
        Ok(out) if out.timed_out => (
            false,
            format!("Timed out after {}s", timeout.as_secs()),
        ),
        Ok(out) => {
            let mut combined = String::new();
            if !out.stdout.trim().is_empty() {
                combined.push_str(&out.stdout);
            }
            if !out.stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&out.stderr);
            }
            (out.success(), truncate_output(&combined, MAX_OUTPUT_CHARS))
        }
        Err(e) => (false, e),
    };

    VerifyResult {
        command: command_line.to_string(),
        passed,
        output,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

/// Keep the tail, which is where test runners put their verdict
fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max {
        trimmed.to_string()
    } else {
        let tail: String = trimmed.chars().skip(char_count - max).collect();
        format!("… (truncated)\n{}", tail)
    }
}
