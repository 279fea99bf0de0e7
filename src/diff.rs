//! Unified diff decomposition
//!
//! Splits a multi-file `git diff` into self-contained hunks (file header plus
//! exactly one `@@` block) that `git apply --cached` accepts one at a time, and
//! parses single hunks back into structured form for previews and in-memory
//! application.

use crate::util::prefix_chars;
use regex::Regex;
use std::sync::OnceLock;

/// Characters of hunk content sent along with a classification request.
pub const CLASSIFY_EXCERPT_CHARS: usize = 2000;
/// Characters of each hunk shown in the goal identification summary.
pub const SUMMARY_PREVIEW_CHARS: usize = 300;
/// Upper bound for the whole goal identification summary.
pub const SUMMARY_MAX_CHARS: usize = 8000;

const SECTION_MARKER: &str = "diff --git ";

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").expect("hunk header regex is valid")
    })
}

/// One independently appliable piece of a diff, scoped to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub file: String,
    pub content: String,
}

impl Hunk {
    /// The `@@ ... @@` line of this hunk.
    pub fn header_line(&self) -> Option<&str> {
        self.content
            .lines()
            .find(|line| hunk_header_re().is_match(line))
    }

    /// Content capped for a single classification request.
    pub fn classification_excerpt(&self) -> &str {
        prefix_chars(&self.content, CLASSIFY_EXCERPT_CHARS)
    }

    /// (additions, removals) inside the hunk body.
    pub fn line_stats(&self) -> (usize, usize) {
        let mut in_body = false;
        let mut adds = 0;
        let mut removes = 0;
        for line in self.content.lines() {
            if !in_body {
                in_body = hunk_header_re().is_match(line);
                continue;
            }
            if line.starts_with('+') {
                adds += 1;
            } else if line.starts_with('-') {
                removes += 1;
            }
        }
        (adds, removes)
    }
}

/// Why a file section produced no hunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Rename, mode change or empty file creation without a content hunk
    NoHunks,
    /// Binary content, detected but never split
    Binary,
    /// No target path could be read from the section header
    MissingPath,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NoHunks => "no content hunks",
            SkipReason::Binary => "binary file",
            SkipReason::MissingPath => "missing target path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSection {
    pub file: Option<String>,
    pub reason: SkipReason,
}

/// Result of splitting a diff: the hunks plus every section that was left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSplit {
    pub hunks: Vec<Hunk>,
    pub skipped: Vec<SkippedSection>,
}

/// Split diff text into hunks, dropping sections that cannot be split.
pub fn parse_hunks(text: &str) -> Vec<Hunk> {
    split_diff(text).hunks
}

/// Split diff text into hunks in file order, then hunk order.
pub fn split_diff(text: &str) -> DiffSplit {
    let mut split = DiffSplit::default();

    for section in file_sections(text) {
        let Some(file) = target_path(&section) else {
            tracing::warn!("skipping diff section without a target path");
            split.skipped.push(SkippedSection {
                file: None,
                reason: SkipReason::MissingPath,
            });
            continue;
        };

        let first_hunk = section
            .iter()
            .position(|line| hunk_header_re().is_match(line));
        let Some(first_hunk) = first_hunk else {
            let binary = section
                .iter()
                .any(|l| l.starts_with("Binary files ") || l.starts_with("GIT binary patch"));
            let reason = if binary {
                SkipReason::Binary
            } else {
                SkipReason::NoHunks
            };
            tracing::debug!(file = %file, reason = reason.label(), "dropping file section");
            split.skipped.push(SkippedSection {
                file: Some(file),
                reason,
            });
            continue;
        };

        let header: String = section[..first_hunk].concat();
        let mut body_start = first_hunk;
        for idx in (first_hunk + 1..=section.len()).filter(|&i| {
            i == section.len() || hunk_header_re().is_match(section[i])
        }) {
            let mut content = header.clone();
            content.push_str(&section[body_start..idx].concat());
            if !content.ends_with('\n') {
                content.push('\n');
            }
            split.hunks.push(Hunk {
                file: file.clone(),
                content,
            });
            body_start = idx;
        }
    }

    split
}

/// Group lines (terminators kept) by `diff --git` sections. Text before the
/// first marker is ignored.
fn file_sections(text: &str) -> Vec<Vec<&str>> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in text.split_inclusive('\n') {
        if line.starts_with(SECTION_MARKER) {
            sections.push(vec![line]);
        } else if let Some(current) = sections.last_mut() {
            current.push(line);
        }
    }
    sections
}

/// Target path of a section: the `b/` side of the `diff --git` line, falling
/// back to the `+++ b/` line.
fn target_path(section: &[&str]) -> Option<String> {
    let marker = section.first()?.trim_end_matches(['\n', '\r']);
    let rest = marker.strip_prefix(SECTION_MARKER)?;

    if let Some(path) = path_from_git_line(rest) {
        return Some(path);
    }

    section
        .iter()
        .map(|l| l.trim_end_matches(['\n', '\r']))
        .find_map(|l| {
            let rest = l.strip_prefix("+++ ")?;
            if rest.starts_with('"') {
                let (path, _) = unquote_c_path(rest)?;
                path.strip_prefix("b/").map(str::to_string)
            } else {
                rest.strip_prefix("b/")
                    .map(|p| strip_timestamp(p).to_string())
            }
        })
        .filter(|p| !p.is_empty())
}

fn path_from_git_line(rest: &str) -> Option<String> {
    let rest = rest.trim();
    // `a/X b/X` is by far the common shape, and splitting in the middle is
    // the only reliable parse when X itself contains " b/".
    if rest.len() % 2 == 1 {
        let mid = rest.len() / 2;
        if rest.is_char_boundary(mid) && rest.is_char_boundary(mid + 1) {
            let (left, right) = (&rest[..mid], &rest[mid + 1..]);
            if let (Some(a), Some(b)) = (left.strip_prefix("a/"), right.strip_prefix("b/")) {
                if a == b && !b.is_empty() {
                    return Some(b.to_string());
                }
            }
        }
    }

    // Paths git had to quote: `"a/caf\303\251" "b/caf\303\251"`
    if rest.ends_with('"') {
        if let Some(idx) = rest.rfind(" \"b/") {
            let (path, tail) = unquote_c_path(&rest[idx + 1..])?;
            let path = path.strip_prefix("b/")?;
            return (tail.is_empty() && !path.is_empty()).then(|| path.to_string());
        }
    }

    let idx = rest.rfind(" b/")?;
    let path = &rest[idx + 3..];
    (!path.is_empty()).then(|| path.to_string())
}

/// Decode a C-style quoted path as git writes it, returning the path and
/// whatever follows the closing quote.
fn unquote_c_path(quoted: &str) -> Option<(String, &str)> {
    let body = quoted.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let path = String::from_utf8_lossy(&out).into_owned();
                return Some((path, &body[i + 1..]));
            }
            b'\\' => {
                let next = *bytes.get(i + 1)?;
                match next {
                    b'0'..=b'7' => {
                        let digits = bytes.get(i + 1..i + 4)?;
                        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                            return None;
                        }
                        let value = digits
                            .iter()
                            .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                        out.push(u8::try_from(value).ok()?);
                        i += 4;
                        continue;
                    }
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'v' => out.push(0x0b),
                    other => out.push(other),
                }
                i += 2;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    None
}

fn strip_timestamp(path: &str) -> &str {
    match path.find('\t') {
        Some(tab) => &path[..tab],
        None => path,
    }
}

/// Bounded overview of all hunks used for goal identification.
pub fn diff_summary(hunks: &[Hunk], max_chars: usize) -> String {
    let mut summary = String::new();
    for hunk in hunks {
        let entry = format!(
            "File: {}\n{}...\n",
            hunk.file,
            prefix_chars(&hunk.content, SUMMARY_PREVIEW_CHARS)
        );
        if summary.chars().count() + entry.chars().count() > max_chars {
            break;
        }
        summary.push_str(&entry);
    }
    summary
}

// ============================================================================
// Structured parsing and in-memory application
// ============================================================================

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
            DiffLine::Add(_) => None,
        })
    }

    fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Add(s) => Some(s.as_str()),
            DiffLine::Remove(_) => None,
        })
    }
}

/// A parsed unified diff for one file
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

/// Parse a single-file unified diff into structured data
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.lines().collect();

    let mut old_path = String::new();
    let mut new_path = String::new();
    let mut start_idx = 0;

    for (i, line) in lines.iter().enumerate() {
        if let Some(path) = line.strip_prefix("--- ") {
            old_path = strip_timestamp(path.trim_start_matches("a/")).to_string();
        } else if let Some(path) = line.strip_prefix("+++ ") {
            new_path = strip_timestamp(path.trim_start_matches("b/")).to_string();
            start_idx = i + 1;
            break;
        }
    }

    if old_path.is_empty() || new_path.is_empty() {
        return Err("Could not find file paths in diff".to_string());
    }

    let mut hunks = Vec::new();
    let mut i = start_idx;
    while i < lines.len() {
        if lines[i].starts_with("@@ ") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("No hunks found in diff".to_string());
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();
    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@ ") || line.starts_with("diff ") {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
        }
        // "\ No newline at end of file" and friends

        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some((start, count)) = s.split_once(',') {
        let start: usize = start.parse().map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = count.parse().map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s.parse().map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

/// Apply hunks of one file, in original order, to the pre-image text.
///
/// Line numbers in each header refer to the pre-image, so the running
/// line delta of earlier hunks is tracked. Context and removed lines must
/// match exactly.
pub fn apply_hunks(original: &str, hunks: &[DiffHunk]) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();
    let mut offset: isize = 0;

    for hunk in hunks {
        let anchor = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let start = anchor as isize + offset;
        if start < 0 || start as usize > lines.len() {
            return Err(format!("Hunk at line {} is out of range", hunk.old_start));
        }
        let start = start as usize;

        let expected: Vec<&str> = hunk.old_lines().collect();
        let end = start + expected.len();
        if end > lines.len() {
            return Err(format!(
                "Hunk at line {} runs past the end of the file",
                hunk.old_start
            ));
        }
        for (n, want) in expected.iter().enumerate() {
            if lines[start + n] != *want {
                return Err(format!(
                    "Context mismatch at line {}: expected {:?}, found {:?}",
                    start + n + 1,
                    want,
                    lines[start + n]
                ));
            }
        }

        let replacement: Vec<String> = hunk.new_lines().map(|s| s.to_string()).collect();
        offset += replacement.len() as isize - expected.len() as isize;
        lines.splice(start..end, replacement);
    }

    let mut out = lines.join("\n");
    if !lines.is_empty() && (original.ends_with('\n') || original.is_empty()) {
        out.push('\n');
    }
    Ok(out)
}
