//! Unified diff inspection: which files a patch touches.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,(\d+))? \+\d+(?:,(\d+))? @@").expect("valid regex")
});

/// Extended-header lines naming a path verbatim, without a strip prefix.
const VERBATIM_HEADERS: &[&str] = &["rename from ", "rename to ", "copy from ", "copy to "];

/// Extended-header lines that make a hunk-less patch meaningful.
const METADATA_HEADERS: &[&str] = &[
    "old mode ",
    "new mode ",
    "new file mode ",
    "deleted file mode ",
];

/// Shape of a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Every path the patch reads or writes, in first-seen order
    pub files: Vec<String>,
    pub hunks: usize,
    pub additions: usize,
    pub deletions: usize,
}

/// Reasons a patch cannot be inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffProblem {
    /// No file headers at all
    NoTargets,
    /// Headers present but no `@@` hunk and no rename/mode change
    NoHunks,
    /// Path escapes the working tree
    UnsafePath(String),
    /// A file header whose target path cannot be determined
    Unresolvable(String),
}

impl std::fmt::Display for DiffProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTargets => write!(f, "patch names no target files"),
            Self::NoHunks => write!(f, "patch contains no hunks"),
            Self::UnsafePath(p) => write!(f, "patch path escapes the working tree: {}", p),
            Self::Unresolvable(h) => write!(f, "cannot resolve patch target from: {}", h),
        }
    }
}

/// Parse file targets and line counts out of a unified diff.
///
/// Target paths are resolved the way `git apply` does at its default strip
/// level of one: the first component of every `diff --git`, `---` and `+++`
/// name is dropped whatever it is, and C-quoted names are unquoted. Rename
/// and copy headers carry paths verbatim. Any header that cannot be resolved
/// rejects the whole patch.
pub fn inspect(patch: &str) -> Result<DiffSummary, DiffProblem> {
    let mut summary = DiffSummary::default();
    let mut metadata_only = false;
    let mut old_left = 0usize;
    let mut new_left = 0usize;

    for line in patch.lines() {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b'+') => {
                    summary.additions += 1;
                    new_left = new_left.saturating_sub(1);
                    continue;
                }
                Some(b'-') => {
                    summary.deletions += 1;
                    old_left = old_left.saturating_sub(1);
                    continue;
                }
                Some(b' ') | None => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                    continue;
                }
                Some(b'\\') => continue,
                // Short hunk; fall through and read this line as a header.
                Some(_) => {
                    old_left = 0;
                    new_left = 0;
                }
            }
        }

        if let Some(caps) = HUNK_RE.captures(line) {
            summary.hunks += 1;
            old_left = hunk_len(caps.get(1));
            new_left = hunk_len(caps.get(2));
        } else if let Some(rest) = line.strip_prefix("diff --git ") {
            for path in git_header_paths(rest)? {
                add_target(&mut summary.files, &path)?;
            }
        } else if let Some(rest) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        {
            for path in file_header_paths(rest)? {
                add_target(&mut summary.files, &path)?;
            }
        } else if let Some(rest) = VERBATIM_HEADERS
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
        {
            metadata_only = true;
            add_target(&mut summary.files, &verbatim_path(rest)?)?;
        } else if METADATA_HEADERS.iter().any(|prefix| line.starts_with(prefix)) {
            metadata_only = true;
        }
    }

    if summary.files.is_empty() {
        return Err(DiffProblem::NoTargets);
    }
    if summary.hunks == 0 && !metadata_only {
        return Err(DiffProblem::NoHunks);
    }
    Ok(summary)
}

fn hunk_len(count: Option<regex::Match<'_>>) -> usize {
    count.and_then(|m| m.as_str().parse().ok()).unwrap_or(1)
}

/// Paths named by `diff --git <old> <new>`.
fn git_header_paths(rest: &str) -> Result<Vec<String>, DiffProblem> {
    let unresolved = || DiffProblem::Unresolvable(format!("diff --git {}", rest));

    if rest.starts_with('"') {
        let (old, tail) = unquote(rest).ok_or_else(unresolved)?;
        let tail = tail.trim_start();
        let new = if tail.starts_with('"') {
            unquote(tail).ok_or_else(unresolved)?.0
        } else {
            tail.to_string()
        };
        return Ok(vec![strip_prefix_component(&old)?, strip_prefix_component(&new)?]);
    }
    if let Some(idx) = rest.find(" \"") {
        let (new, _) = unquote(&rest[idx + 1..]).ok_or_else(unresolved)?;
        return Ok(vec![
            strip_prefix_component(&rest[..idx])?,
            strip_prefix_component(&new)?,
        ]);
    }

    // Unquoted names may contain spaces: prefer the split whose halves
    // name the same file, as git does.
    let splits: Vec<usize> = rest.match_indices(' ').map(|(i, _)| i).collect();
    for &i in &splits {
        if let (Ok(old), Ok(new)) = (
            strip_prefix_component(&rest[..i]),
            strip_prefix_component(&rest[i + 1..]),
        ) {
            if old == new {
                return Ok(vec![old]);
            }
        }
    }
    match splits.as_slice() {
        [i] => Ok(vec![
            strip_prefix_component(&rest[..*i])?,
            strip_prefix_component(&rest[*i + 1..])?,
        ]),
        _ => Err(unresolved()),
    }
}

/// Paths named by a `---` or `+++` header. `/dev/null` names nothing.
///
/// Unquoted names end at a tab. When a space-separated timestamp may follow
/// instead, both readings are returned so the policy sees each of them.
fn file_header_paths(rest: &str) -> Result<Vec<String>, DiffProblem> {
    if rest.starts_with('"') {
        let (raw, _) =
            unquote(rest).ok_or_else(|| DiffProblem::Unresolvable(rest.to_string()))?;
        if raw == "/dev/null" {
            return Ok(Vec::new());
        }
        return Ok(vec![strip_prefix_component(&raw)?]);
    }

    let raw = rest.split('\t').next().unwrap_or(rest).trim_end();
    let head = raw.split_once(' ').map(|(head, _)| head);
    if raw == "/dev/null" || head == Some("/dev/null") {
        return Ok(Vec::new());
    }
    let mut paths = vec![strip_prefix_component(raw)?];
    if let Some(head) = head {
        paths.push(strip_prefix_component(head)?);
    }
    Ok(paths)
}

fn verbatim_path(rest: &str) -> Result<String, DiffProblem> {
    if rest.starts_with('"') {
        unquote(rest)
            .map(|(path, _)| path)
            .ok_or_else(|| DiffProblem::Unresolvable(rest.to_string()))
    } else {
        Ok(rest.trim_end().to_string())
    }
}

/// Drop exactly one leading component, like `git apply -p1`.
fn strip_prefix_component(raw: &str) -> Result<String, DiffProblem> {
    match raw.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => Ok(rest.to_string()),
        _ => Err(DiffProblem::Unresolvable(raw.to_string())),
    }
}

/// Decode a C-style quoted name, returning it and whatever follows the
/// closing quote.
fn unquote(s: &str) -> Option<(String, &str)> {
    let body = s.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => return String::from_utf8(out).ok().map(|name| (name, &body[i + 1..])),
            b'\\' => {
                let escaped = *bytes.get(i + 1)?;
                i += 2;
                let byte = match escaped {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b't' => b'\t',
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'r' => b'\r',
                    b'\\' => b'\\',
                    b'"' => b'"',
                    b'0'..=b'3' => {
                        let digits = bytes.get(i - 1..i + 2)?;
                        if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                            return None;
                        }
                        i += 2;
                        (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0')
                    }
                    _ => return None,
                };
                out.push(byte);
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    None
}

fn add_target(files: &mut Vec<String>, raw: &str) -> Result<(), DiffProblem> {
    let path = normalize(raw)?;
    if !files.contains(&path) {
        files.push(path);
    }
    Ok(())
}

/// Reject absolute paths and parent traversal; drop `.` segments and
/// repeated slashes.
fn normalize(raw: &str) -> Result<String, DiffProblem> {
    if raw.starts_with('/') || raw.contains('\\') {
        return Err(DiffProblem::UnsafePath(raw.to_string()));
    }
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(DiffProblem::UnsafePath(raw.to_string())),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(DiffProblem::Unresolvable(raw.to_string()));
    }
    Ok(segments.join("/"))
}
