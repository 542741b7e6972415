//! Workspace retriever: .gitignore-respecting keyword search using the
//! `ignore` crate.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use super::{Citation, ContextRetriever, ContextSnippet, RetrievalCategory};
use crate::error::RetrievalError;

/// Files larger than this are never read.
const MAX_FILE_BYTES: u64 = 512 * 1024;

const IMPLEMENTATION_EXTS: &[&str] = &[
    "rs", "py", "pyi", "ts", "tsx", "js", "jsx", "mjs", "go", "java", "kt", "rb", "c", "h", "cc",
    "cpp", "hpp", "cs", "swift", "scala", "sh",
];
const CONFIG_EXTS: &[&str] = &["toml", "yaml", "yml", "json", "ini", "cfg", "conf", "env"];
const CONFIG_NAMES: &[&str] = &["Makefile", "Dockerfile", "justfile", ".editorconfig"];
const DOC_EXTS: &[&str] = &["md", "rst", "txt", "adoc"];

/// Walks a repository for snippets matching a free-text query.
#[derive(Debug, Clone)]
pub struct WorkspaceRetriever {
    root: PathBuf,
}

impl WorkspaceRetriever {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Category of a path relative to the root, if it is searchable at all.
    pub fn classify(relative: &str) -> Option<RetrievalCategory> {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
        let in_dir = |dir: &str| {
            relative.starts_with(&format!("{}/", dir)) || relative.contains(&format!("/{}/", dir))
        };

        if name.ends_with(".lock") {
            return None;
        }
        if DOC_EXTS.contains(&ext) || in_dir("docs") {
            return Some(RetrievalCategory::Docs);
        }
        if IMPLEMENTATION_EXTS.contains(&ext) {
            let is_test = in_dir("tests")
                || in_dir("test")
                || in_dir("__tests__")
                || stem.starts_with("test_")
                || stem.ends_with("_test")
                || stem.ends_with(".test")
                || stem.ends_with(".spec");
            return Some(if is_test {
                RetrievalCategory::Tests
            } else {
                RetrievalCategory::Implementation
            });
        }
        if CONFIG_EXTS.contains(&ext) || CONFIG_NAMES.contains(&name) {
            return Some(RetrievalCategory::Config);
        }
        None
    }

    fn files_in(&self, category: RetrievalCategory) -> Vec<(String, PathBuf)> {
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .build();

        let mut files = Vec::new();
        for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if Self::classify(&relative) == Some(category) {
                files.push((relative, path.to_path_buf()));
            }
        }
        files.sort();
        files
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

struct Scored {
    score: usize,
    relative: String,
    lines: Vec<String>,
    first_hit: usize,
}

fn score_file(relative: &str, content: &str, terms: &[String], query: &str) -> Option<Scored> {
    let lines: Vec<String> = content.lines().map(String::from).collect();
    let mut score = 0;
    let mut first_hit = None;
    for (idx, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
        if hits > 0 {
            score += hits;
            first_hit.get_or_insert(idx);
        }
    }
    // A file named in the query outranks keyword hits.
    if query.contains(relative) {
        score += 100;
        first_hit.get_or_insert(0);
    }
    first_hit.map(|first_hit| Scored {
        score,
        relative: relative.to_string(),
        lines,
        first_hit,
    })
}

impl ContextRetriever for WorkspaceRetriever {
    fn retrieve(
        &self,
        query: &str,
        category: RetrievalCategory,
        limit: usize,
        max_lines: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if !self.root.is_dir() {
            return Err(RetrievalError::Workspace {
                path: self.root.display().to_string(),
                message: "not a directory".to_string(),
            });
        }
        if limit == 0 || max_lines == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Scored> = self
            .files_in(category)
            .into_iter()
            .filter_map(|(relative, path)| {
                let content = std::fs::read_to_string(&path).ok()?;
                score_file(&relative, &content, &terms, query)
            })
            .collect();
        scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.relative.cmp(&b.relative)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|file| {
                let lead = max_lines / 4;
                let start = file.first_hit.saturating_sub(lead);
                let end = (start + max_lines).min(file.lines.len());
                ContextSnippet {
                    category,
                    citation: Citation {
                        path: file.relative,
                        start_line: start + 1,
                        end_line: end.max(start + 1),
                    },
                    content: file.lines[start..end].join("\n"),
                }
            })
            .collect())
    }
}
