//! Two-stage diagnostics: shallow per-attempt context, escalating to deep
//! cited retrieval when a phase keeps failing or its errors span files.

pub mod engine;
pub mod retrieval;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RetrievalError;

pub use engine::{DiagnosticsEscalationEngine, ErrorPattern, EscalationDecision, EscalationTrigger};
pub use retrieval::WorkspaceRetriever;

/// The fixed deep-retrieval categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalCategory {
    Implementation,
    Tests,
    Config,
    Docs,
}

impl RetrievalCategory {
    pub const ALL: [RetrievalCategory; 4] =
        [Self::Implementation, Self::Tests, Self::Config, Self::Docs];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::Tests => "tests",
            Self::Config => "config",
            Self::Docs => "docs",
        }
    }
}

impl fmt::Display for RetrievalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalCategory {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RetrievalError::UnknownCategory(s.to_string()))
    }
}

/// Where a snippet came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub path: String,
    /// 1-based, inclusive
    pub start_line: usize,
    /// 1-based, inclusive
    pub end_line: usize,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.path, self.start_line, self.end_line)
    }
}

/// A piece of repository context handed to the Builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub category: RetrievalCategory,
    pub citation: Citation,
    pub content: String,
}

impl ContextSnippet {
    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }

    /// Keep at most `max_lines` lines, shrinking the citation to match.
    pub fn truncated(mut self, max_lines: usize) -> Self {
        if self.line_count() > max_lines {
            self.content = self
                .content
                .lines()
                .take(max_lines)
                .collect::<Vec<_>>()
                .join("\n");
            self.citation.end_line = self.citation.start_line + max_lines.saturating_sub(1);
        }
        self
    }
}

/// Source of repository context, consulted by both stages.
pub trait ContextRetriever: Send + Sync {
    /// Up to `limit` snippets of `category` relevant to `query`, each at
    /// most `max_lines` long.
    fn retrieve(
        &self,
        query: &str,
        category: RetrievalCategory,
        limit: usize,
        max_lines: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalError>;
}
