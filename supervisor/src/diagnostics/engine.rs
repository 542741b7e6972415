//! Diagnostics escalation engine.
//!
//! Deterministic: decides from attempt counts and the shape of the error
//! text, and enforces retrieval caps on whatever the retriever returns.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::{ContextRetriever, ContextSnippet, RetrievalCategory};
use crate::config::DiagnosticsPolicy;
use crate::error::RetrievalError;

static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s(\[<'"`=,])((?:[\w.-]+/)*[\w-]+\.(?:rs|py|pyi|ts|tsx|js|jsx|mjs|go|java|kt|rb|c|h|cc|cpp|hpp|cs|swift|scala|toml|ya?ml|json|ini|cfg|md|rst))\b"#,
    )
    .expect("valid regex")
});

/// Directories that hold modules rather than being modules themselves.
const SOURCE_ROOTS: &[&str] = &["src", "lib", "app", "pkg", "crates", "packages", "tests"];

/// What fired a Stage 2 escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// Attempt count reached the Stage 2 threshold
    ConsecutiveFailures,
    /// Errors span several files or modules
    ComplexPattern,
}

impl std::fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsecutiveFailures => write!(f, "consecutive_failures"),
            Self::ComplexPattern => write!(f, "complex_pattern"),
        }
    }
}

/// Files and top-level modules named by a set of error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub files: BTreeSet<String>,
    pub modules: BTreeSet<String>,
}

impl ErrorPattern {
    pub fn from_errors(errors: &[String]) -> Self {
        let mut pattern = Self::default();
        for error in errors {
            for caps in FILE_REF_RE.captures_iter(error) {
                let path = caps[1].trim_start_matches("./").to_string();
                pattern.modules.insert(module_of(&path));
                pattern.files.insert(path);
            }
        }
        pattern
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

fn module_of(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let mut idx = 0;
    while idx + 1 < segments.len() && SOURCE_ROOTS.contains(&segments[idx]) {
        idx += 1;
    }
    let segment = segments[idx];
    if idx + 1 == segments.len() {
        segment
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(segment)
            .to_string()
    } else {
        segment.to_string()
    }
}

/// Outcome of `decide`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<EscalationTrigger>,
    pub reason: String,
    pub pattern: ErrorPattern,
}

/// Decides when to escalate context retrieval and enforces retrieval caps.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsEscalationEngine {
    policy: DiagnosticsPolicy,
}

impl DiagnosticsEscalationEngine {
    pub fn new(policy: DiagnosticsPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DiagnosticsPolicy {
        &self.policy
    }

    /// Whether the next attempt should get Stage 2 context.
    pub fn should_escalate(
        &self,
        attempt_number: u32,
        previous_errors: &[String],
        stage1_retrieval_count: u32,
    ) -> bool {
        self.decide(attempt_number, previous_errors, stage1_retrieval_count)
            .escalate
    }

    /// Full decision with trigger and the parsed error pattern.
    ///
    /// `attempt_number` is the number of consecutive failed attempts so far.
    /// Shallow fetches already spent count toward the same threshold, since
    /// each one preceded a failure.
    pub fn decide(
        &self,
        attempt_number: u32,
        previous_errors: &[String],
        stage1_retrieval_count: u32,
    ) -> EscalationDecision {
        let pattern = ErrorPattern::from_errors(previous_errors);

        // First attempt with at most one file involved: never worth Stage 2.
        if attempt_number <= 1 && pattern.file_count() <= 1 {
            return EscalationDecision {
                escalate: false,
                trigger: None,
                reason: "first attempt with a single-file error".to_string(),
                pattern,
            };
        }

        let failures = attempt_number.max(stage1_retrieval_count);
        if failures >= self.policy.stage2_failure_threshold {
            return EscalationDecision {
                escalate: true,
                trigger: Some(EscalationTrigger::ConsecutiveFailures),
                reason: format!(
                    "{} consecutive failures (threshold {})",
                    failures, self.policy.stage2_failure_threshold
                ),
                pattern,
            };
        }

        if pattern.file_count() >= self.policy.complex_file_threshold
            || pattern.module_count() >= self.policy.complex_module_threshold
        {
            return EscalationDecision {
                escalate: true,
                trigger: Some(EscalationTrigger::ComplexPattern),
                reason: format!(
                    "errors span {} files across {} modules",
                    pattern.file_count(),
                    pattern.module_count()
                ),
                pattern,
            };
        }

        EscalationDecision {
            escalate: false,
            trigger: None,
            reason: format!(
                "{} failures, {} file(s); below escalation thresholds",
                failures,
                pattern.file_count()
            ),
            pattern,
        }
    }

    /// Stage 1: a small implementation-only fetch for the next attempt.
    pub fn retrieve_shallow_context(
        &self,
        retriever: &dyn ContextRetriever,
        query: &str,
    ) -> Result<Vec<ContextSnippet>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        let snippets = retriever.retrieve(
            query,
            RetrievalCategory::Implementation,
            self.policy.stage1_max_snippets,
            self.policy.stage1_max_lines,
        )?;
        Ok(snippets
            .into_iter()
            .take(self.policy.stage1_max_snippets)
            .map(|s| s.truncated(self.policy.stage1_max_lines))
            .collect())
    }

    /// Stage 2: cited snippets across the requested categories.
    ///
    /// `max_per_category` and `max_lines` are clamped to the policy caps, so
    /// the result never exceeds four categories × cap snippets.
    pub fn retrieve_deep_context(
        &self,
        retriever: &dyn ContextRetriever,
        query: &str,
        categories: &[RetrievalCategory],
        max_per_category: usize,
        max_lines: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        let per_category = max_per_category.min(self.policy.max_snippets_per_category);
        let lines = max_lines.min(self.policy.max_lines_per_snippet);

        let wanted: BTreeSet<RetrievalCategory> = categories.iter().copied().collect();
        let mut snippets = Vec::new();
        for category in wanted {
            let found = retriever.retrieve(query, category, per_category, lines)?;
            snippets.extend(
                found
                    .into_iter()
                    .filter(|s| s.category == category)
                    .take(per_category)
                    .map(|s| s.truncated(lines)),
            );
        }

        info!(
            snippets = snippets.len(),
            per_category, max_lines = lines, "Stage 2 context retrieved"
        );
        Ok(snippets)
    }

    /// Stage 2 over every category with the default caps.
    pub fn retrieve_all_categories(
        &self,
        retriever: &dyn ContextRetriever,
        query: &str,
    ) -> Result<Vec<ContextSnippet>, RetrievalError> {
        debug!(query_len = query.len(), "Deep retrieval over all categories");
        self.retrieve_deep_context(
            retriever,
            query,
            &RetrievalCategory::ALL,
            self.policy.max_snippets_per_category,
            self.policy.max_lines_per_snippet,
        )
    }
}
