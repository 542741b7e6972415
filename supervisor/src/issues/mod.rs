//! Three-level issue tracking.
//!
//! Issues are stored once, as [`IssueEvent`]s in a per-run append-only
//! [`IssueLog`]. The phase-local and run-level views are projections of that
//! log, and phase/tier/run counters are recomputed from it, so the tier and
//! run totals can never drift from the sum of their phases. The cross-run
//! [`ProjectBacklog`] is the only state shared between runs.

pub mod backlog;
pub mod log;
pub mod tracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SupervisorError;

pub use backlog::{BacklogEntry, BacklogStatus, BacklogSummary, ProjectBacklog};
pub use log::IssueLog;
pub use tracker::{IssueTracker, RecordedIssue};

/// Issue severity. Ordered so `max()` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

impl FromStr for Severity {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            other => Err(SupervisorError::validation(format!(
                "unknown issue severity '{}'",
                other
            ))),
        }
    }
}

/// Who reported the issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Builder,
    Auditor,
    Ci,
    Operator,
}

/// A request to record one issue against a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub issue_key: String,
    pub severity: Severity,
    pub source: IssueSource,
    pub category: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

impl IssueReport {
    pub fn new(
        issue_key: impl Into<String>,
        severity: Severity,
        source: IssueSource,
        category: impl Into<String>,
    ) -> Self {
        Self {
            issue_key: issue_key.into(),
            severity,
            source,
            category: category.into(),
            evidence_refs: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence_refs.push(evidence.into());
        self
    }
}

/// Fully resolved owner of an issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueScope {
    pub run_id: String,
    pub tier_id: String,
    pub phase_id: String,
}

/// One entry of the append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEvent {
    /// Position in the run's log
    pub seq: u64,
    pub scope: IssueScope,
    pub report: IssueReport,
    pub at: DateTime<Utc>,
}

/// Phase-local view of an issue key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseIssueEntry {
    pub phase_id: String,
    pub issue_key: String,
    /// Worst severity ever reported for this key in this phase
    pub severity: Severity,
    pub category: String,
    pub sources: Vec<IssueSource>,
    pub evidence_refs: Vec<String>,
    pub occurrences: u32,
    pub first_recorded_at: DateTime<Utc>,
    pub last_recorded_at: DateTime<Utc>,
}

/// Run-level dedup index entry: exactly one per key per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub issue_key: String,
    pub severity: Severity,
    pub category: String,
    pub phase_ids: Vec<String>,
    pub tier_ids: Vec<String>,
    pub evidence_refs: Vec<String>,
    pub occurrences: u32,
    pub first_recorded_at: DateTime<Utc>,
    pub last_recorded_at: DateTime<Utc>,
}

/// What the project backlog must learn about after a run commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSighting {
    pub run_id: String,
    pub tier_id: String,
    pub issue_key: String,
    pub severity: Severity,
    pub category: String,
    pub evidence_refs: Vec<String>,
}

pub(crate) fn push_unique<T: PartialEq + Clone>(into: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}
