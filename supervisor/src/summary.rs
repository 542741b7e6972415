//! Summary artifacts for external inspection.
//!
//! One JSON document per run, tier and phase, rewritten after every
//! committed state change:
//!
//! ```text
//! <root>/<run_id>/run_summary.json
//! <root>/<run_id>/tiers/<tier_id>.json
//! <root>/<run_id>/phases/<phase_id>.json
//! ```

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::SummaryError;
use crate::model::{Phase, Run, Tier};

/// Receives a snapshot of each record after a committed change.
pub trait SummaryWriter: Send + Sync {
    fn write_run(&self, run: &Run) -> Result<(), SummaryError>;
    fn write_tier(&self, run_id: &str, tier: &Tier) -> Result<(), SummaryError>;
    fn write_phase(&self, run_id: &str, phase: &Phase) -> Result<(), SummaryError>;

    /// Write the run and everything it owns. Stops at the first failure.
    fn write_all(&self, run: &Run) -> Result<(), SummaryError> {
        self.write_run(run)?;
        for tier in &run.tiers {
            self.write_tier(&run.run_id, tier)?;
        }
        for phase in &run.phases {
            self.write_phase(&run.run_id, phase)?;
        }
        Ok(())
    }
}

/// Headline record written as `run_summary.json`. Nested tiers and phases
/// get their own files.
#[derive(Debug, Serialize)]
struct RunDocument<'a> {
    run_id: &'a str,
    state: String,
    safety_profile: crate::model::SafetyProfile,
    scope: crate::model::RunScope,
    token_cap: u64,
    tokens_used: u64,
    ci_runs_used: u32,
    max_phases: u32,
    max_duration_minutes: u64,
    max_minor_issues_total: u32,
    minor_issues_count: u32,
    major_issues_count: u32,
    promotion_eligible: bool,
    failure_reason: Option<&'a str>,
    integration_line: &'a str,
    tier_ids: Vec<&'a str>,
    phase_ids: Vec<&'a str>,
    created_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl<'a> From<&'a Run> for RunDocument<'a> {
    fn from(run: &'a Run) -> Self {
        Self {
            run_id: &run.run_id,
            state: run.state.to_string(),
            safety_profile: run.safety_profile,
            scope: run.scope,
            token_cap: run.token_cap,
            tokens_used: run.tokens_used,
            ci_runs_used: run.ci_runs_used,
            max_phases: run.max_phases,
            max_duration_minutes: run.max_duration_minutes,
            max_minor_issues_total: run.max_minor_issues_total,
            minor_issues_count: run.minor_issues_count,
            major_issues_count: run.major_issues_count,
            promotion_eligible: run.promotion_eligible,
            failure_reason: run.failure_reason.as_deref(),
            integration_line: &run.integration_line,
            tier_ids: run.tiers.iter().map(|t| t.tier_id.as_str()).collect(),
            phase_ids: run.phases.iter().map(|p| p.phase_id.as_str()).collect(),
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}

/// Writes pretty JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct JsonSummaryWriter {
    root: PathBuf,
}

impl JsonSummaryWriter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Temp file + rename so readers never see a half-written document.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), SummaryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl SummaryWriter for JsonSummaryWriter {
    fn write_run(&self, run: &Run) -> Result<(), SummaryError> {
        let path = self.run_dir(&run.run_id).join("run_summary.json");
        self.write_json(&path, &RunDocument::from(run))
    }

    fn write_tier(&self, run_id: &str, tier: &Tier) -> Result<(), SummaryError> {
        let path = self
            .run_dir(run_id)
            .join("tiers")
            .join(format!("{}.json", tier.tier_id));
        self.write_json(&path, tier)
    }

    fn write_phase(&self, run_id: &str, phase: &Phase) -> Result<(), SummaryError> {
        let path = self
            .run_dir(run_id)
            .join("phases")
            .join(format!("{}.json", phase.phase_id));
        self.write_json(&path, phase)
    }
}
