//! Read-only aggregation views over run records.
//!
//! Everything here is derived on demand from committed runs; nothing is
//! stored separately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::lifecycle::{path_summary, LifecycleState};
use crate::model::{Cleanliness, PhaseState, Run, RunState, TierState};

fn ratio(used: u64, cap: u64) -> f64 {
    if cap == 0 {
        0.0
    } else {
        used as f64 / cap as f64
    }
}

/// Integration line view for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStatus {
    pub run_id: String,
    pub run_state: RunState,
    pub integration_line: String,
    /// Commits on the line, oldest first
    pub commits: Vec<String>,
    /// Commits attributed to each phase
    pub phase_commits: BTreeMap<String, Vec<String>>,
    pub rejected_patches: u32,
}

impl IntegrationStatus {
    pub fn new(run: &Run, commits: Vec<String>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            run_state: run.state,
            integration_line: run.integration_line.clone(),
            commits,
            phase_commits: run
                .phases
                .iter()
                .filter(|p| !p.commits.is_empty())
                .map(|p| (p.phase_id.clone(), p.commits.clone()))
                .collect(),
            rejected_patches: run.rejected_patches,
        }
    }
}

/// Counts across every registered run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_runs: usize,
    pub by_state: BTreeMap<String, usize>,
    pub active: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded / finished; 0 when nothing finished
    pub success_rate: f64,
    pub promotion_eligible: usize,
    pub tokens_used: u64,
    pub ci_runs_used: u64,
    pub minor_issues: u64,
    pub major_issues: u64,
}

impl RunMetrics {
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a Run>) -> Self {
        let mut metrics = Self::default();
        for run in runs {
            metrics.total_runs += 1;
            *metrics.by_state.entry(run.state.to_string()).or_default() += 1;
            match run.state {
                RunState::DoneSuccess => metrics.succeeded += 1,
                s if s.is_failure() => metrics.failed += 1,
                _ => metrics.active += 1,
            }
            if run.promotion_eligible {
                metrics.promotion_eligible += 1;
            }
            metrics.tokens_used += run.tokens_used;
            metrics.ci_runs_used += run.ci_runs_used as u64;
            metrics.minor_issues += run.minor_issues_count as u64;
            metrics.major_issues += run.major_issues_count as u64;
        }
        let finished = metrics.succeeded + metrics.failed;
        metrics.success_rate = if finished > 0 {
            metrics.succeeded as f64 / finished as f64
        } else {
            0.0
        };
        metrics
    }
}

/// Per-tier view for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMetrics {
    pub tier_id: String,
    pub index: u32,
    pub state: TierState,
    pub cleanliness: Cleanliness,
    pub phases_total: usize,
    pub phases_by_state: BTreeMap<String, usize>,
    pub tokens_used: u64,
    pub token_cap: Option<u64>,
    /// Share of the tier token cap used, when a cap is set
    pub token_utilization: Option<f64>,
    pub ci_runs_used: u32,
    pub ci_run_cap: Option<u32>,
    pub minor_issues_count: u32,
    pub major_issues_count: u32,
    pub max_major_issues_tolerated: u32,
    pub failure_reason: Option<String>,
}

impl TierMetrics {
    pub fn for_run(run: &Run) -> Vec<Self> {
        run.tiers
            .iter()
            .map(|tier| {
                let mut phases_by_state = BTreeMap::new();
                let mut phases_total = 0;
                for phase in run.phases_of(tier) {
                    phases_total += 1;
                    *phases_by_state.entry(phase.state.to_string()).or_default() += 1;
                }
                Self {
                    tier_id: tier.tier_id.clone(),
                    index: tier.index,
                    state: tier.state,
                    cleanliness: tier.cleanliness,
                    phases_total,
                    phases_by_state,
                    tokens_used: tier.tokens_used,
                    token_cap: tier.token_cap,
                    token_utilization: tier.token_cap.map(|cap| ratio(tier.tokens_used, cap)),
                    ci_runs_used: tier.ci_runs_used,
                    ci_run_cap: tier.ci_run_cap,
                    minor_issues_count: tier.minor_issues_count,
                    major_issues_count: tier.major_issues_count,
                    max_major_issues_tolerated: tier.max_major_issues_tolerated,
                    failure_reason: tier.failure_reason.clone(),
                }
            })
            .collect()
    }
}

/// Budget usage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBudget {
    pub run_id: String,
    pub state: RunState,
    pub tokens_used: u64,
    pub token_cap: u64,
    pub token_utilization: f64,
    pub phases_started: u32,
    pub max_phases: u32,
    pub elapsed_minutes: u64,
    pub max_duration_minutes: u64,
    pub token_escalations: u32,
    pub stage2_escalations: u32,
    pub budget_exhausted: bool,
}

/// Budget usage across all runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetAnalysis {
    pub runs: Vec<RunBudget>,
    pub tokens_used: u64,
    pub token_escalations: u64,
    pub stage2_escalations: u64,
    pub budget_exhausted_runs: usize,
    /// Mean token utilization over all runs
    pub mean_token_utilization: f64,
}

impl BudgetAnalysis {
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a Run>, now: DateTime<Utc>) -> Self {
        let mut analysis = Self::default();
        for run in runs {
            let end = run.finished_at.unwrap_or(now);
            let stage2: u32 = run
                .phases
                .iter()
                .map(|p| p.diagnostics.stage2_escalations)
                .sum();
            let budget = RunBudget {
                run_id: run.run_id.clone(),
                state: run.state,
                tokens_used: run.tokens_used,
                token_cap: run.token_cap,
                token_utilization: ratio(run.tokens_used, run.token_cap),
                phases_started: run.phases_started(),
                max_phases: run.max_phases,
                elapsed_minutes: run.elapsed_minutes(end),
                max_duration_minutes: run.max_duration_minutes,
                token_escalations: run.token_escalations,
                stage2_escalations: stage2,
                budget_exhausted: run.state == RunState::DoneFailedBudgetExhausted,
            };
            analysis.tokens_used += budget.tokens_used;
            analysis.token_escalations += budget.token_escalations as u64;
            analysis.stage2_escalations += budget.stage2_escalations as u64;
            if budget.budget_exhausted {
                analysis.budget_exhausted_runs += 1;
            }
            analysis.runs.push(budget);
        }
        analysis.runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        if !analysis.runs.is_empty() {
            analysis.mean_token_utilization = analysis
                .runs
                .iter()
                .map(|r| r.token_utilization)
                .sum::<f64>()
                / analysis.runs.len() as f64;
        }
        analysis
    }
}

/// Headline record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    pub terminal: bool,
    pub failure_reason: Option<String>,
    pub promotion_eligible: bool,
    /// `PLAN_BOOTSTRAP → RUN_CREATED → …`
    pub path: String,
    pub tiers_total: usize,
    pub tiers_complete: usize,
    pub phases_total: usize,
    pub phases_by_state: BTreeMap<String, usize>,
    pub minor_issues_count: u32,
    pub max_minor_issues_total: u32,
    pub major_issues_count: u32,
    pub tokens_used: u64,
    pub token_cap: u64,
    pub commits: usize,
    pub rejected_patches: u32,
    pub summary_write_failures: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn new(run: &Run) -> Self {
        let mut phases_by_state = BTreeMap::new();
        for state in PhaseState::ALL {
            let count = run.phases.iter().filter(|p| p.state == state).count();
            if count > 0 {
                phases_by_state.insert(state.to_string(), count);
            }
        }
        Self {
            run_id: run.run_id.clone(),
            state: run.state,
            terminal: run.state.is_terminal(),
            failure_reason: run.failure_reason.clone(),
            promotion_eligible: run.promotion_eligible,
            path: path_summary(RunState::PlanBootstrap, &run.transitions),
            tiers_total: run.tiers.len(),
            tiers_complete: run
                .tiers
                .iter()
                .filter(|t| t.state == TierState::Complete)
                .count(),
            phases_total: run.phases.len(),
            phases_by_state,
            minor_issues_count: run.minor_issues_count,
            max_minor_issues_total: run.max_minor_issues_total,
            major_issues_count: run.major_issues_count,
            tokens_used: run.tokens_used,
            token_cap: run.token_cap,
            commits: run.phases.iter().map(|p| p.commits.len()).sum(),
            rejected_patches: run.rejected_patches,
            summary_write_failures: run.summary_write_failures,
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}
