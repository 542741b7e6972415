//! Run / Tier / Phase records.
//!
//! A [`Run`] owns its [`Tier`]s and a denormalized list of [`Phase`]s. Issue
//! counters on tiers and runs are never incremented directly: the run
//! controller re-derives them from the phases after every mutation.

pub mod states;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::diagnostics::ContextSnippet;
use crate::error::SupervisorError;
use crate::lifecycle::TransitionRecord;

pub use states::{PhaseState, RunState, TierState};

/// Safety profile compiled into the run at start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    #[default]
    Normal,
    SafetyCritical,
}

/// Whether the run spans several tiers or exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    #[default]
    MultiTier,
    SingleTier,
}

/// Phase complexity, used for initial token allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
    /// Label outside low/medium/high; allocated like `low`.
    Unknown,
}

impl Complexity {
    /// Map a free-form label; anything unrecognised becomes `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Derived from a phase's issue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    #[default]
    NoIssues,
    HasMinorIssues,
    HasMajorIssues,
}

impl IssueState {
    pub fn from_counts(minor: u32, major: u32) -> Self {
        if major > 0 {
            Self::HasMajorIssues
        } else if minor > 0 {
            Self::HasMinorIssues
        } else {
            Self::NoIssues
        }
    }
}

/// Quality gate outcome for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    #[default]
    Ok,
    NeedsReview,
    Blocked,
}

/// Tier cleanliness. Flips to `NotClean` on the first recorded issue and
/// never reverts within the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleanliness {
    #[default]
    Clean,
    NotClean,
}

/// Why a phase ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseFailureKind {
    /// Builder or auditor attempts ran out
    AttemptsExhausted,
    /// Protected-path or other policy rejection with no attempts left
    PolicyViolation,
    /// Version control or CI kept failing
    Environment,
    /// Auditor recommended escalation
    AuditorEscalated,
    /// Cancelled by run or tier budget exhaustion
    BudgetExhausted,
    /// Explicit status update from an external collaborator
    Operator,
}

impl fmt::Display for PhaseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::PolicyViolation => write!(f, "policy_violation"),
            Self::Environment => write!(f, "environment"),
            Self::AuditorEscalated => write!(f, "auditor_escalated"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::Operator => write!(f, "operator"),
        }
    }
}

/// Terminal failure detail carried by a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub kind: PhaseFailureKind,
    pub reason: String,
}

/// Diagnostics bookkeeping for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseDiagnostics {
    /// Shallow (Stage 1) context fetches performed
    pub stage1_retrievals: u32,
    /// Deep (Stage 2) escalations performed
    pub stage2_escalations: u32,
    /// Why the last Stage 2 escalation fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trigger: Option<String>,
    /// Snippets from the latest Stage 1 fetch
    #[serde(default)]
    pub shallow_context: Vec<ContextSnippet>,
    /// Cited snippets from the latest Stage 2 retrieval
    #[serde(default)]
    pub deep_context: Vec<ContextSnippet>,
}

/// Smallest unit of executable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    pub tier_id: String,
    pub index: u32,
    pub name: String,
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_category: Option<String>,
    pub complexity: Complexity,
    /// May run without waiting for earlier phases of its tier
    pub independent: bool,

    pub builder_attempts: u32,
    pub auditor_attempts: u32,
    pub max_builder_attempts: u32,
    pub max_auditor_attempts: u32,
    /// Failed attempts since the last success
    pub consecutive_failures: u32,

    /// Current max-token allocation for the next Builder call
    pub token_allocation: u32,
    pub tokens_used: u64,
    pub ci_runs_used: u32,

    pub minor_issues_count: u32,
    pub major_issues_count: u32,
    pub issue_state: IssueState,
    pub quality_level: QualityLevel,
    pub quality_blocked: bool,
    /// Builder asked for review and no auditor approval has arrived yet
    pub review_pending: bool,

    /// Commits applied for this phase, in order
    #[serde(default)]
    pub commits: Vec<String>,
    /// Error lines from the most recent failed attempts
    #[serde(default)]
    pub recent_errors: Vec<String>,
    #[serde(default)]
    pub diagnostics: PhaseDiagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PhaseFailure>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord<PhaseState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Phase {
    /// Builder attempts left before the phase must fail.
    pub fn remaining_builder_attempts(&self) -> u32 {
        self.max_builder_attempts
            .saturating_sub(self.builder_attempts)
    }

    /// Auditor attempts left before the phase must fail.
    pub fn remaining_auditor_attempts(&self) -> u32 {
        self.max_auditor_attempts
            .saturating_sub(self.auditor_attempts)
    }

    pub fn has_issues(&self) -> bool {
        self.minor_issues_count + self.major_issues_count > 0
    }
}

/// Ordered grouping of phases within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub tier_id: String,
    pub index: u32,
    pub name: String,
    pub state: TierState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_run_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_minor_issues_tolerated: Option<u32>,
    pub max_major_issues_tolerated: u32,

    pub tokens_used: u64,
    pub ci_runs_used: u32,
    pub minor_issues_count: u32,
    pub major_issues_count: u32,
    pub cleanliness: Cleanliness,

    /// Owned phases in execution order
    pub phase_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord<TierState>>,
}

/// Top-level unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub state: RunState,
    pub safety_profile: SafetyProfile,
    pub scope: RunScope,

    pub token_cap: u64,
    pub max_phases: u32,
    pub max_duration_minutes: u64,
    /// phase count × minor issues allowed per phase
    pub max_minor_issues_total: u32,

    pub tokens_used: u64,
    pub ci_runs_used: u32,
    pub minor_issues_count: u32,
    pub major_issues_count: u32,
    pub promotion_eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Serialized integration line all patches for this run land on
    pub integration_line: String,
    pub rejected_patches: u32,
    pub token_escalations: u32,
    pub summary_write_failures: u32,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub tiers: Vec<Tier>,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord<RunState>>,
}

impl Run {
    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.phase_id == phase_id)
    }

    pub fn tier(&self, tier_id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.tier_id == tier_id)
    }

    pub fn tier_mut(&mut self, tier_id: &str) -> Option<&mut Tier> {
        self.tiers.iter_mut().find(|t| t.tier_id == tier_id)
    }

    /// Phases owned by a tier, in tier order.
    pub fn phases_of<'a>(&'a self, tier: &'a Tier) -> impl Iterator<Item = &'a Phase> + 'a {
        tier.phase_ids.iter().filter_map(move |id| self.phase(id))
    }

    pub fn is_terminal(&self) -> bool {
        use crate::lifecycle::LifecycleState;
        self.state.is_terminal()
    }

    /// Phases that have left `QUEUED` (counted against `max_phases`).
    pub fn phases_started(&self) -> u32 {
        self.phases
            .iter()
            .filter(|p| p.started_at.is_some())
            .count() as u32
    }

    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_minutes().max(0) as u64
    }
}

// ============================================================================
// Start-time specifications
// ============================================================================

/// Tier definition supplied to `StartRun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    pub tier_id: String,
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub token_cap: Option<u64>,
    #[serde(default)]
    pub ci_run_cap: Option<u32>,
    #[serde(default)]
    pub max_minor_issues_tolerated: Option<u32>,
    #[serde(default)]
    pub max_major_issues_tolerated: u32,
}

impl TierSpec {
    pub fn new(tier_id: impl Into<String>, index: u32, name: impl Into<String>) -> Self {
        Self {
            tier_id: tier_id.into(),
            index,
            name: name.into(),
            token_cap: None,
            ci_run_cap: None,
            max_minor_issues_tolerated: None,
            max_major_issues_tolerated: 0,
        }
    }
}

/// Phase definition supplied to `StartRun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase_id: String,
    pub tier_id: String,
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub task_category: Option<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub independent: bool,
    #[serde(default)]
    pub max_builder_attempts: Option<u32>,
    #[serde(default)]
    pub max_auditor_attempts: Option<u32>,
}

impl PhaseSpec {
    pub fn new(
        phase_id: impl Into<String>,
        tier_id: impl Into<String>,
        index: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            tier_id: tier_id.into(),
            index,
            name: name.into(),
            task_category: None,
            complexity: Complexity::default(),
            independent: false,
            max_builder_attempts: None,
            max_auditor_attempts: None,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }
}

/// Run-level configuration supplied to `StartRun`. Unset caps fall back to
/// the supervisor's `RunDefaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    #[serde(default)]
    pub safety_profile: SafetyProfile,
    #[serde(default)]
    pub scope: RunScope,
    #[serde(default)]
    pub token_cap: Option<u64>,
    #[serde(default)]
    pub max_phases: Option<u32>,
    #[serde(default)]
    pub max_duration_minutes: Option<u64>,
}

impl RunConfig {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }
}

impl FromStr for SafetyProfile {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "safety_critical" => Ok(Self::SafetyCritical),
            other => Err(SupervisorError::validation(format!(
                "unknown safety profile '{}'",
                other
            ))),
        }
    }
}
