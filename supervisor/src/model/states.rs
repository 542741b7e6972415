//! Lifecycle states for phases, tiers and runs.
//!
//! State names travel across the boundary as their canonical upper-case
//! strings. Parsing is exact: unknown or differently-cased values are
//! rejected, never coerced to a neighbour.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SupervisorError;
use crate::lifecycle::LifecycleState;

/// Per-phase lifecycle.
///
/// ```text
/// QUEUED → EXECUTING → GATE → CI_RUNNING → COMPLETE
///             ↺ (revise / retry)            FAILED | SKIPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Queued,
    Executing,
    Gate,
    CiRunning,
    Complete,
    Failed,
    Skipped,
}

impl PhaseState {
    pub const ALL: [PhaseState; 7] = [
        Self::Queued,
        Self::Executing,
        Self::Gate,
        Self::CiRunning,
        Self::Complete,
        Self::Failed,
        Self::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Gate => "GATE",
            Self::CiRunning => "CI_RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Phase has started but not finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Executing | Self::Gate | Self::CiRunning)
    }
}

impl LifecycleState for PhaseState {
    const KIND: &'static str = "phase";

    fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    fn can_transition_to(self, to: Self) -> bool {
        use PhaseState::*;

        if to == Failed && !self.is_terminal() {
            return true;
        }

        matches!(
            (self, to),
            (Queued, Executing)
                | (Queued, Skipped)
                // Re-entry: auditor revise or a retried attempt
                | (Executing, Executing)
                | (Executing, Gate)
                | (Executing, CiRunning)
                | (Executing, Complete)
                | (Gate, Executing)
                | (Gate, CiRunning)
                | (Gate, Complete)
                | (CiRunning, Executing)
                | (CiRunning, Complete)
        )
    }
}

/// Per-tier lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierState {
    Pending,
    InProgress,
    Complete,
    Failed,
    Skipped,
}

impl TierState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl LifecycleState for TierState {
    const KIND: &'static str = "tier";

    fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    fn can_transition_to(self, to: Self) -> bool {
        use TierState::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (InProgress, Complete)
                | (InProgress, Failed)
        )
    }
}

/// Run lifecycle. All `DONE_*` states are terminal and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    PlanBootstrap,
    RunCreated,
    PhaseQueueing,
    PhaseExecution,
    Gate,
    CiRunning,
    SnapshotCreated,
    DoneSuccess,
    DoneFailedBudgetExhausted,
    DoneFailedPolicyViolation,
    DoneFailedRequiresHumanReview,
    DoneFailedEnvironment,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanBootstrap => "PLAN_BOOTSTRAP",
            Self::RunCreated => "RUN_CREATED",
            Self::PhaseQueueing => "PHASE_QUEUEING",
            Self::PhaseExecution => "PHASE_EXECUTION",
            Self::Gate => "GATE",
            Self::CiRunning => "CI_RUNNING",
            Self::SnapshotCreated => "SNAPSHOT_CREATED",
            Self::DoneSuccess => "DONE_SUCCESS",
            Self::DoneFailedBudgetExhausted => "DONE_FAILED_BUDGET_EXHAUSTED",
            Self::DoneFailedPolicyViolation => "DONE_FAILED_POLICY_VIOLATION",
            Self::DoneFailedRequiresHumanReview => "DONE_FAILED_REQUIRES_HUMAN_REVIEW",
            Self::DoneFailedEnvironment => "DONE_FAILED_ENVIRONMENT",
        }
    }

    /// Terminal failure states.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::DoneFailedBudgetExhausted
                | Self::DoneFailedPolicyViolation
                | Self::DoneFailedRequiresHumanReview
                | Self::DoneFailedEnvironment
        )
    }

    /// Run-level state mirroring the phase that is currently active.
    pub fn for_active_phase(phase: PhaseState) -> Option<Self> {
        match phase {
            PhaseState::Executing => Some(Self::PhaseExecution),
            PhaseState::Gate => Some(Self::Gate),
            PhaseState::CiRunning => Some(Self::CiRunning),
            PhaseState::Queued
            | PhaseState::Complete
            | PhaseState::Failed
            | PhaseState::Skipped => None,
        }
    }
}

impl LifecycleState for RunState {
    const KIND: &'static str = "run";

    fn is_terminal(self) -> bool {
        self == Self::DoneSuccess || self.is_failure()
    }

    fn can_transition_to(self, to: Self) -> bool {
        use RunState::*;

        // Failure is reachable from any live state; success only via a snapshot.
        if to.is_failure() && !self.is_terminal() {
            return true;
        }

        matches!(
            (self, to),
            (PlanBootstrap, RunCreated)
                | (RunCreated, PhaseQueueing)
                | (PhaseQueueing, PhaseExecution)
                | (PhaseQueueing, SnapshotCreated)
                | (PhaseExecution, Gate)
                | (PhaseExecution, CiRunning)
                | (PhaseExecution, SnapshotCreated)
                | (Gate, PhaseExecution)
                | (Gate, CiRunning)
                | (Gate, SnapshotCreated)
                | (CiRunning, PhaseExecution)
                | (CiRunning, Gate)
                | (CiRunning, SnapshotCreated)
                | (SnapshotCreated, DoneSuccess)
        )
    }
}

macro_rules! display_via_as_str {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })+
    };
}

display_via_as_str!(PhaseState, TierState, RunState);

impl FromStr for PhaseState {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SupervisorError::InvalidState {
                kind: "phase",
                value: s.to_string(),
            })
    }
}

impl FromStr for TierState {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETE" => Ok(Self::Complete),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(SupervisorError::InvalidState {
                kind: "tier",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for RunState {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use RunState::*;
        [
            PlanBootstrap,
            RunCreated,
            PhaseQueueing,
            PhaseExecution,
            Gate,
            CiRunning,
            SnapshotCreated,
            DoneSuccess,
            DoneFailedBudgetExhausted,
            DoneFailedPolicyViolation,
            DoneFailedRequiresHumanReview,
            DoneFailedEnvironment,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
        .ok_or_else(|| SupervisorError::InvalidState {
            kind: "run",
            value: s.to_string(),
        })
    }
}
