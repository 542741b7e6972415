//! Budget manager: initial token allocation, escalation on truncation, and
//! run/tier cap checks.
//!
//! Escalation is on demand: a phase starts at its complexity allocation and
//! only grows (×factor, capped at the ceiling) when the Builder reports that
//! its output was truncated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BudgetPolicy;
use crate::model::{Complexity, Run, Tier};

/// Why the Builder's generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    /// Output was truncated at the allocation limit
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Which cap ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCap {
    Tokens,
    Phases,
    Duration,
    TierTokens,
    TierCiRuns,
}

impl std::fmt::Display for BudgetCap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tokens => write!(f, "token cap"),
            Self::Phases => write!(f, "phase-count cap"),
            Self::Duration => write!(f, "duration cap"),
            Self::TierTokens => write!(f, "tier token cap"),
            Self::TierCiRuns => write!(f, "tier CI-run cap"),
        }
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetStatus {
    /// Every cap still has headroom
    Ok,
    /// A cap was reached; the owner must fail
    Exhausted { cap: BudgetCap, used: u64, limit: u64 },
}

impl BudgetStatus {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Human-readable reason suitable for a run's `failure_reason`.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Ok => None,
            Self::Exhausted { cap, used, limit } => Some(format!(
                "Budget exhausted: {} reached ({} of {})",
                cap, used, limit
            )),
        }
    }
}

/// One token escalation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEscalation {
    pub from: u32,
    pub to: u32,
}

/// Tracks and escalates token/time/attempt budgets.
#[derive(Debug, Clone, Default)]
pub struct BudgetManager {
    policy: BudgetPolicy,
}

impl BudgetManager {
    pub fn new(policy: BudgetPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Starting max-token allocation for a phase of the given complexity.
    pub fn allocate_initial_tokens(&self, complexity: Complexity) -> u32 {
        self.policy.initial_for(complexity)
    }

    /// Next allocation after a Builder call. Only a truncation signal grows
    /// the allocation; the result never exceeds the ceiling.
    pub fn escalate(&self, current_tokens: u32, stop_reason: StopReason) -> u32 {
        self.try_escalate(current_tokens, stop_reason)
            .map(|e| e.to)
            .unwrap_or(current_tokens)
    }

    /// Like [`escalate`](Self::escalate) but reports whether anything changed.
    pub fn try_escalate(
        &self,
        current_tokens: u32,
        stop_reason: StopReason,
    ) -> Option<TokenEscalation> {
        if stop_reason != StopReason::MaxTokens {
            return None;
        }
        let ceiling = self.policy.max_tokens_ceiling;
        let scaled = (current_tokens as f64 * self.policy.escalation_factor) as u64;
        let next = scaled.min(ceiling as u64) as u32;
        if next <= current_tokens {
            return None;
        }

        warn!(
            from = current_tokens,
            to = next,
            factor = self.policy.escalation_factor,
            ceiling,
            "Escalating token allocation after truncation"
        );
        Some(TokenEscalation {
            from: current_tokens,
            to: next,
        })
    }

    /// Compare a run's cumulative tokens, started phases and elapsed time
    /// against its caps.
    pub fn check_run_budget(&self, run: &Run, now: DateTime<Utc>) -> BudgetStatus {
        if run.tokens_used >= run.token_cap {
            return BudgetStatus::Exhausted {
                cap: BudgetCap::Tokens,
                used: run.tokens_used,
                limit: run.token_cap,
            };
        }
        let started = run.phases_started();
        if started > run.max_phases {
            return BudgetStatus::Exhausted {
                cap: BudgetCap::Phases,
                used: started as u64,
                limit: run.max_phases as u64,
            };
        }
        let elapsed = run.elapsed_minutes(now);
        if elapsed >= run.max_duration_minutes {
            return BudgetStatus::Exhausted {
                cap: BudgetCap::Duration,
                used: elapsed,
                limit: run.max_duration_minutes,
            };
        }
        BudgetStatus::Ok
    }

    /// Compare a tier's token and CI-run totals against its optional caps.
    pub fn check_tier_budget(&self, tier: &Tier) -> BudgetStatus {
        if let Some(cap) = tier.token_cap {
            if tier.tokens_used > cap {
                return BudgetStatus::Exhausted {
                    cap: BudgetCap::TierTokens,
                    used: tier.tokens_used,
                    limit: cap,
                };
            }
        }
        if let Some(cap) = tier.ci_run_cap {
            if tier.ci_runs_used > cap {
                return BudgetStatus::Exhausted {
                    cap: BudgetCap::TierCiRuns,
                    used: tier.ci_runs_used as u64,
                    limit: cap as u64,
                };
            }
        }
        BudgetStatus::Ok
    }
}
