//! Tier lifecycle derived from its phases.

use tracing::{info, warn};

use super::RunTxn;
use crate::budget::BudgetManager;
use crate::error::SupervisorResult;
use crate::lifecycle::{self, LifecycleState};
use crate::model::{PhaseState, Run, Tier, TierState};

/// Where a tier should go after its phases moved.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TierStep {
    Stay,
    Start,
    Skip,
    Complete,
    Fail(String),
}

/// Re-derives tier states from their phases.
pub struct TierController<'a> {
    pub budget: &'a BudgetManager,
}

impl<'a> TierController<'a> {
    /// Move every tier to the state its phases imply.
    ///
    /// Returns the budget reason of the first tier whose own caps are
    /// exceeded; that tier is failed here and the caller cancels the run.
    pub fn reconcile(&self, txn: &mut RunTxn) -> SupervisorResult<Option<String>> {
        for idx in 0..txn.run.tiers.len() {
            if txn.run.tiers[idx].state.is_terminal() {
                continue;
            }

            let budget = self.budget.check_tier_budget(&txn.run.tiers[idx]);
            if let Some(reason) = budget.reason() {
                let tier = &mut txn.run.tiers[idx];
                warn!(
                    run_id = %txn.run.run_id,
                    tier_id = %tier.tier_id,
                    reason = %reason,
                    "Tier budget exhausted"
                );
                move_tier(tier, TierState::Failed, Some(&reason))?;
                tier.failure_reason = Some(reason.clone());
                return Ok(Some(reason));
            }

            let step = next_step(&txn.run, &txn.run.tiers[idx]);
            let tier = &mut txn.run.tiers[idx];
            match step {
                TierStep::Stay => {}
                TierStep::Start => move_tier(tier, TierState::InProgress, None)?,
                TierStep::Skip => move_tier(tier, TierState::Skipped, Some("all phases skipped"))?,
                TierStep::Complete => {
                    if tier.state == TierState::Pending {
                        move_tier(tier, TierState::InProgress, None)?;
                    }
                    move_tier(tier, TierState::Complete, None)?;
                    info!(run_id = %txn.run.run_id, tier_id = %tier.tier_id, "Tier complete");
                }
                TierStep::Fail(reason) => {
                    move_tier(tier, TierState::Failed, Some(&reason))?;
                    warn!(
                        run_id = %txn.run.run_id,
                        tier_id = %tier.tier_id,
                        reason = %reason,
                        "Tier failed"
                    );
                    tier.failure_reason = Some(reason);
                }
            }
        }
        Ok(None)
    }

    /// Resolve every open tier during run cancellation.
    pub fn cancel(&self, run: &mut Run, reason: &str) -> SupervisorResult<()> {
        let phases = run.phases.clone();
        for tier in &mut run.tiers {
            if tier.state.is_terminal() {
                continue;
            }
            let untouched = phases
                .iter()
                .filter(|p| p.tier_id == tier.tier_id)
                .all(|p| p.started_at.is_none() && p.state == PhaseState::Skipped);
            if tier.state == TierState::Pending && untouched {
                move_tier(tier, TierState::Skipped, Some(reason))?;
            } else {
                move_tier(tier, TierState::Failed, Some(reason))?;
                tier.failure_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }
}

fn move_tier(tier: &mut Tier, to: TierState, reason: Option<&str>) -> SupervisorResult<()> {
    lifecycle::advance(&mut tier.state, &mut tier.transitions, to, reason)
}

fn next_step(run: &Run, tier: &Tier) -> TierStep {
    let phases: Vec<_> = run.phases_of(tier).collect();
    let started = phases.iter().any(|p| p.started_at.is_some());
    let all_terminal = phases.iter().all(|p| p.state.is_terminal());

    if !all_terminal {
        return if tier.state == TierState::Pending && started {
            TierStep::Start
        } else {
            TierStep::Stay
        };
    }

    if !started && phases.iter().all(|p| p.state == PhaseState::Skipped) {
        return if tier.state == TierState::Pending {
            TierStep::Skip
        } else {
            TierStep::Fail("all phases skipped".to_string())
        };
    }

    if let Some(failed) = phases.iter().find(|p| p.state == PhaseState::Failed) {
        return TierStep::Fail(format!("phase {} failed", failed.phase_id));
    }
    match tolerance_violation(tier) {
        Some(reason) => TierStep::Fail(reason),
        None => TierStep::Complete,
    }
}

/// Why the tier's issue counts exceed what it tolerates, if they do.
///
/// Holds for terminal tiers too: issues recorded after a tier completed
/// still count against it.
pub(crate) fn tolerance_violation(tier: &Tier) -> Option<String> {
    if tier.major_issues_count > tier.max_major_issues_tolerated {
        return Some(format!(
            "{} major issues exceed tolerance {}",
            tier.major_issues_count, tier.max_major_issues_tolerated
        ));
    }
    match tier.max_minor_issues_tolerated {
        Some(tolerated) if tier.minor_issues_count > tolerated => Some(format!(
            "{} minor issues exceed tolerance {}",
            tier.minor_issues_count, tolerated
        )),
        _ => None,
    }
}
