//! Run construction, reconciliation and terminal resolution.
//!
//! After every mutation the run controller re-derives aggregates (issue
//! counts, usage totals, quality levels) from the phases, applies budget
//! caps, moves tiers, mirrors the active phase onto the run state and, once
//! every tier is terminal, resolves the run's terminal state.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use super::phase::{self, quality_of};
use super::tier::{tolerance_violation, TierController};
use super::RunTxn;
use crate::budget::BudgetManager;
use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::SupervisorEvent;
use crate::issues::IssueTracker;
use crate::lifecycle::{self, LifecycleState};
use crate::model::{
    Phase, PhaseDiagnostics, PhaseFailureKind, PhaseSpec, PhaseState, QualityLevel, Run,
    RunConfig, RunScope, RunState, Tier, TierSpec, TierState,
};

/// Builds runs and keeps their derived state consistent.
pub struct RunController<'a> {
    pub config: &'a SupervisorConfig,
    pub budget: &'a BudgetManager,
    pub tracker: &'a IssueTracker,
}

/// Move the run along a legal edge and stage a state-change event.
fn advance_run(txn: &mut RunTxn, to: RunState, reason: Option<&str>) -> SupervisorResult<()> {
    let from = txn.run.state;
    lifecycle::advance(&mut txn.run.state, &mut txn.run.transitions, to, reason)?;
    txn.events.push(SupervisorEvent::RunStateChanged {
        run_id: txn.run.run_id.clone(),
        from,
        to,
        timestamp: txn.now,
    });
    Ok(())
}

/// Run-level ordering of active phase states.
fn activity_rank(state: PhaseState) -> u8 {
    match state {
        PhaseState::CiRunning => 3,
        PhaseState::Gate => 2,
        PhaseState::Executing => 1,
        _ => 0,
    }
}

impl<'a> RunController<'a> {
    /// Validate start-time specs and build a run in `PHASE_QUEUEING`.
    pub fn build_run(
        &self,
        config: RunConfig,
        tiers: Vec<TierSpec>,
        phases: Vec<PhaseSpec>,
        now: DateTime<Utc>,
    ) -> SupervisorResult<Run> {
        if tiers.is_empty() {
            return Err(SupervisorError::validation("a run needs at least one tier"));
        }
        if config.scope == RunScope::SingleTier && tiers.len() != 1 {
            return Err(SupervisorError::validation(format!(
                "single_tier run declares {} tiers",
                tiers.len()
            )));
        }

        let mut tier_ids = HashSet::new();
        for tier in &tiers {
            if tier.tier_id.trim().is_empty() {
                return Err(SupervisorError::validation("tier_id must not be empty"));
            }
            if !tier_ids.insert(tier.tier_id.as_str()) {
                return Err(SupervisorError::validation(format!(
                    "duplicate tier_id '{}'",
                    tier.tier_id
                )));
            }
        }
        let mut phase_ids = HashSet::new();
        for phase in &phases {
            if phase.phase_id.trim().is_empty() {
                return Err(SupervisorError::validation("phase_id must not be empty"));
            }
            if !phase_ids.insert(phase.phase_id.as_str()) {
                return Err(SupervisorError::validation(format!(
                    "duplicate phase_id '{}'",
                    phase.phase_id
                )));
            }
            if !tier_ids.contains(phase.tier_id.as_str()) {
                return Err(SupervisorError::validation(format!(
                    "phase '{}' references unknown tier '{}'",
                    phase.phase_id, phase.tier_id
                )));
            }
            if phase.max_builder_attempts == Some(0) || phase.max_auditor_attempts == Some(0) {
                return Err(SupervisorError::validation(format!(
                    "phase '{}' attempt limits must be non-zero",
                    phase.phase_id
                )));
            }
        }
        if let Some(empty) = tiers
            .iter()
            .find(|t| !phases.iter().any(|p| p.tier_id == t.tier_id))
        {
            return Err(SupervisorError::validation(format!(
                "tier '{}' has no phases",
                empty.tier_id
            )));
        }

        let defaults = &self.config.run_defaults;
        let run_id = if config.run_id.trim().is_empty() {
            format!("run-{}", Uuid::new_v4())
        } else {
            config.run_id.clone()
        };

        let mut tiers = tiers;
        tiers.sort_by_key(|t| t.index);
        let mut phases = phases;
        phases.sort_by_key(|p| {
            let tier_index = tiers
                .iter()
                .position(|t| t.tier_id == p.tier_id)
                .unwrap_or(usize::MAX);
            (tier_index, p.index)
        });

        let built_tiers = tiers
            .into_iter()
            .map(|spec| Tier {
                phase_ids: phases
                    .iter()
                    .filter(|p| p.tier_id == spec.tier_id)
                    .map(|p| p.phase_id.clone())
                    .collect(),
                tier_id: spec.tier_id,
                index: spec.index,
                name: spec.name,
                state: TierState::Pending,
                token_cap: spec.token_cap,
                ci_run_cap: spec.ci_run_cap,
                max_minor_issues_tolerated: spec.max_minor_issues_tolerated,
                max_major_issues_tolerated: spec.max_major_issues_tolerated,
                tokens_used: 0,
                ci_runs_used: 0,
                minor_issues_count: 0,
                major_issues_count: 0,
                cleanliness: Default::default(),
                failure_reason: None,
                transitions: Vec::new(),
            })
            .collect();

        let phase_count = phases.len() as u32;
        let built_phases = phases
            .into_iter()
            .map(|spec| Phase {
                token_allocation: self.budget.allocate_initial_tokens(spec.complexity),
                max_builder_attempts: spec
                    .max_builder_attempts
                    .unwrap_or(defaults.max_builder_attempts),
                max_auditor_attempts: spec
                    .max_auditor_attempts
                    .unwrap_or(defaults.max_auditor_attempts),
                phase_id: spec.phase_id,
                tier_id: spec.tier_id,
                index: spec.index,
                name: spec.name,
                state: PhaseState::Queued,
                task_category: spec.task_category,
                complexity: spec.complexity,
                independent: spec.independent,
                builder_attempts: 0,
                auditor_attempts: 0,
                consecutive_failures: 0,
                tokens_used: 0,
                ci_runs_used: 0,
                minor_issues_count: 0,
                major_issues_count: 0,
                issue_state: Default::default(),
                quality_level: QualityLevel::Ok,
                quality_blocked: false,
                review_pending: false,
                commits: Vec::new(),
                recent_errors: Vec::new(),
                diagnostics: PhaseDiagnostics::default(),
                failure: None,
                transitions: Vec::new(),
                started_at: None,
                finished_at: None,
            })
            .collect();

        let mut run = Run {
            integration_line: format!("{}{}", self.config.git.integration_branch_prefix, run_id),
            run_id,
            state: RunState::PlanBootstrap,
            safety_profile: config.safety_profile,
            scope: config.scope,
            token_cap: config.token_cap.unwrap_or(defaults.token_cap),
            max_phases: config.max_phases.unwrap_or(defaults.max_phases),
            max_duration_minutes: config
                .max_duration_minutes
                .unwrap_or(defaults.max_duration_minutes),
            max_minor_issues_total: phase_count * defaults.minor_issues_per_phase,
            tokens_used: 0,
            ci_runs_used: 0,
            minor_issues_count: 0,
            major_issues_count: 0,
            promotion_eligible: false,
            failure_reason: None,
            rejected_patches: 0,
            token_escalations: 0,
            summary_write_failures: 0,
            created_at: now,
            finished_at: None,
            tiers: built_tiers,
            phases: built_phases,
            transitions: Vec::new(),
        };

        lifecycle::advance(
            &mut run.state,
            &mut run.transitions,
            RunState::RunCreated,
            Some("plan accepted"),
        )?;
        lifecycle::advance(
            &mut run.state,
            &mut run.transitions,
            RunState::PhaseQueueing,
            None,
        )?;
        Ok(run)
    }

    /// Re-derive everything that depends on phase state.
    pub fn reconcile(&self, txn: &mut RunTxn) -> SupervisorResult<()> {
        if txn.run.is_terminal() {
            return Ok(());
        }

        self.tracker.recompute_counts(&mut txn.run, &txn.issues);
        roll_up_usage(&mut txn.run);
        let safety = txn.run.safety_profile;
        for phase in &mut txn.run.phases {
            phase.quality_level = quality_of(phase, safety);
            phase.quality_blocked = phase.quality_level == QualityLevel::Blocked;
        }

        if let Some(reason) = self.budget.check_run_budget(&txn.run, txn.now).reason() {
            return self.cancel(txn, &reason);
        }

        let tiers = TierController {
            budget: self.budget,
        };
        if let Some(reason) = tiers.reconcile(txn)? {
            return self.cancel(txn, &reason);
        }
        if let Some(failed) = txn.run.tiers.iter().find(|t| t.state == TierState::Failed) {
            let reason = format!("tier {} failed", failed.tier_id);
            self.skip_remaining(txn, &reason)?;
        }

        self.mirror_active_phase(txn)?;

        if txn.run.tiers.iter().all(|t| t.state.is_terminal()) {
            self.finalize(txn)?;
        }
        Ok(())
    }

    /// Budget cancellation: fail in-flight phases, skip queued ones, resolve
    /// open tiers and force `DONE_FAILED_BUDGET_EXHAUSTED`.
    pub fn cancel(&self, txn: &mut RunTxn, reason: &str) -> SupervisorResult<()> {
        warn!(run_id = %txn.run.run_id, reason, "Run budget exhausted; cancelling");

        let phases: Vec<(String, PhaseState)> = txn
            .run
            .phases
            .iter()
            .map(|p| (p.phase_id.clone(), p.state))
            .collect();
        for (phase_id, state) in phases {
            if state.is_in_flight() {
                phase::fail(txn, &phase_id, PhaseFailureKind::BudgetExhausted, reason)?;
            } else if state == PhaseState::Queued {
                phase::transition(txn, &phase_id, PhaseState::Skipped, Some(reason))?;
            }
        }

        TierController {
            budget: self.budget,
        }
        .cancel(&mut txn.run, reason)?;

        advance_run(txn, RunState::DoneFailedBudgetExhausted, Some(reason))?;
        self.close(txn, Some(reason.to_string()));
        Ok(())
    }

    /// Skip everything in tiers that have not started yet.
    fn skip_remaining(&self, txn: &mut RunTxn, reason: &str) -> SupervisorResult<()> {
        let pending: Vec<String> = txn
            .run
            .tiers
            .iter()
            .filter(|t| t.state == TierState::Pending)
            .flat_map(|t| t.phase_ids.clone())
            .collect();
        for phase_id in pending {
            if txn.run.phase(&phase_id).map(|p| p.state) == Some(PhaseState::Queued) {
                phase::transition(txn, &phase_id, PhaseState::Skipped, Some(reason))?;
            }
        }
        for tier in txn
            .run
            .tiers
            .iter_mut()
            .filter(|t| t.state == TierState::Pending)
        {
            lifecycle::advance(
                &mut tier.state,
                &mut tier.transitions,
                TierState::Skipped,
                Some(reason),
            )?;
        }
        Ok(())
    }

    /// Keep the run state in step with its most advanced active phase.
    fn mirror_active_phase(&self, txn: &mut RunTxn) -> SupervisorResult<()> {
        let active = txn
            .run
            .phases
            .iter()
            .map(|p| p.state)
            .filter(|s| s.is_in_flight())
            .max_by_key(|s| activity_rank(*s));
        let Some(target) = active.and_then(RunState::for_active_phase) else {
            return Ok(());
        };
        if txn.run.state == target {
            return Ok(());
        }
        if txn.run.state == RunState::PhaseQueueing && target != RunState::PhaseExecution {
            advance_run(txn, RunState::PhaseExecution, None)?;
        }
        advance_run(txn, target, None)
    }

    /// Every tier is terminal: snapshot, then resolve success or failure.
    fn finalize(&self, txn: &mut RunTxn) -> SupervisorResult<()> {
        let run = &txn.run;
        let blocked = run.phases.iter().find(|p| p.quality_blocked);
        let all_complete = run.tiers.iter().all(|t| t.state == TierState::Complete);
        let within_tolerance = run.tiers.iter().all(|t| tolerance_violation(t).is_none());
        let within_minor = run.minor_issues_count <= run.max_minor_issues_total;

        let (terminal, reason) = if all_complete
            && within_tolerance
            && within_minor
            && blocked.is_none()
        {
            (RunState::DoneSuccess, None)
        } else {
            let (state, reason) = failure_outcome(run);
            (state, Some(reason))
        };

        advance_run(txn, RunState::SnapshotCreated, Some("all tiers terminal"))?;
        advance_run(txn, terminal, reason.as_deref())?;
        self.close(txn, reason);
        Ok(())
    }

    fn close(&self, txn: &mut RunTxn, reason: Option<String>) {
        let run = &mut txn.run;
        run.finished_at = Some(txn.now);
        run.promotion_eligible = run.state == RunState::DoneSuccess
            && run.major_issues_count == 0
            && !run.phases.iter().any(|p| p.quality_blocked);
        run.failure_reason = reason.clone();

        info!(
            run_id = %run.run_id,
            state = %run.state,
            promotion_eligible = run.promotion_eligible,
            reason = reason.as_deref().unwrap_or(""),
            "Run finished"
        );
        txn.events.push(SupervisorEvent::RunFinished {
            run_id: run.run_id.clone(),
            state: run.state,
            reason,
            timestamp: txn.now,
        });
    }
}

/// Sum phase token and CI usage into tiers and the run.
fn roll_up_usage(run: &mut Run) {
    for tier in &mut run.tiers {
        let owned = run.phases.iter().filter(|p| p.tier_id == tier.tier_id);
        let (tokens, ci) = owned.fold((0u64, 0u32), |(t, c), p| {
            (t + p.tokens_used, c + p.ci_runs_used)
        });
        tier.tokens_used = tokens;
        tier.ci_runs_used = ci;
    }
    run.tokens_used = run.phases.iter().map(|p| p.tokens_used).sum();
    run.ci_runs_used = run.phases.iter().map(|p| p.ci_runs_used).sum();
}

/// Failure state by priority: policy violation, environment, budget, then
/// human review.
fn failure_outcome(run: &Run) -> (RunState, String) {
    let failed_with = |kind: PhaseFailureKind| {
        run.phases.iter().find_map(|p| {
            p.failure
                .as_ref()
                .filter(|f| f.kind == kind)
                .map(|f| format!("phase {}: {}", p.phase_id, f.reason))
        })
    };

    if let Some(reason) = failed_with(PhaseFailureKind::PolicyViolation) {
        return (
            RunState::DoneFailedPolicyViolation,
            format!("Policy violation: {}", reason),
        );
    }
    if let Some(reason) = failed_with(PhaseFailureKind::Environment) {
        return (
            RunState::DoneFailedEnvironment,
            format!("Environment failure: {}", reason),
        );
    }
    if let Some(reason) = failed_with(PhaseFailureKind::BudgetExhausted) {
        return (RunState::DoneFailedBudgetExhausted, reason);
    }

    let reason = if let Some(tier) = run
        .tiers
        .iter()
        .find(|t| t.state == TierState::Failed)
    {
        format!(
            "tier {} failed: {}",
            tier.tier_id,
            tier.failure_reason.as_deref().unwrap_or("unknown")
        )
    } else if let Some((tier, violation)) = run
        .tiers
        .iter()
        .find_map(|t| tolerance_violation(t).map(|v| (t, v)))
    {
        format!("tier {} over tolerance: {}", tier.tier_id, violation)
    } else if run.minor_issues_count > run.max_minor_issues_total {
        format!(
            "{} minor issues exceed run tolerance {}",
            run.minor_issues_count, run.max_minor_issues_total
        )
    } else if let Some(phase) = run.phases.iter().find(|p| p.quality_blocked) {
        format!("phase {} is quality blocked", phase.phase_id)
    } else {
        "no tier completed".to_string()
    };
    (
        RunState::DoneFailedRequiresHumanReview,
        format!("Requires human review: {}", reason),
    )
}
