//! Per-phase state machine driver.
//!
//! Transitions come from three places only: Builder/Auditor processors,
//! explicit status updates (including CI outcomes) and run-level budget
//! cancellation. A failed attempt re-enters `EXECUTING` while attempts
//! remain and fails the phase once they are spent.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::RunTxn;
use crate::apply::GovernedApplyPath;
use crate::budget::BudgetManager;
use crate::diagnostics::{ContextRetriever, DiagnosticsEscalationEngine};
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::SupervisorEvent;
use crate::issues::IssueTracker;
use crate::lifecycle::{self, LifecycleState};
use crate::model::{
    Phase, PhaseFailure, PhaseFailureKind, PhaseState, QualityLevel, Run, SafetyProfile,
};
use crate::processors::{
    AttemptFailure, AuditorProcessor, AuditorResult, BuilderProcessor, BuilderResult,
    ProcessContext, VerdictTarget,
};

/// Error lines kept on a phase for diagnostics.
const MAX_RECENT_ERRORS: usize = 50;

/// Counter deltas carried by a status update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounters {
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub ci_runs: u32,
}

/// Result reported by the external CI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CiOutcome {
    Passed,
    Failed {
        #[serde(default)]
        errors: Vec<String>,
    },
    TimedOut,
}

/// Drives one phase at a time inside a staged run.
pub struct PhaseController<'a> {
    pub budget: &'a BudgetManager,
    pub diagnostics: &'a DiagnosticsEscalationEngine,
    pub retriever: Option<&'a dyn ContextRetriever>,
    pub tracker: &'a IssueTracker,
    pub apply: &'a GovernedApplyPath,
}

fn phase_mut<'r>(run: &'r mut Run, phase_id: &str) -> SupervisorResult<&'r mut Phase> {
    let run_id = run.run_id.clone();
    run.phase_mut(phase_id)
        .ok_or_else(|| SupervisorError::phase_not_found(run_id, phase_id))
}

fn phase_ref<'r>(run: &'r Run, phase_id: &str) -> SupervisorResult<&'r Phase> {
    run.phase(phase_id)
        .ok_or_else(|| SupervisorError::phase_not_found(&run.run_id, phase_id))
}

/// Reject starting `phase_id` ahead of earlier tiers or earlier dependent
/// phases of its own tier.
pub fn check_order(run: &Run, phase_id: &str) -> SupervisorResult<()> {
    let phase = phase_ref(run, phase_id)?;
    let tier = run
        .tier(&phase.tier_id)
        .ok_or_else(|| SupervisorError::ScopeNotFound {
            run_id: run.run_id.clone(),
            phase_id: phase_id.to_string(),
        })?;

    if let Some(blocking) = run
        .tiers
        .iter()
        .filter(|t| t.index < tier.index)
        .find(|t| !t.state.is_terminal())
    {
        return Err(SupervisorError::PhaseOrderViolation {
            phase_id: phase_id.to_string(),
            message: format!("earlier tier {} is {}", blocking.tier_id, blocking.state),
        });
    }

    if phase.independent {
        return Ok(());
    }
    if let Some(blocking) = run
        .phases_of(tier)
        .filter(|p| p.index < phase.index && !p.independent)
        .find(|p| !p.state.is_terminal())
    {
        return Err(SupervisorError::PhaseOrderViolation {
            phase_id: phase_id.to_string(),
            message: format!("earlier phase {} is {}", blocking.phase_id, blocking.state),
        });
    }
    Ok(())
}

/// Move a phase along a legal edge, stamping times and staging an event.
pub fn transition(
    txn: &mut RunTxn,
    phase_id: &str,
    to: PhaseState,
    reason: Option<&str>,
) -> SupervisorResult<()> {
    let now = txn.now;
    let run_id = txn.run.run_id.clone();
    let phase = phase_mut(&mut txn.run, phase_id)?;
    let from = phase.state;
    lifecycle::advance(&mut phase.state, &mut phase.transitions, to, reason)?;

    if from == PhaseState::Queued && to != PhaseState::Skipped {
        phase.started_at.get_or_insert(now);
    }
    if to.is_terminal() {
        phase.finished_at = Some(now);
    }

    txn.events.push(SupervisorEvent::PhaseTransition {
        run_id,
        phase_id: phase_id.to_string(),
        from,
        to,
        reason: reason.map(String::from),
        timestamp: now,
    });
    Ok(())
}

/// Terminally fail a phase with a recorded kind and reason.
pub fn fail(
    txn: &mut RunTxn,
    phase_id: &str,
    kind: PhaseFailureKind,
    reason: impl Into<String>,
) -> SupervisorResult<()> {
    let reason = reason.into();
    transition(txn, phase_id, PhaseState::Failed, Some(&reason))?;
    warn!(
        run_id = %txn.run.run_id,
        phase_id,
        kind = %kind,
        reason = %reason,
        "Phase failed"
    );
    phase_mut(&mut txn.run, phase_id)?.failure = Some(PhaseFailure { kind, reason });
    Ok(())
}

/// Derive a phase's quality level from its issues, pending review and the
/// run's safety profile.
pub fn quality_of(phase: &Phase, safety: SafetyProfile) -> QualityLevel {
    if safety == SafetyProfile::SafetyCritical && phase.major_issues_count > 0 {
        QualityLevel::Blocked
    } else if phase.has_issues() || phase.review_pending {
        QualityLevel::NeedsReview
    } else {
        QualityLevel::Ok
    }
}

impl<'a> PhaseController<'a> {
    fn ensure_live(txn: &RunTxn) -> SupervisorResult<()> {
        if txn.run.is_terminal() {
            return Err(SupervisorError::RunTerminal {
                run_id: txn.run.run_id.clone(),
                state: txn.run.state.to_string(),
            });
        }
        Ok(())
    }

    /// `QUEUED → EXECUTING`, honouring tier and phase order.
    pub fn start(&self, txn: &mut RunTxn, phase_id: &str) -> SupervisorResult<()> {
        Self::ensure_live(txn)?;
        check_order(&txn.run, phase_id)?;
        transition(txn, phase_id, PhaseState::Executing, Some("phase started"))?;
        debug!(run_id = %txn.run.run_id, phase_id, "Phase started");
        Ok(())
    }

    /// Explicit status update from an external collaborator.
    pub fn update_status(
        &self,
        txn: &mut RunTxn,
        phase_id: &str,
        new_state: &str,
        counters: PhaseCounters,
    ) -> SupervisorResult<PhaseState> {
        let target = PhaseState::from_str(new_state)?;
        Self::ensure_live(txn)?;

        let current = {
            let phase = phase_mut(&mut txn.run, phase_id)?;
            phase.tokens_used += counters.tokens_used;
            phase.ci_runs_used += counters.ci_runs;
            phase.state
        };

        if target == current && !current.is_terminal() {
            return Ok(current);
        }

        match target {
            PhaseState::Executing if current == PhaseState::Queued => {
                self.start(txn, phase_id)?;
            }
            PhaseState::Failed => {
                fail(
                    txn,
                    phase_id,
                    PhaseFailureKind::Operator,
                    format!("marked FAILED by status update from {}", current),
                )?;
            }
            PhaseState::Complete => {
                transition(txn, phase_id, target, Some("status update"))?;
                phase_mut(&mut txn.run, phase_id)?.consecutive_failures = 0;
            }
            _ => transition(txn, phase_id, target, Some("status update"))?,
        }
        Ok(phase_ref(&txn.run, phase_id)?.state)
    }

    /// Process one Builder attempt.
    pub fn submit_builder(
        &self,
        txn: &mut RunTxn,
        phase_id: &str,
        result: &BuilderResult,
    ) -> SupervisorResult<(Option<String>, PhaseState)> {
        Self::ensure_live(txn)?;
        let state = phase_ref(&txn.run, phase_id)?.state;
        if state == PhaseState::Queued {
            self.start(txn, phase_id)?;
        } else if state != PhaseState::Executing {
            return Err(SupervisorError::validation(format!(
                "builder result for phase {} requires EXECUTING, phase is {}",
                phase_id, state
            )));
        }

        let escalation = {
            let phase = phase_mut(&mut txn.run, phase_id)?;
            phase.builder_attempts += 1;
            phase.tokens_used += result.tokens_used;
            let escalation = self
                .budget
                .try_escalate(phase.token_allocation, result.stop_reason);
            if let Some(step) = escalation {
                phase.token_allocation = step.to;
            }
            escalation
        };
        if let Some(step) = escalation {
            txn.run.token_escalations += 1;
            txn.events.push(SupervisorEvent::TokenEscalation {
                run_id: txn.run.run_id.clone(),
                phase_id: phase_id.to_string(),
                from: step.from,
                to: step.to,
                timestamp: txn.now,
            });
        }

        let line = txn.run.integration_line.clone();
        let ctx = ProcessContext {
            tracker: self.tracker,
            apply: self.apply,
            integration_line: &line,
        };
        let processed = BuilderProcessor::process(
            &ctx,
            &mut txn.run,
            &mut txn.issues,
            phase_id,
            result,
            &mut txn.applied,
        )?;
        for recorded in &processed.recorded {
            txn.note_issue(recorded);
        }
        if let Some(commit_ref) = &processed.commit_ref {
            self.note_commit(txn, phase_id, commit_ref)?;
        }
        if let Some(rejection) = &processed.rejection {
            self.note_rejection(txn, phase_id, &rejection.message());
        }

        match processed.target {
            VerdictTarget::Complete => {
                let phase = phase_mut(&mut txn.run, phase_id)?;
                phase.consecutive_failures = 0;
                phase.review_pending = false;
                transition(txn, phase_id, PhaseState::Complete, Some("builder success"))?;
            }
            VerdictTarget::Gate => {
                phase_mut(&mut txn.run, phase_id)?.review_pending = true;
                transition(txn, phase_id, PhaseState::Gate, Some("builder needs review"))?;
            }
            VerdictTarget::Executing { failure } | VerdictTarget::Failed { failure } => {
                let mut errors = result.errors.clone();
                errors.push(failure.describe());
                self.attempt_failed(txn, phase_id, failure, errors)?;
            }
        }

        Ok((
            processed.commit_ref,
            phase_ref(&txn.run, phase_id)?.state,
        ))
    }

    /// Process one Auditor review. The phase must be awaiting review.
    pub fn submit_auditor(
        &self,
        txn: &mut RunTxn,
        phase_id: &str,
        result: &AuditorResult,
    ) -> SupervisorResult<(Vec<String>, PhaseState)> {
        Self::ensure_live(txn)?;
        let state = phase_ref(&txn.run, phase_id)?.state;
        if state != PhaseState::Gate {
            return Err(SupervisorError::validation(format!(
                "auditor result for phase {} requires GATE, phase is {}",
                phase_id, state
            )));
        }
        {
            let phase = phase_mut(&mut txn.run, phase_id)?;
            phase.auditor_attempts += 1;
            phase.tokens_used += result.tokens_used;
        }

        let line = txn.run.integration_line.clone();
        let ctx = ProcessContext {
            tracker: self.tracker,
            apply: self.apply,
            integration_line: &line,
        };
        let processed = AuditorProcessor::process(
            &ctx,
            &mut txn.run,
            &mut txn.issues,
            phase_id,
            result,
            &mut txn.applied,
        )?;
        for recorded in &processed.recorded {
            txn.note_issue(recorded);
        }
        for commit_ref in &processed.commit_refs {
            self.note_commit(txn, phase_id, commit_ref)?;
        }
        for rejection in &processed.skipped {
            self.note_rejection(txn, phase_id, &rejection.message());
        }

        match processed.target {
            VerdictTarget::Complete => {
                let phase = phase_mut(&mut txn.run, phase_id)?;
                phase.consecutive_failures = 0;
                phase.review_pending = false;
                transition(txn, phase_id, PhaseState::Complete, Some("auditor approved"))?;
            }
            VerdictTarget::Gate => {}
            VerdictTarget::Executing { failure } | VerdictTarget::Failed { failure } => {
                let mut errors: Vec<String> = result.notes.iter().cloned().collect();
                errors.push(failure.describe());
                self.attempt_failed(txn, phase_id, failure, errors)?;
            }
        }

        Ok((
            processed.commit_refs,
            phase_ref(&txn.run, phase_id)?.state,
        ))
    }

    /// Apply a CI outcome to a phase in `CI_RUNNING`.
    pub fn report_ci(
        &self,
        txn: &mut RunTxn,
        phase_id: &str,
        outcome: &CiOutcome,
    ) -> SupervisorResult<PhaseState> {
        Self::ensure_live(txn)?;
        let state = phase_ref(&txn.run, phase_id)?.state;
        if state != PhaseState::CiRunning {
            return Err(SupervisorError::validation(format!(
                "CI outcome for phase {} requires CI_RUNNING, phase is {}",
                phase_id, state
            )));
        }
        phase_mut(&mut txn.run, phase_id)?.ci_runs_used += 1;

        match outcome {
            CiOutcome::Passed => {
                phase_mut(&mut txn.run, phase_id)?.consecutive_failures = 0;
                transition(txn, phase_id, PhaseState::Complete, Some("CI passed"))?;
            }
            CiOutcome::Failed { errors } => {
                let mut errors = errors.clone();
                errors.push(AttemptFailure::CiFailed.describe());
                self.attempt_failed(txn, phase_id, AttemptFailure::CiFailed, errors)?;
            }
            CiOutcome::TimedOut => {
                self.attempt_failed(
                    txn,
                    phase_id,
                    AttemptFailure::CiTimedOut,
                    vec![AttemptFailure::CiTimedOut.describe()],
                )?;
            }
        }
        Ok(phase_ref(&txn.run, phase_id)?.state)
    }

    fn note_commit(&self, txn: &mut RunTxn, phase_id: &str, commit_ref: &str) -> SupervisorResult<()> {
        phase_mut(&mut txn.run, phase_id)?
            .commits
            .push(commit_ref.to_string());
        txn.events.push(SupervisorEvent::PatchApplied {
            run_id: txn.run.run_id.clone(),
            phase_id: phase_id.to_string(),
            commit_ref: commit_ref.to_string(),
            timestamp: txn.now,
        });
        Ok(())
    }

    fn note_rejection(&self, txn: &mut RunTxn, phase_id: &str, reason: &str) {
        txn.run.rejected_patches += 1;
        txn.events.push(SupervisorEvent::PatchRejected {
            run_id: txn.run.run_id.clone(),
            phase_id: phase_id.to_string(),
            reason: reason.to_string(),
            timestamp: txn.now,
        });
    }

    /// Count a failed attempt, then retry or fail the phase.
    fn attempt_failed(
        &self,
        txn: &mut RunTxn,
        phase_id: &str,
        failure: AttemptFailure,
        errors: Vec<String>,
    ) -> SupervisorResult<()> {
        let exhausted = {
            let phase = phase_mut(&mut txn.run, phase_id)?;
            phase.consecutive_failures += 1;
            phase.recent_errors.extend(errors);
            let overflow = phase.recent_errors.len().saturating_sub(MAX_RECENT_ERRORS);
            phase.recent_errors.drain(..overflow);

            match failure {
                AttemptFailure::Escalated => true,
                AttemptFailure::RevisionRequested => {
                    phase.remaining_builder_attempts() == 0
                        || phase.remaining_auditor_attempts() == 0
                }
                _ => phase.remaining_builder_attempts() == 0,
            }
        };

        if exhausted {
            let kind = failure.exhausted_kind();
            let reason = match kind {
                PhaseFailureKind::AuditorEscalated => failure.describe(),
                _ => format!("{}; no attempts left", failure.describe()),
            };
            return fail(txn, phase_id, kind, reason);
        }

        let reason = format!("retry: {}", failure.describe());
        transition(txn, phase_id, PhaseState::Executing, Some(&reason))?;
        self.run_diagnostics(txn, phase_id);
        Ok(())
    }

    /// Stage 1 or Stage 2 context for the next attempt.
    fn run_diagnostics(&self, txn: &mut RunTxn, phase_id: &str) {
        let run_id = txn.run.run_id.clone();
        let now = txn.now;
        let Some(phase) = txn.run.phase_mut(phase_id) else {
            return;
        };

        let decision = self.diagnostics.decide(
            phase.consecutive_failures,
            &phase.recent_errors,
            phase.diagnostics.stage1_retrievals,
        );
        let query = if phase.recent_errors.is_empty() {
            format!(
                "{} {}",
                phase.name,
                phase.task_category.as_deref().unwrap_or_default()
            )
        } else {
            phase.recent_errors.join("\n")
        };

        if decision.escalate {
            phase.diagnostics.stage2_escalations += 1;
            phase.diagnostics.last_trigger = decision.trigger.map(|t| t.to_string());
            let snippets = match self.retriever {
                Some(retriever) => self
                    .diagnostics
                    .retrieve_all_categories(retriever, &query)
                    .unwrap_or_else(|e| {
                        warn!(run_id = %run_id, phase_id, error = %e, "Stage 2 retrieval failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            info!(
                run_id = %run_id,
                phase_id,
                reason = %decision.reason,
                snippets = snippets.len(),
                "Diagnostics escalated to Stage 2"
            );
            let count = snippets.len();
            phase.diagnostics.deep_context = snippets;
            txn.events.push(SupervisorEvent::DiagnosticsEscalated {
                run_id,
                phase_id: phase_id.to_string(),
                trigger: decision
                    .trigger
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
                snippets: count,
                timestamp: now,
            });
        } else {
            phase.diagnostics.stage1_retrievals += 1;
            phase.diagnostics.shallow_context = match self.retriever {
                Some(retriever) => self
                    .diagnostics
                    .retrieve_shallow_context(retriever, &query)
                    .unwrap_or_else(|e| {
                        warn!(run_id = %run_id, phase_id, error = %e, "Stage 1 retrieval failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            debug!(
                run_id = %run_id,
                phase_id,
                snippets = phase.diagnostics.shallow_context.len(),
                "Stage 1 context fetched"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{InMemoryVcs, ProtectedPaths};
    use crate::controller::RunRecord;
    use crate::issues::IssueLog;
    use crate::processors::{AuditorRecommendation, BuilderVerdict};
    use crate::testing::sample_run;
    use chrono::Utc;
    use std::sync::Arc;

    struct Fixture {
        budget: BudgetManager,
        diagnostics: DiagnosticsEscalationEngine,
        tracker: IssueTracker,
        apply: GovernedApplyPath,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                budget: BudgetManager::default(),
                diagnostics: DiagnosticsEscalationEngine::default(),
                tracker: IssueTracker,
                apply: GovernedApplyPath::new(
                    Arc::new(InMemoryVcs::new()),
                    Arc::new(ProtectedPaths::new(["secrets"])),
                ),
            }
        }

        fn controller(&self) -> PhaseController<'_> {
            PhaseController {
                budget: &self.budget,
                diagnostics: &self.diagnostics,
                retriever: None,
                tracker: &self.tracker,
                apply: &self.apply,
            }
        }
    }

    fn txn(run: Run) -> RunTxn {
        RunTxn::begin(
            &RunRecord {
                run,
                issues: IssueLog::new(),
            },
            Utc::now(),
        )
    }

    const PROTECTED: &str = "--- a/secrets/k\n+++ b/secrets/k\n@@ -1 +1 @@\n-a\n+b\n";

    #[test]
    fn test_order_blocks_later_phase() {
        let run = sample_run("r1", &[("t1", vec!["p1", "p2"]), ("t2", vec!["p3"])]);
        assert!(check_order(&run, "p1").is_ok());
        assert!(matches!(
            check_order(&run, "p2"),
            Err(SupervisorError::PhaseOrderViolation { .. })
        ));
        assert!(matches!(
            check_order(&run, "p3"),
            Err(SupervisorError::PhaseOrderViolation { .. })
        ));
    }

    #[test]
    fn test_independent_phase_may_start_early() {
        let mut run = sample_run("r1", &[("t1", vec!["p1", "p2"])]);
        run.phase_mut("p2").unwrap().independent = true;
        assert!(check_order(&run, "p2").is_ok());
    }

    #[test]
    fn test_builder_success_completes() {
        let fx = Fixture::new();
        let mut t = txn(sample_run("r1", &[("t1", vec!["p1"])]));
        let (commit, state) = fx
            .controller()
            .submit_builder(&mut t, "p1", &BuilderResult::new(BuilderVerdict::Success))
            .unwrap();
        assert!(commit.is_none());
        assert_eq!(state, PhaseState::Complete);
        assert_eq!(t.run.phase("p1").unwrap().builder_attempts, 1);
    }

    #[test]
    fn test_failed_verdict_retries_until_exhausted() {
        let fx = Fixture::new();
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        run.phases[0].max_builder_attempts = 2;
        let mut t = txn(run);
        let failed = BuilderResult::new(BuilderVerdict::Failed).with_errors(["src/lib.rs:1 boom"]);

        let (_, state) = fx.controller().submit_builder(&mut t, "p1", &failed).unwrap();
        assert_eq!(state, PhaseState::Executing);
        assert_eq!(t.run.phase("p1").unwrap().diagnostics.stage1_retrievals, 1);

        let (_, state) = fx.controller().submit_builder(&mut t, "p1", &failed).unwrap();
        assert_eq!(state, PhaseState::Failed);
        let failure = t.run.phase("p1").unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, PhaseFailureKind::AttemptsExhausted);
    }

    #[test]
    fn test_protected_patch_never_completes() {
        let fx = Fixture::new();
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        run.phases[0].max_builder_attempts = 1;
        let mut t = txn(run);
        let result = BuilderResult::new(BuilderVerdict::Success).with_patch(PROTECTED);

        let (commit, state) = fx.controller().submit_builder(&mut t, "p1", &result).unwrap();
        assert!(commit.is_none());
        assert_eq!(state, PhaseState::Failed);
        assert_eq!(
            t.run.phase("p1").unwrap().failure.as_ref().unwrap().kind,
            PhaseFailureKind::PolicyViolation
        );
        assert_eq!(t.run.rejected_patches, 1);
    }

    #[test]
    fn test_truncation_escalates_allocation() {
        let fx = Fixture::new();
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        run.phases[0].token_allocation = 8_192;
        let mut t = txn(run);
        let result = BuilderResult::new(BuilderVerdict::Failed).truncated();
        fx.controller().submit_builder(&mut t, "p1", &result).unwrap();
        assert_eq!(t.run.phase("p1").unwrap().token_allocation, 12_288);
        assert_eq!(t.run.token_escalations, 1);
    }

    #[test]
    fn test_auditor_revise_then_exhaust() {
        let fx = Fixture::new();
        let mut t = txn(sample_run("r1", &[("t1", vec!["p1"])]));
        let review = BuilderResult::new(BuilderVerdict::NeedsReview);
        let revise = AuditorResult::new(AuditorRecommendation::Revise);
        let c = fx.controller();

        c.submit_builder(&mut t, "p1", &review).unwrap();
        let (_, state) = c.submit_auditor(&mut t, "p1", &revise).unwrap();
        assert_eq!(state, PhaseState::Executing);

        c.submit_builder(&mut t, "p1", &review).unwrap();
        let (_, state) = c.submit_auditor(&mut t, "p1", &revise).unwrap();
        assert_eq!(state, PhaseState::Failed);
    }

    #[test]
    fn test_auditor_requires_gate() {
        let fx = Fixture::new();
        let mut t = txn(sample_run("r1", &[("t1", vec!["p1"])]));
        let err = fx
            .controller()
            .submit_auditor(&mut t, "p1", &AuditorResult::new(AuditorRecommendation::Approve))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Validation { .. }));
    }

    #[test]
    fn test_status_update_rejects_unknown_state() {
        let fx = Fixture::new();
        let mut t = txn(sample_run("r1", &[("t1", vec!["p1"])]));
        let err = fx
            .controller()
            .update_status(&mut t, "p1", "executing", PhaseCounters::default())
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidState { .. }));
        assert_eq!(t.run.phase("p1").unwrap().state, PhaseState::Queued);
    }

    #[test]
    fn test_ci_timeout_is_retried_then_environment() {
        let fx = Fixture::new();
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        run.phases[0].max_builder_attempts = 1;
        let mut t = txn(run);
        let c = fx.controller();
        c.update_status(&mut t, "p1", "EXECUTING", PhaseCounters::default())
            .unwrap();
        c.update_status(&mut t, "p1", "CI_RUNNING", PhaseCounters::default())
            .unwrap();
        // No builder attempt has been spent yet, so the timeout is retried.
        assert_eq!(c.report_ci(&mut t, "p1", &CiOutcome::TimedOut).unwrap(), PhaseState::Executing);

        c.submit_builder(&mut t, "p1", &BuilderResult::new(BuilderVerdict::NeedsReview))
            .unwrap();
        c.update_status(&mut t, "p1", "CI_RUNNING", PhaseCounters::default())
            .unwrap();
        let state = c.report_ci(&mut t, "p1", &CiOutcome::TimedOut).unwrap();
        assert_eq!(state, PhaseState::Failed);
        let phase = t.run.phase("p1").unwrap();
        assert_eq!(phase.failure.as_ref().unwrap().kind, PhaseFailureKind::Environment);
        assert_eq!(phase.ci_runs_used, 2);
    }

    #[test]
    fn test_quality_levels() {
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        let phase = &mut run.phases[0];
        assert_eq!(quality_of(phase, SafetyProfile::Normal), QualityLevel::Ok);
        phase.major_issues_count = 1;
        assert_eq!(quality_of(phase, SafetyProfile::Normal), QualityLevel::NeedsReview);
        assert_eq!(quality_of(phase, SafetyProfile::SafetyCritical), QualityLevel::Blocked);
    }
}
