//! Builder and Auditor result processing.
//!
//! Processors record issues and route patches through the governed apply
//! path, then map the verdict to a [`VerdictTarget`]. They never move the
//! phase themselves; the phase controller turns the target into a legal
//! transition, taking remaining attempts into account.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::apply::{ApplyRejection, GovernedApplyPath};
use crate::budget::StopReason;
use crate::error::{SupervisorError, SupervisorResult};
use crate::issues::{IssueLog, IssueReport, IssueTracker, RecordedIssue};
use crate::model::{PhaseFailureKind, Run};

/// Builder's terminal verdict for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderVerdict {
    Success,
    NeedsReview,
    Failed,
}

impl FromStr for BuilderVerdict {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "needs_review" => Ok(Self::NeedsReview),
            "failed" => Ok(Self::Failed),
            other => Err(SupervisorError::validation(format!(
                "unknown builder verdict '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BuilderVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NeedsReview => write!(f, "needs_review"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Auditor's recommendation for the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditorRecommendation {
    Approve,
    Revise,
    Escalate,
}

impl FromStr for AuditorRecommendation {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "revise" => Ok(Self::Revise),
            "escalate" => Ok(Self::Escalate),
            other => Err(SupervisorError::validation(format!(
                "unknown auditor recommendation '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for AuditorRecommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Revise => write!(f, "revise"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// One Builder attempt's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderResult {
    /// Unified diff, if the Builder produced one
    #[serde(default)]
    pub patch_content: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Probe / test output lines
    #[serde(default)]
    pub probe_outputs: Vec<String>,
    /// Error lines that explain a failed attempt
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub suggested_issues: Vec<IssueReport>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub stop_reason: StopReason,
    pub verdict: BuilderVerdict,
    #[serde(default)]
    pub commit_message: Option<String>,
}

impl BuilderResult {
    pub fn new(verdict: BuilderVerdict) -> Self {
        Self {
            patch_content: None,
            files_changed: Vec::new(),
            probe_outputs: Vec::new(),
            errors: Vec::new(),
            suggested_issues: Vec::new(),
            tokens_used: 0,
            stop_reason: StopReason::EndTurn,
            verdict,
            commit_message: None,
        }
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        self.patch_content = Some(patch.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors.extend(errors.into_iter().map(Into::into));
        self
    }

    pub fn with_issue(mut self, issue: IssueReport) -> Self {
        self.suggested_issues.push(issue);
        self
    }

    pub fn truncated(mut self) -> Self {
        self.stop_reason = StopReason::MaxTokens;
        self
    }
}

/// One Auditor review's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorResult {
    #[serde(default)]
    pub issues_found: Vec<IssueReport>,
    /// Applied in order; a rejected one is skipped
    #[serde(default)]
    pub suggested_patches: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    pub recommendation: AuditorRecommendation,
    #[serde(default)]
    pub notes: Option<String>,
}

impl AuditorResult {
    pub fn new(recommendation: AuditorRecommendation) -> Self {
        Self {
            issues_found: Vec::new(),
            suggested_patches: Vec::new(),
            tokens_used: 0,
            recommendation,
            notes: None,
        }
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        self.suggested_patches.push(patch.into());
        self
    }

    pub fn with_issue(mut self, issue: IssueReport) -> Self {
        self.issues_found.push(issue);
        self
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// Builder said `failed`
    Verdict,
    /// Builder's patch was rejected by the apply path
    PatchRejected { rejection: ApplyRejection },
    /// Auditor said `revise`
    RevisionRequested,
    /// Auditor said `escalate`
    Escalated,
    /// CI reported failing checks
    CiFailed,
    /// CI did not answer within its timeout
    CiTimedOut,
}

impl AttemptFailure {
    pub fn describe(&self) -> String {
        match self {
            Self::Verdict => "builder reported failure".to_string(),
            Self::PatchRejected { rejection } => rejection.message(),
            Self::RevisionRequested => "auditor requested revision".to_string(),
            Self::Escalated => "auditor escalated".to_string(),
            Self::CiFailed => "CI checks failed".to_string(),
            Self::CiTimedOut => "CI timed out".to_string(),
        }
    }

    /// Failure kind to record if no attempts remain.
    pub fn exhausted_kind(&self) -> PhaseFailureKind {
        match self {
            Self::PatchRejected { rejection } if rejection.is_policy_violation() => {
                PhaseFailureKind::PolicyViolation
            }
            Self::PatchRejected { rejection } if rejection.is_environment() => {
                PhaseFailureKind::Environment
            }
            Self::CiTimedOut => PhaseFailureKind::Environment,
            Self::Escalated => PhaseFailureKind::AuditorEscalated,
            Self::Verdict
            | Self::PatchRejected { .. }
            | Self::RevisionRequested
            | Self::CiFailed => PhaseFailureKind::AttemptsExhausted,
        }
    }
}

/// Where a verdict sends the phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum VerdictTarget {
    Complete,
    /// Await Auditor review
    Gate,
    /// Back to the Builder for another attempt
    Executing { failure: AttemptFailure },
    /// Attempt failed
    Failed { failure: AttemptFailure },
}

/// Map a Builder verdict. A rejected patch fails the attempt whatever the
/// verdict said.
pub fn builder_target(verdict: BuilderVerdict, rejection: Option<&ApplyRejection>) -> VerdictTarget {
    if let Some(rejection) = rejection {
        return VerdictTarget::Failed {
            failure: AttemptFailure::PatchRejected {
                rejection: rejection.clone(),
            },
        };
    }
    match verdict {
        BuilderVerdict::Success => VerdictTarget::Complete,
        BuilderVerdict::NeedsReview => VerdictTarget::Gate,
        BuilderVerdict::Failed => VerdictTarget::Failed {
            failure: AttemptFailure::Verdict,
        },
    }
}

/// Map an Auditor recommendation.
pub fn auditor_target(recommendation: AuditorRecommendation) -> VerdictTarget {
    match recommendation {
        AuditorRecommendation::Approve => VerdictTarget::Complete,
        AuditorRecommendation::Revise => VerdictTarget::Executing {
            failure: AttemptFailure::RevisionRequested,
        },
        AuditorRecommendation::Escalate => VerdictTarget::Failed {
            failure: AttemptFailure::Escalated,
        },
    }
}

/// What processing a Builder result produced.
#[derive(Debug, Clone)]
pub struct BuilderProcessing {
    pub commit_ref: Option<String>,
    pub rejection: Option<ApplyRejection>,
    pub recorded: Vec<RecordedIssue>,
    pub target: VerdictTarget,
}

/// What processing an Auditor result produced.
#[derive(Debug, Clone)]
pub struct AuditorProcessing {
    pub commit_refs: Vec<String>,
    pub skipped: Vec<ApplyRejection>,
    pub recorded: Vec<RecordedIssue>,
    pub target: VerdictTarget,
}

/// Collaborators a processor needs for one call.
pub struct ProcessContext<'a> {
    pub tracker: &'a IssueTracker,
    pub apply: &'a GovernedApplyPath,
    pub integration_line: &'a str,
}

/// Handles Builder results.
pub struct BuilderProcessor;

impl BuilderProcessor {
    pub fn process(
        ctx: &ProcessContext<'_>,
        run: &mut Run,
        log: &mut IssueLog,
        phase_id: &str,
        result: &BuilderResult,
        applied: &mut Vec<String>,
    ) -> SupervisorResult<BuilderProcessing> {
        let mut recorded = Vec::with_capacity(result.suggested_issues.len());
        for issue in &result.suggested_issues {
            recorded.push(ctx.tracker.record(run, log, phase_id, issue.clone())?);
        }

        let mut commit_ref = None;
        let mut rejection = None;
        if let Some(patch) = result.patch_content.as_deref().filter(|p| !p.trim().is_empty()) {
            let message = result
                .commit_message
                .clone()
                .unwrap_or_else(|| format!("{}: builder patch", phase_id));
            let outcome = ctx
                .apply
                .apply_patch(patch, ctx.integration_line, &message)?;
            if outcome.success {
                applied.extend(outcome.commit_ref.iter().cloned());
                commit_ref = outcome.commit_ref;
            } else {
                rejection = outcome.rejection;
            }
        }

        let target = builder_target(result.verdict, rejection.as_ref());
        debug!(
            phase_id,
            verdict = %result.verdict,
            committed = commit_ref.is_some(),
            issues = recorded.len(),
            "Builder result processed"
        );
        Ok(BuilderProcessing {
            commit_ref,
            rejection,
            recorded,
            target,
        })
    }
}

/// Handles Auditor results.
pub struct AuditorProcessor;

impl AuditorProcessor {
    pub fn process(
        ctx: &ProcessContext<'_>,
        run: &mut Run,
        log: &mut IssueLog,
        phase_id: &str,
        result: &AuditorResult,
        applied: &mut Vec<String>,
    ) -> SupervisorResult<AuditorProcessing> {
        let mut recorded = Vec::with_capacity(result.issues_found.len());
        for issue in &result.issues_found {
            recorded.push(ctx.tracker.record(run, log, phase_id, issue.clone())?);
        }

        let mut commit_refs = Vec::new();
        let mut skipped = Vec::new();
        for (idx, patch) in result.suggested_patches.iter().enumerate() {
            let message = format!("{}: auditor patch {}", phase_id, idx + 1);
            let outcome = ctx
                .apply
                .apply_patch(patch, ctx.integration_line, &message)?;
            match (outcome.commit_ref, outcome.rejection) {
                (Some(commit_ref), _) if outcome.success => {
                    applied.push(commit_ref.clone());
                    commit_refs.push(commit_ref);
                }
                (_, Some(rejection)) => {
                    warn!(
                        phase_id,
                        patch = idx + 1,
                        reason = %rejection.message(),
                        "Skipping auditor patch"
                    );
                    skipped.push(rejection);
                }
                _ => {}
            }
        }

        let target = auditor_target(result.recommendation);
        debug!(
            phase_id,
            recommendation = %result.recommendation,
            applied = commit_refs.len(),
            skipped = skipped.len(),
            "Auditor result processed"
        );
        Ok(AuditorProcessing {
            commit_refs,
            skipped,
            recorded,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{InMemoryVcs, ProtectedPaths};
    use crate::issues::{IssueSource, Severity};
    use crate::testing::sample_run;
    use std::sync::Arc;

    const PATCH: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n";
    const PROTECTED: &str = "--- a/secrets/k\n+++ b/secrets/k\n@@ -1 +1 @@\n-a\n+b\n";

    fn apply_path() -> GovernedApplyPath {
        GovernedApplyPath::new(
            Arc::new(InMemoryVcs::new()),
            Arc::new(ProtectedPaths::new(["secrets"])),
        )
    }

    #[test]
    fn test_builder_verdict_mapping() {
        assert_eq!(builder_target(BuilderVerdict::Success, None), VerdictTarget::Complete);
        assert_eq!(builder_target(BuilderVerdict::NeedsReview, None), VerdictTarget::Gate);
        assert!(matches!(
            builder_target(BuilderVerdict::Failed, None),
            VerdictTarget::Failed { failure: AttemptFailure::Verdict }
        ));
    }

    #[test]
    fn test_rejected_patch_overrides_success() {
        let rejection = ApplyRejection::ProtectedPath {
            paths: vec!["secrets/k".into()],
        };
        assert!(matches!(
            builder_target(BuilderVerdict::Success, Some(&rejection)),
            VerdictTarget::Failed {
                failure: AttemptFailure::PatchRejected { .. }
            }
        ));
    }

    #[test]
    fn test_auditor_mapping() {
        assert_eq!(auditor_target(AuditorRecommendation::Approve), VerdictTarget::Complete);
        assert!(matches!(
            auditor_target(AuditorRecommendation::Revise),
            VerdictTarget::Executing { .. }
        ));
        assert!(matches!(
            auditor_target(AuditorRecommendation::Escalate),
            VerdictTarget::Failed { failure: AttemptFailure::Escalated }
        ));
    }

    #[test]
    fn test_builder_process_records_and_commits() {
        let apply = apply_path();
        let tracker = IssueTracker;
        let ctx = ProcessContext {
            tracker: &tracker,
            apply: &apply,
            integration_line: "supervisor/r1",
        };
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        let mut log = IssueLog::new();
        let result = BuilderResult::new(BuilderVerdict::Success)
            .with_patch(PATCH)
            .with_issue(IssueReport::new(
                "style",
                Severity::Minor,
                IssueSource::Builder,
                "lint",
            ));

        let mut applied = Vec::new();
        let out =
            BuilderProcessor::process(&ctx, &mut run, &mut log, "p1", &result, &mut applied)
                .unwrap();
        assert!(out.commit_ref.is_some());
        assert_eq!(applied, out.commit_ref.iter().cloned().collect::<Vec<_>>());
        assert_eq!(out.recorded.len(), 1);
        assert_eq!(out.target, VerdictTarget::Complete);
        assert_eq!(run.minor_issues_count, 1);
    }

    #[test]
    fn test_auditor_skips_rejected_patch() {
        let apply = apply_path();
        let tracker = IssueTracker;
        let ctx = ProcessContext {
            tracker: &tracker,
            apply: &apply,
            integration_line: "supervisor/r1",
        };
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        let mut log = IssueLog::new();
        let result = AuditorResult::new(AuditorRecommendation::Approve)
            .with_patch(PROTECTED)
            .with_patch(PATCH);

        let mut applied = Vec::new();
        let out =
            AuditorProcessor::process(&ctx, &mut run, &mut log, "p1", &result, &mut applied)
                .unwrap();
        assert_eq!(out.commit_refs.len(), 1);
        assert_eq!(applied, out.commit_refs);
        assert_eq!(out.skipped.len(), 1);
        assert!(out.skipped[0].is_policy_violation());
        assert_eq!(out.target, VerdictTarget::Complete);
    }

    #[test]
    fn test_verdict_parse_is_exact() {
        assert_eq!("needs_review".parse::<BuilderVerdict>().unwrap(), BuilderVerdict::NeedsReview);
        assert!("Success".parse::<BuilderVerdict>().is_err());
        assert!("approved".parse::<AuditorRecommendation>().is_err());
    }
}
