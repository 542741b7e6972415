//! Issue recording and aggregate derivation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BacklogSighting, IssueLog, IssueReport, IssueScope, PhaseIssueEntry, RunIndexEntry};
use crate::error::{SupervisorError, SupervisorResult};
use crate::model::{Cleanliness, IssueState, Run};

/// Phase and run views of a freshly recorded issue, plus the sighting the
/// project backlog must absorb once the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedIssue {
    pub phase_entry: PhaseIssueEntry,
    pub run_entry: RunIndexEntry,
    pub sighting: BacklogSighting,
}

/// Records issues into a run's log and re-derives every counter from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct IssueTracker;

impl IssueTracker {
    /// Record one issue against `phase_id`.
    ///
    /// Fails with `ScopeNotFound` before touching anything when the phase or
    /// its owning tier cannot be resolved.
    pub fn record(
        &self,
        run: &mut Run,
        log: &mut IssueLog,
        phase_id: &str,
        report: IssueReport,
    ) -> SupervisorResult<RecordedIssue> {
        if report.issue_key.trim().is_empty() {
            return Err(SupervisorError::validation("issue_key must not be empty"));
        }

        let scope = resolve_scope(run, phase_id)?;
        let now = Utc::now();
        log.append(scope.clone(), report.clone(), now);
        self.recompute_counts(run, log);

        let phase_entry = log.phase_entry(phase_id, &report.issue_key);
        let run_entry = log.run_entry(&run.run_id, &report.issue_key);
        let (Some(phase_entry), Some(run_entry)) = (phase_entry, run_entry) else {
            return Err(SupervisorError::ScopeNotFound {
                run_id: scope.run_id,
                phase_id: scope.phase_id,
            });
        };

        debug!(
            run_id = %scope.run_id,
            tier_id = %scope.tier_id,
            phase_id = %scope.phase_id,
            issue_key = %report.issue_key,
            severity = %report.severity,
            occurrences = run_entry.occurrences,
            "Issue recorded"
        );

        Ok(RecordedIssue {
            sighting: BacklogSighting {
                run_id: scope.run_id,
                tier_id: scope.tier_id,
                issue_key: report.issue_key,
                severity: report.severity,
                category: report.category,
                evidence_refs: report.evidence_refs,
            },
            phase_entry,
            run_entry,
        })
    }

    /// Re-derive phase, tier and run issue counters and tier cleanliness
    /// from the log. Counters are always overwritten, never incremented.
    pub fn recompute_counts(&self, run: &mut Run, log: &IssueLog) {
        for phase in &mut run.phases {
            let (minor, major) = log.phase_counts(&phase.phase_id);
            phase.minor_issues_count = minor;
            phase.major_issues_count = major;
            phase.issue_state = IssueState::from_counts(minor, major);
        }

        for tier in &mut run.tiers {
            let (minor, major) = run
                .phases
                .iter()
                .filter(|p| p.tier_id == tier.tier_id)
                .fold((0, 0), |(mi, ma), p| {
                    (mi + p.minor_issues_count, ma + p.major_issues_count)
                });
            tier.minor_issues_count = minor;
            tier.major_issues_count = major;
            if log.tier_has_issues(&tier.tier_id) {
                tier.cleanliness = Cleanliness::NotClean;
            }
        }

        let (minor, major) = run.phases.iter().fold((0, 0), |(mi, ma), p| {
            (mi + p.minor_issues_count, ma + p.major_issues_count)
        });
        run.minor_issues_count = minor;
        run.major_issues_count = major;
    }
}

fn resolve_scope(run: &Run, phase_id: &str) -> SupervisorResult<IssueScope> {
    let scope_not_found = || SupervisorError::ScopeNotFound {
        run_id: run.run_id.clone(),
        phase_id: phase_id.to_string(),
    };
    let phase = run.phase(phase_id).ok_or_else(scope_not_found)?;
    let tier = run.tier(&phase.tier_id).ok_or_else(scope_not_found)?;
    if !tier.phase_ids.iter().any(|id| id == phase_id) {
        return Err(scope_not_found());
    }
    Ok(IssueScope {
        run_id: run.run_id.clone(),
        tier_id: tier.tier_id.clone(),
        phase_id: phase.phase_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::{IssueSource, Severity};
    use crate::testing::sample_run;

    #[test]
    fn test_record_aggregates_upward() {
        let mut run = sample_run("r1", &[("t1", vec!["p1", "p2"]), ("t2", vec!["p3"])]);
        let mut log = IssueLog::new();
        let tracker = IssueTracker;

        for key in ["k1", "k2"] {
            tracker
                .record(
                    &mut run,
                    &mut log,
                    "p1",
                    IssueReport::new(key, Severity::Minor, IssueSource::Builder, "lint"),
                )
                .unwrap();
        }
        tracker
            .record(
                &mut run,
                &mut log,
                "p3",
                IssueReport::new("k3", Severity::Major, IssueSource::Auditor, "logic"),
            )
            .unwrap();

        assert_eq!(run.phase("p1").unwrap().minor_issues_count, 2);
        assert_eq!(run.phase("p1").unwrap().issue_state, IssueState::HasMinorIssues);
        assert_eq!(run.phase("p2").unwrap().minor_issues_count, 0);
        assert_eq!(run.tier("t1").unwrap().minor_issues_count, 2);
        assert_eq!(run.tier("t1").unwrap().cleanliness, Cleanliness::NotClean);
        assert_eq!(run.tier("t2").unwrap().major_issues_count, 1);
        assert_eq!(run.minor_issues_count, 2);
        assert_eq!(run.major_issues_count, 1);
    }

    #[test]
    fn test_repeat_key_updates_evidence() {
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        let mut log = IssueLog::new();
        let tracker = IssueTracker;
        let report = IssueReport::new("k1", Severity::Minor, IssueSource::Builder, "lint");

        tracker
            .record(&mut run, &mut log, "p1", report.clone().with_evidence("a"))
            .unwrap();
        let second = tracker
            .record(&mut run, &mut log, "p1", report.with_evidence("b"))
            .unwrap();

        assert_eq!(second.run_entry.evidence_refs, vec!["a", "b"]);
        assert_eq!(second.run_entry.occurrences, 2);
        assert_eq!(run.minor_issues_count, 1);
    }

    #[test]
    fn test_unknown_phase_is_scope_not_found_without_write() {
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        let mut log = IssueLog::new();
        let err = IssueTracker
            .record(
                &mut run,
                &mut log,
                "p9",
                IssueReport::new("k1", Severity::Minor, IssueSource::Builder, "lint"),
            )
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ScopeNotFound { .. }));
        assert!(log.is_empty());
        assert_eq!(run.minor_issues_count, 0);
    }

    #[test]
    fn test_orphaned_tier_is_scope_not_found() {
        let mut run = sample_run("r1", &[("t1", vec!["p1"])]);
        run.phases[0].tier_id = "ghost".into();
        let mut log = IssueLog::new();
        let err = IssueTracker
            .record(
                &mut run,
                &mut log,
                "p1",
                IssueReport::new("k1", Severity::Minor, IssueSource::Builder, "lint"),
            )
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ScopeNotFound { .. }));
        assert!(log.is_empty());
    }
}
