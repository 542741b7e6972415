//! Phase, tier and run controllers.
//!
//! Controllers mutate a [`RunTxn`]: a staged copy of one run's record plus
//! the backlog sightings and events the mutation produced. The supervisor
//! commits the copy back only if the whole operation succeeded, then flushes
//! sightings and events.

pub mod phase;
pub mod run;
pub mod tier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SupervisorEvent;
use crate::issues::{BacklogSighting, IssueLog, RecordedIssue};
use crate::model::Run;

pub use phase::{CiOutcome, PhaseController, PhaseCounters};
pub use run::RunController;
pub use tier::TierController;

/// Everything the supervisor keeps for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: Run,
    pub issues: IssueLog,
}

/// A staged mutation of one run.
#[derive(Debug)]
pub struct RunTxn {
    pub run: Run,
    pub issues: IssueLog,
    pub sightings: Vec<BacklogSighting>,
    pub events: Vec<SupervisorEvent>,
    /// Commits the backend made during this mutation, noted as they land.
    /// They survive even if the rest of the mutation is rolled back.
    pub applied: Vec<String>,
    pub now: DateTime<Utc>,
}

impl RunTxn {
    pub fn begin(record: &RunRecord, now: DateTime<Utc>) -> Self {
        Self {
            run: record.run.clone(),
            issues: record.issues.clone(),
            sightings: Vec::new(),
            events: Vec::new(),
            applied: Vec::new(),
            now,
        }
    }

    /// Stage the backlog sighting and event for a recorded issue.
    pub fn note_issue(&mut self, recorded: &RecordedIssue) {
        self.events.push(SupervisorEvent::IssueRecorded {
            run_id: self.run.run_id.clone(),
            phase_id: recorded.phase_entry.phase_id.clone(),
            issue_key: recorded.phase_entry.issue_key.clone(),
            severity: recorded.phase_entry.severity,
            timestamp: self.now,
        });
        self.sightings.push(recorded.sighting.clone());
    }

    /// Split into the record to commit and the side effects to flush.
    pub fn into_parts(self) -> (RunRecord, Vec<BacklogSighting>, Vec<SupervisorEvent>) {
        (
            RunRecord {
                run: self.run,
                issues: self.issues,
            },
            self.sightings,
            self.events,
        )
    }
}
