//! Append-only per-run issue log with phase and key indices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{
    push_unique, IssueEvent, IssueReport, IssueScope, PhaseIssueEntry, RunIndexEntry, Severity,
};

/// Every issue ever reported in one run, in arrival order.
///
/// Events are never removed or edited. `by_phase` and `by_key` hold
/// positions into `events`; only the events are serialized and the indices
/// are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<IssueEvent>", into = "Vec<IssueEvent>")]
pub struct IssueLog {
    events: Vec<IssueEvent>,
    by_phase: HashMap<String, Vec<usize>>,
    by_key: HashMap<String, Vec<usize>>,
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log (and its indices) from stored events.
    pub fn from_events(events: Vec<IssueEvent>) -> Self {
        let mut log = Self::default();
        for event in events {
            log.push_event(event);
        }
        log
    }

    pub fn append(
        &mut self,
        scope: IssueScope,
        report: IssueReport,
        at: DateTime<Utc>,
    ) -> &IssueEvent {
        let event = IssueEvent {
            seq: self.events.len() as u64,
            scope,
            report,
            at,
        };
        let pos = self.push_event(event);
        &self.events[pos]
    }

    fn push_event(&mut self, event: IssueEvent) -> usize {
        let pos = self.events.len();
        self.by_phase
            .entry(event.scope.phase_id.clone())
            .or_default()
            .push(pos);
        self.by_key
            .entry(event.report.issue_key.clone())
            .or_default()
            .push(pos);
        self.events.push(event);
        pos
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[IssueEvent] {
        &self.events
    }

    fn phase_events<'a>(&'a self, phase_id: &str) -> impl Iterator<Item = &'a IssueEvent> + 'a {
        self.by_phase
            .get(phase_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.events[i])
    }

    fn key_events<'a>(&'a self, issue_key: &str) -> impl Iterator<Item = &'a IssueEvent> + 'a {
        self.by_key
            .get(issue_key)
            .into_iter()
            .flatten()
            .map(move |&i| &self.events[i])
    }

    /// Phase-local entry for one key, folded from every report of it.
    pub fn phase_entry(&self, phase_id: &str, issue_key: &str) -> Option<PhaseIssueEntry> {
        let mut entry: Option<PhaseIssueEntry> = None;
        for event in self
            .phase_events(phase_id)
            .filter(|e| e.report.issue_key == issue_key)
        {
            match entry.as_mut() {
                None => {
                    entry = Some(PhaseIssueEntry {
                        phase_id: phase_id.to_string(),
                        issue_key: issue_key.to_string(),
                        severity: event.report.severity,
                        category: event.report.category.clone(),
                        sources: vec![event.report.source],
                        evidence_refs: event.report.evidence_refs.clone(),
                        occurrences: 1,
                        first_recorded_at: event.at,
                        last_recorded_at: event.at,
                    })
                }
                Some(e) => {
                    e.severity = e.severity.max(event.report.severity);
                    e.category = event.report.category.clone();
                    push_unique(&mut e.sources, &[event.report.source]);
                    push_unique(&mut e.evidence_refs, &event.report.evidence_refs);
                    e.occurrences += 1;
                    e.last_recorded_at = event.at;
                }
            }
        }
        entry
    }

    /// Every distinct key recorded against a phase.
    pub fn phase_entries(&self, phase_id: &str) -> Vec<PhaseIssueEntry> {
        let mut keys: Vec<&str> = Vec::new();
        for event in self.phase_events(phase_id) {
            if !keys.contains(&event.report.issue_key.as_str()) {
                keys.push(&event.report.issue_key);
            }
        }
        keys.into_iter()
            .filter_map(|key| self.phase_entry(phase_id, key))
            .collect()
    }

    /// The run-level dedup entry for a key.
    pub fn run_entry(&self, run_id: &str, issue_key: &str) -> Option<RunIndexEntry> {
        let mut entry: Option<RunIndexEntry> = None;
        for event in self.key_events(issue_key) {
            match entry.as_mut() {
                None => {
                    entry = Some(RunIndexEntry {
                        run_id: run_id.to_string(),
                        issue_key: issue_key.to_string(),
                        severity: event.report.severity,
                        category: event.report.category.clone(),
                        phase_ids: vec![event.scope.phase_id.clone()],
                        tier_ids: vec![event.scope.tier_id.clone()],
                        evidence_refs: event.report.evidence_refs.clone(),
                        occurrences: 1,
                        first_recorded_at: event.at,
                        last_recorded_at: event.at,
                    })
                }
                Some(e) => {
                    e.severity = e.severity.max(event.report.severity);
                    e.category = event.report.category.clone();
                    push_unique(&mut e.phase_ids, &[event.scope.phase_id.clone()]);
                    push_unique(&mut e.tier_ids, &[event.scope.tier_id.clone()]);
                    push_unique(&mut e.evidence_refs, &event.report.evidence_refs);
                    e.occurrences += 1;
                    e.last_recorded_at = event.at;
                }
            }
        }
        entry
    }

    /// One entry per distinct key across the whole run, in first-seen order.
    pub fn run_index(&self, run_id: &str) -> Vec<RunIndexEntry> {
        let mut keys: Vec<&str> = Vec::new();
        for event in &self.events {
            if !keys.contains(&event.report.issue_key.as_str()) {
                keys.push(&event.report.issue_key);
            }
        }
        keys.into_iter()
            .filter_map(|key| self.run_entry(run_id, key))
            .collect()
    }

    /// `(minor, major)` counts for a phase: each key counted once at its
    /// worst severity.
    pub fn phase_counts(&self, phase_id: &str) -> (u32, u32) {
        let mut worst: HashMap<&str, Severity> = HashMap::new();
        for event in self.phase_events(phase_id) {
            let slot = worst
                .entry(event.report.issue_key.as_str())
                .or_insert(event.report.severity);
            *slot = (*slot).max(event.report.severity);
        }
        worst.values().fold((0, 0), |(minor, major), sev| match sev {
            Severity::Minor => (minor + 1, major),
            Severity::Major => (minor, major + 1),
        })
    }

    /// Whether anything was ever recorded against the tier.
    pub fn tier_has_issues(&self, tier_id: &str) -> bool {
        self.events.iter().any(|e| e.scope.tier_id == tier_id)
    }
}

impl From<Vec<IssueEvent>> for IssueLog {
    fn from(events: Vec<IssueEvent>) -> Self {
        IssueLog::from_events(events)
    }
}

impl From<IssueLog> for Vec<IssueEvent> {
    fn from(log: IssueLog) -> Self {
        log.events
    }
}
