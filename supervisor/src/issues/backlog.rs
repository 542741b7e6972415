//! Project-level issue backlog shared by every run.
//!
//! Tracks how long an issue key has been around across runs and tiers. This
//! is the only state runs share, so every access goes through one mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::info;

use super::{push_unique, BacklogSighting, Severity};
use crate::config::AgingPolicy;
use crate::error::{SupervisorError, SupervisorResult};

/// Backlog status. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogStatus {
    #[default]
    Open,
    NeedsCleanup,
}

/// Cross-run record for one issue key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub issue_key: String,
    /// Worst severity ever seen
    pub severity: Severity,
    pub category: String,
    pub status: BacklogStatus,
    pub first_seen_run: String,
    pub last_seen_run: String,
    pub occurrence_count: u32,
    /// Distinct runs this key was seen in
    pub age_in_runs: u32,
    /// Distinct (run, tier) contexts this key was seen in
    pub age_in_tiers: u32,
    pub evidence_refs: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    seen_runs: BTreeSet<String>,
    seen_contexts: BTreeSet<(String, String)>,
}

impl BacklogEntry {
    fn first(sighting: &BacklogSighting, now: DateTime<Utc>) -> Self {
        Self {
            issue_key: sighting.issue_key.clone(),
            severity: sighting.severity,
            category: sighting.category.clone(),
            status: BacklogStatus::Open,
            first_seen_run: sighting.run_id.clone(),
            last_seen_run: sighting.run_id.clone(),
            occurrence_count: 1,
            age_in_runs: 1,
            age_in_tiers: 1,
            evidence_refs: sighting.evidence_refs.clone(),
            first_seen_at: now,
            last_seen_at: now,
            seen_runs: BTreeSet::from([sighting.run_id.clone()]),
            seen_contexts: BTreeSet::from([(sighting.run_id.clone(), sighting.tier_id.clone())]),
        }
    }

    fn observe(&mut self, sighting: &BacklogSighting, now: DateTime<Utc>) {
        self.occurrence_count += 1;
        self.severity = self.severity.max(sighting.severity);
        self.category = sighting.category.clone();
        self.last_seen_run = sighting.run_id.clone();
        self.last_seen_at = now;
        push_unique(&mut self.evidence_refs, &sighting.evidence_refs);

        if self.seen_runs.insert(sighting.run_id.clone()) {
            self.age_in_runs += 1;
        }
        if self
            .seen_contexts
            .insert((sighting.run_id.clone(), sighting.tier_id.clone()))
        {
            self.age_in_tiers += 1;
        }
    }

    fn apply_aging(&mut self, policy: &AgingPolicy) -> bool {
        if self.status == BacklogStatus::NeedsCleanup {
            return false;
        }
        let runs_hit = policy.runs_threshold.is_some_and(|t| self.age_in_runs >= t);
        let tiers_hit = policy
            .tiers_threshold
            .is_some_and(|t| self.age_in_tiers >= t);
        if runs_hit || tiers_hit {
            self.status = BacklogStatus::NeedsCleanup;
            return true;
        }
        false
    }
}

/// Aggregate view over the backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSummary {
    pub total: usize,
    pub open: usize,
    pub needs_cleanup: usize,
    pub minor: usize,
    pub major: usize,
    /// Oldest entries by `age_in_runs`, then occurrence count
    pub oldest: Vec<BacklogEntry>,
}

/// Concurrent-safe project backlog.
#[derive(Debug, Default)]
pub struct ProjectBacklog {
    entries: Mutex<HashMap<String, BacklogEntry>>,
    policy: AgingPolicy,
}

impl ProjectBacklog {
    pub fn new(policy: AgingPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn lock(&self) -> SupervisorResult<std::sync::MutexGuard<'_, HashMap<String, BacklogEntry>>> {
        self.entries.lock().map_err(|_| SupervisorError::LockPoisoned {
            what: "project backlog",
        })
    }

    /// Record one sighting and return the updated entry.
    pub fn observe(&self, sighting: &BacklogSighting) -> SupervisorResult<BacklogEntry> {
        let mut entries = self.lock()?;
        Ok(self.observe_locked(&mut entries, sighting, Utc::now()))
    }

    /// Apply a staged batch under a single lock acquisition.
    pub fn observe_all(&self, sightings: &[BacklogSighting]) -> SupervisorResult<Vec<BacklogEntry>> {
        if sightings.is_empty() {
            return Ok(Vec::new());
        }
        let mut entries = self.lock()?;
        let now = Utc::now();
        Ok(sightings
            .iter()
            .map(|s| self.observe_locked(&mut entries, s, now))
            .collect())
    }

    fn observe_locked(
        &self,
        entries: &mut HashMap<String, BacklogEntry>,
        sighting: &BacklogSighting,
        now: DateTime<Utc>,
    ) -> BacklogEntry {
        let entry = entries
            .entry(sighting.issue_key.clone())
            .and_modify(|e| e.observe(sighting, now))
            .or_insert_with(|| BacklogEntry::first(sighting, now));

        if entry.apply_aging(&self.policy) {
            info!(
                issue_key = %entry.issue_key,
                age_in_runs = entry.age_in_runs,
                age_in_tiers = entry.age_in_tiers,
                "Backlog entry needs cleanup"
            );
        }
        entry.clone()
    }

    pub fn get(&self, issue_key: &str) -> SupervisorResult<Option<BacklogEntry>> {
        Ok(self.lock()?.get(issue_key).cloned())
    }

    pub fn len(&self) -> SupervisorResult<usize> {
        Ok(self.lock()?.len())
    }

    pub fn summary(&self, oldest_limit: usize) -> SupervisorResult<BacklogSummary> {
        let entries = self.lock()?;
        let mut summary = BacklogSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.status {
                BacklogStatus::Open => summary.open += 1,
                BacklogStatus::NeedsCleanup => summary.needs_cleanup += 1,
            }
            match entry.severity {
                Severity::Minor => summary.minor += 1,
                Severity::Major => summary.major += 1,
            }
        }

        let mut oldest: Vec<&BacklogEntry> = entries.values().collect();
        oldest.sort_by(|a, b| {
            b.age_in_runs
                .cmp(&a.age_in_runs)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
                .then(a.issue_key.cmp(&b.issue_key))
        });
        summary.oldest = oldest.into_iter().take(oldest_limit).cloned().collect();
        Ok(summary)
    }
}
