//! Supervisor boundary service.
//!
//! Owns the run registry and the collaborators every operation needs. Each
//! mutating call locks one run, stages the change in a [`RunTxn`],
//! reconciles derived state, and commits only if everything succeeded.
//! Backlog sightings, events and summary artifacts are flushed after the
//! commit. Runs are independent; only the project backlog is shared.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::apply::{
    GovernedApplyPath, InMemoryVcs, ProtectedPathPolicy, ProtectedPaths, VersionControl,
};
use crate::budget::BudgetManager;
use crate::config::SupervisorConfig;
use crate::controller::{
    CiOutcome, PhaseController, PhaseCounters, RunController, RunRecord, RunTxn,
};
use crate::diagnostics::{ContextRetriever, DiagnosticsEscalationEngine};
use crate::error::{SupervisorError, SupervisorResult};
use crate::events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, SupervisorEvent};
use crate::issues::{
    BacklogEntry, BacklogSummary, IssueReport, IssueTracker, PhaseIssueEntry, ProjectBacklog,
    RunIndexEntry,
};
use crate::metrics::{BudgetAnalysis, IntegrationStatus, RunMetrics, RunSummary, TierMetrics};
use crate::model::{PhaseSpec, PhaseState, Run, RunConfig, RunState, TierSpec};
use crate::processors::{AuditorResult, BuilderResult};
use crate::summary::{JsonSummaryWriter, SummaryWriter};

/// Oldest entries listed by `issue_backlog_summary`.
const BACKLOG_OLDEST_LIMIT: usize = 10;

type RunHandle = Arc<Mutex<RunRecord>>;

/// The three views returned by `record_issue`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IssueRecordOutcome {
    pub phase_entry: PhaseIssueEntry,
    pub run_entry: RunIndexEntry,
    pub backlog_entry: BacklogEntry,
}

/// What a committed mutation hands back to the boundary method.
struct Committed<T> {
    value: T,
    phase_state: PhaseState,
    backlog: Vec<BacklogEntry>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    runs: Mutex<HashMap<String, RunHandle>>,
    budget: BudgetManager,
    diagnostics: DiagnosticsEscalationEngine,
    tracker: IssueTracker,
    apply: GovernedApplyPath,
    retriever: Option<Arc<dyn ContextRetriever>>,
    summaries: Option<Arc<dyn SummaryWriter>>,
    events: SharedEventBus,
    backlog: Arc<ProjectBacklog>,
}

impl Supervisor {
    /// Build a supervisor over the given version-control backend and
    /// protected-path policy. A configured `summary_root` enables JSON
    /// summary artifacts.
    pub fn new(
        config: SupervisorConfig,
        vcs: Arc<dyn VersionControl>,
        policy: Arc<dyn ProtectedPathPolicy>,
    ) -> SupervisorResult<Self> {
        config.validate()?;
        let summaries = config
            .summary_root
            .as_ref()
            .map(|root| Arc::new(JsonSummaryWriter::new(root)) as Arc<dyn SummaryWriter>);
        Ok(Self {
            budget: BudgetManager::new(config.budget.clone()),
            diagnostics: DiagnosticsEscalationEngine::new(config.diagnostics.clone()),
            backlog: Arc::new(ProjectBacklog::new(config.aging.clone())),
            tracker: IssueTracker,
            apply: GovernedApplyPath::new(vcs, policy),
            runs: Mutex::new(HashMap::new()),
            retriever: None,
            summaries,
            events: EventBus::new().shared(),
            config,
        })
    }

    /// Supervisor over an in-memory integration line.
    pub fn in_memory(
        config: SupervisorConfig,
        protected: impl IntoIterator<Item = impl Into<String>>,
    ) -> SupervisorResult<Self> {
        Self::new(
            config,
            Arc::new(InMemoryVcs::new()),
            Arc::new(ProtectedPaths::new(protected)),
        )
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_summary_writer(mut self, writer: Arc<dyn SummaryWriter>) -> Self {
        self.summaries = Some(writer);
        self
    }

    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    /// Share a project backlog with other supervisors.
    pub fn with_backlog(mut self, backlog: Arc<ProjectBacklog>) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn backlog(&self) -> &Arc<ProjectBacklog> {
        &self.backlog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Events of one run only.
    pub fn subscribe_run(&self, run_id: &str) -> FilteredReceiver {
        FilteredReceiver::new(self.events.subscribe(), EventFilter::new().run(run_id))
    }

    fn run_controller(&self) -> RunController<'_> {
        RunController {
            config: &self.config,
            budget: &self.budget,
            tracker: &self.tracker,
        }
    }

    fn phase_controller(&self) -> PhaseController<'_> {
        PhaseController {
            budget: &self.budget,
            diagnostics: &self.diagnostics,
            retriever: self.retriever.as_deref(),
            tracker: &self.tracker,
            apply: &self.apply,
        }
    }

    fn registry(&self) -> SupervisorResult<MutexGuard<'_, HashMap<String, RunHandle>>> {
        self.runs.lock().map_err(|_| SupervisorError::LockPoisoned {
            what: "run registry",
        })
    }

    fn handle(&self, run_id: &str) -> SupervisorResult<RunHandle> {
        self.registry()?
            .get(run_id)
            .cloned()
            .ok_or_else(|| SupervisorError::run_not_found(run_id))
    }

    fn lock_run(handle: &RunHandle) -> SupervisorResult<MutexGuard<'_, RunRecord>> {
        handle
            .lock()
            .map_err(|_| SupervisorError::LockPoisoned { what: "run record" })
    }

    fn snapshot(&self, run_id: &str) -> SupervisorResult<RunRecord> {
        let handle = self.handle(run_id)?;
        let record = Self::lock_run(&handle)?;
        Ok(record.clone())
    }

    fn all_runs(&self) -> SupervisorResult<Vec<Run>> {
        let handles: Vec<RunHandle> = self.registry()?.values().cloned().collect();
        handles
            .iter()
            .map(|h| Self::lock_run(h).map(|r| r.run.clone()))
            .collect()
    }

    /// Write summary artifacts, counting failures on the run.
    fn write_summaries(&self, run: &mut Run) {
        let Some(writer) = &self.summaries else {
            return;
        };
        if let Err(e) = writer.write_all(run) {
            run.summary_write_failures += 1;
            warn!(
                run_id = %run.run_id,
                failures = run.summary_write_failures,
                error = %e,
                "Summary write failed"
            );
        }
    }

    /// Stage, reconcile and commit one mutation of a phase. Unknown phase
    /// ids fail with `PhaseNotFound` before anything runs.
    fn mutate<T>(
        &self,
        run_id: &str,
        phase_id: &str,
        op: impl FnOnce(&mut RunTxn) -> SupervisorResult<T>,
    ) -> SupervisorResult<Committed<T>> {
        self.mutate_with(run_id, phase_id, |txn| {
            if txn.run.phase(phase_id).is_none() {
                return Err(SupervisorError::phase_not_found(run_id, phase_id));
            }
            op(txn)
        })
    }

    /// Stage, reconcile and commit one mutation of a run. The operation is
    /// responsible for resolving `phase_id`.
    fn mutate_with<T>(
        &self,
        run_id: &str,
        phase_id: &str,
        op: impl FnOnce(&mut RunTxn) -> SupervisorResult<T>,
    ) -> SupervisorResult<Committed<T>> {
        let handle = self.handle(run_id)?;
        let mut record = Self::lock_run(&handle)?;
        if record.run.is_terminal() {
            return Err(SupervisorError::RunTerminal {
                run_id: run_id.to_string(),
                state: record.run.state.to_string(),
            });
        }

        let mut txn = RunTxn::begin(&record, Utc::now());
        let staged = op(&mut txn).and_then(|value| {
            self.run_controller().reconcile(&mut txn)?;
            Ok(value)
        });
        let value = match staged {
            Ok(value) => value,
            Err(e) => {
                self.keep_applied_commits(&mut record, phase_id, &txn.applied);
                return Err(e);
            }
        };

        let (committed, sightings, events) = txn.into_parts();
        *record = committed;
        let phase_state = record
            .run
            .phase(phase_id)
            .map(|p| p.state)
            .ok_or_else(|| SupervisorError::phase_not_found(run_id, phase_id))?;

        let backlog = self.backlog.observe_all(&sightings)?;
        self.events.publish_all(events);
        self.write_summaries(&mut record.run);

        debug!(run_id, phase_id, phase_state = %phase_state, "Run mutation committed");
        Ok(Committed {
            value,
            phase_state,
            backlog,
        })
    }

    /// A failed mutation is discarded, but commits the backend already made
    /// cannot be undone. Record them on the phase so the run still matches
    /// its integration line.
    fn keep_applied_commits(&self, record: &mut RunRecord, phase_id: &str, applied: &[String]) {
        if applied.is_empty() {
            return;
        }
        let run_id = record.run.run_id.clone();
        let Some(phase) = record.run.phase_mut(phase_id) else {
            warn!(%run_id, phase_id, commits = ?applied, "Commits landed for an unknown phase");
            return;
        };
        phase.commits.extend(applied.iter().cloned());
        warn!(
            %run_id,
            phase_id,
            commits = applied.len(),
            "Mutation failed after commit; keeping applied commits"
        );

        let now = Utc::now();
        self.events
            .publish_all(applied.iter().map(|commit_ref| SupervisorEvent::PatchApplied {
                run_id: run_id.clone(),
                phase_id: phase_id.to_string(),
                commit_ref: commit_ref.clone(),
                timestamp: now,
            }));
        self.write_summaries(&mut record.run);
    }

    /// `StartRun`: register a run and open its integration line.
    pub fn start_run(
        &self,
        run_config: RunConfig,
        tiers: Vec<TierSpec>,
        phases: Vec<PhaseSpec>,
    ) -> SupervisorResult<Run> {
        let mut run = self
            .run_controller()
            .build_run(run_config, tiers, phases, Utc::now())?;

        let mut registry = self.registry()?;
        if registry.contains_key(&run.run_id) {
            return Err(SupervisorError::RunAlreadyExists { run_id: run.run_id });
        }
        self.apply.open_line(&run.integration_line)?;
        self.write_summaries(&mut run);

        registry.insert(
            run.run_id.clone(),
            Arc::new(Mutex::new(RunRecord {
                run: run.clone(),
                issues: Default::default(),
            })),
        );
        drop(registry);

        info!(
            run_id = %run.run_id,
            tiers = run.tiers.len(),
            phases = run.phases.len(),
            line = %run.integration_line,
            "Run started"
        );
        self.events.publish(SupervisorEvent::RunStarted {
            run_id: run.run_id.clone(),
            tiers: run.tiers.len(),
            phases: run.phases.len(),
            timestamp: run.created_at,
        });
        Ok(run)
    }

    /// `GetRun`: the run with nested tiers and phases.
    pub fn get_run(&self, run_id: &str) -> SupervisorResult<Run> {
        Ok(self.snapshot(run_id)?.run)
    }

    /// `UpdatePhaseStatus`
    pub fn update_phase_status(
        &self,
        run_id: &str,
        phase_id: &str,
        new_state: &str,
        counters: PhaseCounters,
    ) -> SupervisorResult<PhaseState> {
        let committed = self.mutate(run_id, phase_id, |txn| {
            self.phase_controller()
                .update_status(txn, phase_id, new_state, counters)
        })?;
        Ok(committed.phase_state)
    }

    /// `RecordIssue`
    pub fn record_issue(
        &self,
        run_id: &str,
        phase_id: &str,
        report: IssueReport,
    ) -> SupervisorResult<IssueRecordOutcome> {
        // The tracker resolves the scope and reports `ScopeNotFound`.
        let committed = self.mutate_with(run_id, phase_id, |txn| {
            let recorded = self
                .tracker
                .record(&mut txn.run, &mut txn.issues, phase_id, report)?;
            txn.note_issue(&recorded);
            Ok(recorded)
        })?;

        let issue_key = committed.value.phase_entry.issue_key.clone();
        let backlog_entry = match committed.backlog.into_iter().last() {
            Some(entry) => entry,
            None => self
                .backlog
                .get(&issue_key)?
                .ok_or_else(|| SupervisorError::validation("issue missing from backlog"))?,
        };
        // Re-read so later issues in the same run are reflected.
        let record = self.snapshot(run_id)?;
        let run_entry = record
            .issues
            .run_entry(run_id, &issue_key)
            .unwrap_or(committed.value.run_entry);

        Ok(IssueRecordOutcome {
            phase_entry: committed.value.phase_entry,
            run_entry,
            backlog_entry,
        })
    }

    /// `SubmitBuilderResult`: returns the commit (if any) and the phase
    /// state after reconciliation.
    pub fn submit_builder_result(
        &self,
        run_id: &str,
        phase_id: &str,
        result: &BuilderResult,
    ) -> SupervisorResult<(Option<String>, PhaseState)> {
        let committed = self.mutate(run_id, phase_id, |txn| {
            self.phase_controller().submit_builder(txn, phase_id, result)
        })?;
        Ok((committed.value.0, committed.phase_state))
    }

    /// `SubmitAuditorResult`: returns the applied commits and the phase
    /// state after reconciliation.
    pub fn submit_auditor_result(
        &self,
        run_id: &str,
        phase_id: &str,
        result: &AuditorResult,
    ) -> SupervisorResult<(Vec<String>, PhaseState)> {
        let committed = self.mutate(run_id, phase_id, |txn| {
            self.phase_controller().submit_auditor(txn, phase_id, result)
        })?;
        Ok((committed.value.0, committed.phase_state))
    }

    /// Feed a CI outcome for a phase in `CI_RUNNING`.
    pub fn report_ci_outcome(
        &self,
        run_id: &str,
        phase_id: &str,
        outcome: &CiOutcome,
    ) -> SupervisorResult<PhaseState> {
        let committed = self.mutate(run_id, phase_id, |txn| {
            self.phase_controller().report_ci(txn, phase_id, outcome)
        })?;
        Ok(committed.phase_state)
    }

    /// Re-check budgets without any other change; returns the run state.
    /// Lets a caller enforce the duration cap on an idle run.
    pub fn enforce_budget(&self, run_id: &str) -> SupervisorResult<RunState> {
        let handle = self.handle(run_id)?;
        let mut record = Self::lock_run(&handle)?;
        if record.run.is_terminal() {
            return Ok(record.run.state);
        }
        let mut txn = RunTxn::begin(&record, Utc::now());
        self.run_controller().reconcile(&mut txn)?;
        let (committed, sightings, events) = txn.into_parts();
        *record = committed;
        self.backlog.observe_all(&sightings)?;
        self.events.publish_all(events);
        self.write_summaries(&mut record.run);
        Ok(record.run.state)
    }

    /// `GetIntegrationStatus`
    pub fn integration_status(&self, run_id: &str) -> SupervisorResult<IntegrationStatus> {
        let run = self.get_run(run_id)?;
        let commits = self.apply.commits(&run.integration_line)?;
        Ok(IntegrationStatus::new(&run, commits))
    }

    /// `GetRunMetrics`
    pub fn run_metrics(&self) -> SupervisorResult<RunMetrics> {
        Ok(RunMetrics::from_runs(&self.all_runs()?))
    }

    /// `GetTierMetrics`
    pub fn tier_metrics(&self, run_id: &str) -> SupervisorResult<Vec<TierMetrics>> {
        Ok(TierMetrics::for_run(&self.get_run(run_id)?))
    }

    /// `GetIssueBacklogSummary`
    pub fn issue_backlog_summary(&self) -> SupervisorResult<BacklogSummary> {
        self.backlog.summary(BACKLOG_OLDEST_LIMIT)
    }

    /// `GetBudgetAnalysis`
    pub fn budget_analysis(&self) -> SupervisorResult<BudgetAnalysis> {
        Ok(BudgetAnalysis::from_runs(&self.all_runs()?, Utc::now()))
    }

    /// `GetRunSummary`
    pub fn run_summary(&self, run_id: &str) -> SupervisorResult<RunSummary> {
        Ok(RunSummary::new(&self.get_run(run_id)?))
    }

    /// Phase-local issue entries in first-seen order.
    pub fn phase_issues(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> SupervisorResult<Vec<PhaseIssueEntry>> {
        let record = self.snapshot(run_id)?;
        if record.run.phase(phase_id).is_none() {
            return Err(SupervisorError::phase_not_found(run_id, phase_id));
        }
        Ok(record.issues.phase_entries(phase_id))
    }

    /// Run-level issue index, one entry per issue key.
    pub fn run_issues(&self, run_id: &str) -> SupervisorResult<Vec<RunIndexEntry>> {
        Ok(self.snapshot(run_id)?.issues.run_index(run_id))
    }
}
