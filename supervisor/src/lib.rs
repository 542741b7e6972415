//! Build Supervisor Library
//!
//! Drives an autonomous Builder/Auditor loop through a governed
//! Run → Tier → Phase hierarchy:
//!
//! - Run, tier and phase state machines with recorded transition paths
//! - Run and tier budgets (tokens, phases, duration, CI runs) and
//!   per-phase token escalation on truncation
//! - Issue tracking at phase, run and project-backlog level, with every
//!   aggregate derived from an append-only log
//! - A governed apply path that rejects patches touching protected paths
//! - Two-stage diagnostics escalation with bounded context retrieval
//! - Read-only integration, metrics, budget and summary views
//!
//! # Usage
//!
//! ```no_run
//! use build_supervisor::{
//!     BuilderResult, BuilderVerdict, PhaseSpec, RunConfig, Supervisor, SupervisorConfig,
//!     TierSpec,
//! };
//!
//! let supervisor = Supervisor::in_memory(SupervisorConfig::from_env(), ["secrets"])?;
//! supervisor.start_run(
//!     RunConfig::new("run-1"),
//!     vec![TierSpec::new("t1", 0, "core")],
//!     vec![PhaseSpec::new("p1", "t1", 0, "parser")],
//! )?;
//! let result = BuilderResult::new(BuilderVerdict::Success).with_tokens(1_200);
//! let (_commit, state) = supervisor.submit_builder_result("run-1", "p1", &result)?;
//! println!("p1 is {}", state);
//! # Ok::<(), build_supervisor::SupervisorError>(())
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod apply;
pub mod budget;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod issues;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod processors;
pub mod summary;
pub mod supervisor;

pub use apply::{GitVersionControl, GovernedApplyPath, InMemoryVcs, ProtectedPaths};
pub use budget::{BudgetManager, StopReason};
pub use config::SupervisorConfig;
pub use controller::{CiOutcome, PhaseCounters};
pub use diagnostics::{ContextRetriever, DiagnosticsEscalationEngine, WorkspaceRetriever};
pub use error::{SupervisorError, SupervisorResult};
pub use events::{EventBus, EventFilter, FilteredReceiver, SharedEventBus, SupervisorEvent};
pub use issues::{IssueReport, IssueSource, ProjectBacklog, Severity};
pub use metrics::{BudgetAnalysis, IntegrationStatus, RunMetrics, RunSummary, TierMetrics};
pub use model::{
    Complexity, PhaseSpec, PhaseState, Run, RunConfig, RunScope, RunState, SafetyProfile,
    TierSpec, TierState,
};
pub use processors::{AuditorRecommendation, AuditorResult, BuilderResult, BuilderVerdict};
pub use summary::{JsonSummaryWriter, SummaryWriter};
pub use supervisor::{IssueRecordOutcome, Supervisor};
