//! Governed patch application.
//!
//! Patches are inspected, checked against the protected-path policy and
//! only then handed to the version-control backend, one at a time per
//! integration line.

pub mod diff;
pub mod git;
pub mod governed;
pub mod policy;
pub mod vcs;

pub use diff::{inspect, DiffProblem, DiffSummary};
pub use git::GitVersionControl;
pub use governed::{ApplyOutcome, ApplyRejection, GovernedApplyPath};
pub use policy::{ProtectedPathPolicy, ProtectedPaths};
pub use vcs::{InMemoryVcs, MemoryCommit, VersionControl};
