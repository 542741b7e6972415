//! Supervisor error types
//!
//! Every failure the supervisor can surface maps onto one of four classes
//! (transient, escalatable, validation, fatal). The class decides whether a
//! caller may retry, whether escalation machinery should kick in, or whether
//! a terminal state must be forced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Error taxonomy used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts and temporary collaborator unavailability; retried within the attempt budget
    Transient,
    /// Token truncation, repeated failure, complex multi-file errors
    Escalatable,
    /// Rejected input: protected paths, malformed patches, bad enum values
    Validation,
    /// Budget exhaustion, policy violation, unresolvable scope
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Escalatable => write!(f, "escalatable"),
            Self::Validation => write!(f, "validation"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Structured error view for boundary callers.
///
/// ```json
/// {
///   "code": "SCOPE_NOT_FOUND",
///   "message": "Issue scope not found: run=r1 phase=p9",
///   "recovery_action": "Verify the phase id belongs to the run",
///   "context": { "run_id": "r1" },
///   "retryable": false
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// What the caller should do next
    pub recovery_action: String,
    /// Extra identifiers for debugging
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    /// Whether the same call may succeed on retry
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Errors raised by the version-control collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcsError {
    /// The backend command could not be executed or returned non-zero
    #[error("Version control operation failed: {operation} - {message}")]
    CommandFailed { operation: String, message: String },

    /// Patch does not apply cleanly against the integration line
    #[error("Patch does not apply: {message}")]
    PatchRejected { message: String },

    /// The backend did not answer in time
    #[error("Version control operation timed out: {operation}")]
    Timeout { operation: String },
}

impl VcsError {
    /// Create a command failure
    pub fn command(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same command might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::PatchRejected { .. } => false,
            Self::CommandFailed { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
        }
    }
}

/// Errors raised while retrieving diagnostic context
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Category name outside the fixed retrieval categories
    #[error("Unknown retrieval category: {0}")]
    UnknownCategory(String),

    /// Empty query
    #[error("Retrieval query is empty")]
    EmptyQuery,

    /// Workspace root missing or unreadable
    #[error("Workspace not readable at {path}: {message}")]
    Workspace { path: String, message: String },
}

/// Errors raised by the summary-artifact collaborator
#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("IO error writing summary: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error writing summary: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A run with the same identifier is already registered
    #[error("Run already exists: {run_id}")]
    RunAlreadyExists { run_id: String },

    /// No run with this identifier (404-equivalent)
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Phase not part of the run
    #[error("Phase not found: run={run_id} phase={phase_id}")]
    PhaseNotFound { run_id: String, phase_id: String },

    /// Issue tracker could not resolve the owning phase or tier
    #[error("Issue scope not found: run={run_id} phase={phase_id}")]
    ScopeNotFound { run_id: String, phase_id: String },

    /// State name is not a member of the state enum
    #[error("Invalid {kind} state: '{value}'")]
    InvalidState { kind: &'static str, value: String },

    /// Transition not in the state graph
    #[error("Illegal {kind} transition from {from} to {to}")]
    IllegalTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    /// The run already reached a terminal state
    #[error("Run {run_id} is terminal ({state}); no further mutation allowed")]
    RunTerminal { run_id: String, state: String },

    /// A phase tried to start ahead of its predecessors
    #[error("Phase {phase_id} cannot start: {message}")]
    PhaseOrderViolation { phase_id: String, message: String },

    /// Invalid input parameters
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Version-control collaborator failure
    #[error(transparent)]
    Vcs(#[from] VcsError),

    /// Diagnostics retrieval failure
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// A shared lock was poisoned by a panicking holder
    #[error("Lock poisoned: {what}")]
    LockPoisoned { what: &'static str },

    /// Configuration rejected
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a run-not-found error
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::RunNotFound {
            run_id: run_id.into(),
        }
    }

    /// Create a phase-not-found error
    pub fn phase_not_found(run_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        Self::PhaseNotFound {
            run_id: run_id.into(),
            phase_id: phase_id.into(),
        }
    }

    /// Create an illegal transition error
    pub fn illegal_transition(
        kind: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::IllegalTransition {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Classify this error for propagation decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Vcs(e) if e.is_retryable() => ErrorClass::Transient,
            Self::Vcs(VcsError::PatchRejected { .. }) => ErrorClass::Validation,
            Self::Vcs(_) => ErrorClass::Transient,
            Self::Retrieval(RetrievalError::Workspace { .. }) => ErrorClass::Transient,
            Self::Retrieval(_) => ErrorClass::Validation,
            Self::Io(_) => ErrorClass::Transient,
            Self::LockPoisoned { .. } => ErrorClass::Fatal,
            Self::ScopeNotFound { .. } => ErrorClass::Fatal,
            Self::RunTerminal { .. } => ErrorClass::Fatal,
            Self::RunAlreadyExists { .. }
            | Self::RunNotFound { .. }
            | Self::PhaseNotFound { .. }
            | Self::InvalidState { .. }
            | Self::IllegalTransition { .. }
            | Self::PhaseOrderViolation { .. }
            | Self::Validation { .. }
            | Self::Config { .. }
            | Self::Json(_) => ErrorClass::Validation,
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::RunAlreadyExists { .. } => "RUN_ALREADY_EXISTS",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::PhaseNotFound { .. } => "PHASE_NOT_FOUND",
            Self::ScopeNotFound { .. } => "SCOPE_NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::RunTerminal { .. } => "RUN_TERMINAL",
            Self::PhaseOrderViolation { .. } => "PHASE_ORDER_VIOLATION",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Vcs(_) => "VCS_ERROR",
            Self::Retrieval(_) => "RETRIEVAL_ERROR",
            Self::LockPoisoned { .. } => "LOCK_POISONED",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::RunAlreadyExists { .. } => {
                "Use GetRun to inspect the existing run or start with a fresh run id."
            }
            Self::RunNotFound { .. } => "Start the run with StartRun before addressing it.",
            Self::PhaseNotFound { .. } | Self::ScopeNotFound { .. } => {
                "Verify the phase id belongs to the run; GetRun lists every phase."
            }
            Self::InvalidState { .. } => {
                "Send one of the documented state names exactly; values are never coerced."
            }
            Self::IllegalTransition { .. } => {
                "Check the current state with GetRun and follow the documented state graph."
            }
            Self::RunTerminal { .. } => {
                "The run is finished. Inspect GetRunSummary or start a new run."
            }
            Self::PhaseOrderViolation { .. } => {
                "Finish earlier tiers and earlier phases of this tier first, or mark the phase independent."
            }
            Self::Validation { .. } => "Fix the rejected input and submit a new attempt.",
            Self::Vcs(e) if e.is_retryable() => "Version control is busy; retry the attempt.",
            Self::Vcs(_) => "Check the integration line with `git status` and resubmit.",
            Self::Retrieval(_) => "Use the categories implementation, tests, config or docs.",
            Self::LockPoisoned { .. } => {
                "A previous operation panicked while holding state; restart the supervisor."
            }
            Self::Config { .. } => "Correct the SUPERVISOR_* settings and restart.",
            Self::Io(_) => "Check disk space and permissions, then retry.",
            Self::Json(_) => "The payload is not valid JSON for this operation.",
        }
    }

    /// Convert into the structured boundary view
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.code().to_string(),
            message: self.to_string(),
            recovery_action: self.recovery_suggestion().to_string(),
            context: HashMap::new(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<SummaryError> for SupervisorError {
    fn from(err: SummaryError) -> Self {
        match err {
            SummaryError::Io(e) => Self::Io(e),
            SummaryError::Json(e) => Self::Json(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            SupervisorError::validation("bad").class(),
            ErrorClass::Validation
        );
        let scope = SupervisorError::ScopeNotFound {
            run_id: "r".into(),
            phase_id: "p".into(),
        };
        assert_eq!(scope.class(), ErrorClass::Fatal);
        assert!(!scope.is_retryable());

        let timeout = SupervisorError::Vcs(VcsError::Timeout {
            operation: "apply".into(),
        });
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert!(timeout.is_retryable());

        let rejected = SupervisorError::Vcs(VcsError::PatchRejected {
            message: "corrupt patch".into(),
        });
        assert_eq!(rejected.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_vcs_lock_is_retryable() {
        let err = VcsError::command("commit", "fatal: Unable to create index.lock");
        assert!(err.is_retryable());
        let err = VcsError::command("commit", "nothing to commit");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_structured_error() {
        let err = SupervisorError::run_not_found("run-7");
        let structured = err.to_structured().with_context("run_id", "run-7");
        assert_eq!(structured.code, "RUN_NOT_FOUND");
        assert!(structured.message.contains("run-7"));
        assert!(!structured.retryable);

        let json = serde_json::to_string(&structured).unwrap();
        assert!(json.contains("recovery_action"));
        assert!(json.contains("run-7"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = SupervisorError::InvalidState {
            kind: "phase",
            value: "DONE-ish".into(),
        };
        assert_eq!(err.to_string(), "Invalid phase state: 'DONE-ish'");
    }
}
