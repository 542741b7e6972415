//! Supervisor policy configuration.
//!
//! All heuristic constants (escalation factor, Stage-2 trigger, retrieval
//! caps, default run caps) live here so operators can tune them without
//! touching the engine. Defaults reproduce the reference behaviour exactly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{SupervisorError, SupervisorResult};
use crate::model::Complexity;

/// Token allocation and escalation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    pub initial_tokens_low: u32,
    pub initial_tokens_medium: u32,
    pub initial_tokens_high: u32,
    pub initial_tokens_unknown: u32,
    /// Multiplier applied on a truncation signal
    pub escalation_factor: f64,
    /// Hard ceiling for any single allocation
    pub max_tokens_ceiling: u32,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            initial_tokens_low: 8_192,
            initial_tokens_medium: 12_288,
            initial_tokens_high: 16_384,
            initial_tokens_unknown: 8_192,
            escalation_factor: 1.5,
            max_tokens_ceiling: 64_000,
        }
    }
}

impl BudgetPolicy {
    pub fn initial_for(&self, complexity: Complexity) -> u32 {
        match complexity {
            Complexity::Low => self.initial_tokens_low,
            Complexity::Medium => self.initial_tokens_medium,
            Complexity::High => self.initial_tokens_high,
            Complexity::Unknown => self.initial_tokens_unknown,
        }
    }
}

/// Caps applied to a run when `StartRun` leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub token_cap: u64,
    pub max_phases: u32,
    pub max_duration_minutes: u64,
    /// Multiplied by the phase count to give `max_minor_issues_total`
    pub minor_issues_per_phase: u32,
    pub max_builder_attempts: u32,
    pub max_auditor_attempts: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            token_cap: 5_000_000,
            max_phases: 25,
            max_duration_minutes: 120,
            minor_issues_per_phase: 3,
            max_builder_attempts: 5,
            max_auditor_attempts: 2,
        }
    }
}

/// Two-stage diagnostics policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsPolicy {
    /// Attempt number at which Stage 2 fires regardless of error shape
    pub stage2_failure_threshold: u32,
    pub max_snippets_per_category: usize,
    pub max_lines_per_snippet: usize,
    /// Distinct files in the error set that make a pattern "complex"
    pub complex_file_threshold: usize,
    /// Distinct top-level modules that make a pattern "complex"
    pub complex_module_threshold: usize,
    pub stage1_max_snippets: usize,
    pub stage1_max_lines: usize,
}

impl Default for DiagnosticsPolicy {
    fn default() -> Self {
        Self {
            stage2_failure_threshold: 3,
            max_snippets_per_category: 3,
            max_lines_per_snippet: 120,
            complex_file_threshold: 2,
            complex_module_threshold: 2,
            stage1_max_snippets: 5,
            stage1_max_lines: 40,
        }
    }
}

/// Project backlog aging thresholds. `None` means entries never flip to
/// `needs_cleanup` on that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingPolicy {
    pub runs_threshold: Option<u32>,
    pub tiers_threshold: Option<u32>,
}

/// Upper bound for `GitSettings::max_retries`; keeps the backoff shift in range.
pub const MAX_GIT_RETRIES: u32 = 10;

/// Git backend settings for the governed apply path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Prefix for commit messages
    pub commit_prefix: String,
    /// Integration branches are named `<prefix><run_id>`
    pub integration_branch_prefix: String,
    /// Retries for transient git failures (lock contention)
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub author_name: String,
    pub author_email: String,
    /// Ref new integration lines branch from. `None` pins whatever HEAD
    /// points at when the backend is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            commit_prefix: "[supervisor]".to_string(),
            integration_branch_prefix: "supervisor/".to_string(),
            max_retries: 3,
            retry_base_delay_ms: 100,
            author_name: "build-supervisor".to_string(),
            author_email: "supervisor@localhost".to_string(),
            base_ref: None,
        }
    }
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub budget: BudgetPolicy,
    pub run_defaults: RunDefaults,
    pub diagnostics: DiagnosticsPolicy,
    pub aging: AgingPolicy,
    pub git: GitSettings,
    /// Where run/tier/phase summary artifacts go; `None` disables them
    pub summary_root: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SupervisorConfig {
    /// Create config from environment variables layered over defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("SUPERVISOR_ESCALATION_FACTOR") {
            config.budget.escalation_factor = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_MAX_TOKENS_CEILING") {
            config.budget.max_tokens_ceiling = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_RUN_TOKEN_CAP") {
            config.run_defaults.token_cap = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_MAX_PHASES") {
            config.run_defaults.max_phases = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_MAX_DURATION_MINUTES") {
            config.run_defaults.max_duration_minutes = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_MAX_BUILDER_ATTEMPTS") {
            config.run_defaults.max_builder_attempts = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_MAX_AUDITOR_ATTEMPTS") {
            config.run_defaults.max_auditor_attempts = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_STAGE2_THRESHOLD") {
            config.diagnostics.stage2_failure_threshold = v;
        }
        if let Some(v) = env_parse("SUPERVISOR_AGING_RUNS_THRESHOLD") {
            config.aging.runs_threshold = Some(v);
        }
        if let Some(v) = env_parse("SUPERVISOR_AGING_TIERS_THRESHOLD") {
            config.aging.tiers_threshold = Some(v);
        }
        if let Ok(prefix) = std::env::var("SUPERVISOR_COMMIT_PREFIX") {
            config.git.commit_prefix = prefix;
        }
        if let Ok(dir) = std::env::var("SUPERVISOR_SUMMARY_ROOT") {
            if !dir.trim().is_empty() {
                config.summary_root = Some(PathBuf::from(dir));
            }
        }

        config
    }

    /// Parse a TOML document; missing sections keep their defaults.
    pub fn from_toml_str(input: &str) -> SupervisorResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| SupervisorError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject internally inconsistent policies.
    pub fn validate(&self) -> SupervisorResult<()> {
        let b = &self.budget;
        if !(b.escalation_factor > 1.0) {
            return Err(SupervisorError::config(format!(
                "escalation_factor must be > 1.0, got {}",
                b.escalation_factor
            )));
        }
        let initial = [
            b.initial_tokens_low,
            b.initial_tokens_medium,
            b.initial_tokens_high,
            b.initial_tokens_unknown,
        ];
        if initial.contains(&0) {
            return Err(SupervisorError::config(
                "initial token allocations must be non-zero",
            ));
        }
        let largest_initial = initial.into_iter().max().unwrap_or_default();
        if b.max_tokens_ceiling < largest_initial {
            return Err(SupervisorError::config(format!(
                "max_tokens_ceiling {} is below the largest initial allocation {}",
                b.max_tokens_ceiling, largest_initial
            )));
        }

        let r = &self.run_defaults;
        if r.token_cap == 0 || r.max_phases == 0 || r.max_duration_minutes == 0 {
            return Err(SupervisorError::config("run caps must be non-zero"));
        }
        if r.max_builder_attempts == 0 || r.max_auditor_attempts == 0 {
            return Err(SupervisorError::config("attempt limits must be non-zero"));
        }

        let d = &self.diagnostics;
        if d.stage2_failure_threshold == 0
            || d.max_snippets_per_category == 0
            || d.max_lines_per_snippet == 0
        {
            return Err(SupervisorError::config("diagnostics caps must be non-zero"));
        }

        if self.git.max_retries > MAX_GIT_RETRIES {
            return Err(SupervisorError::config(format!(
                "git max_retries must be at most {}, got {}",
                MAX_GIT_RETRIES, self.git.max_retries
            )));
        }
        Ok(())
    }
}
