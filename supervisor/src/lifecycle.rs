//! Guarded lifecycle transitions shared by phases, tiers and runs.
//!
//! Each state enum declares its legal edges through [`LifecycleState`]. The
//! [`advance`] helper validates an edge, appends a [`TransitionRecord`] and
//! logs it, so every record carries an auditable history that can be
//! replayed offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SupervisorError, SupervisorResult};

/// A state enum with an explicit transition table.
pub trait LifecycleState: Copy + Eq + fmt::Display {
    /// Short name used in errors and logs ("phase", "tier", "run").
    const KIND: &'static str;

    /// Whether no further transitions are allowed.
    fn is_terminal(self) -> bool;

    /// Whether `self → to` is an edge of the state graph.
    fn can_transition_to(self, to: Self) -> bool;
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord<S> {
    /// The state transitioned from.
    pub from: S,
    /// The state transitioned to.
    pub to: S,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Move `current` to `to` if the edge is legal, recording it in `log`.
pub fn advance<S: LifecycleState>(
    current: &mut S,
    log: &mut Vec<TransitionRecord<S>>,
    to: S,
    reason: Option<&str>,
) -> SupervisorResult<()> {
    let from = *current;
    if from.is_terminal() || !from.can_transition_to(to) {
        return Err(SupervisorError::illegal_transition(S::KIND, from, to));
    }

    tracing::debug!(kind = S::KIND, from = %from, to = %to, reason, "State transition");

    log.push(TransitionRecord {
        from,
        to,
        at: Utc::now(),
        reason: reason.map(String::from),
    });
    *current = to;
    Ok(())
}

/// Render a transition log as `A → B → C`.
pub fn path_summary<S: LifecycleState>(initial: S, log: &[TransitionRecord<S>]) -> String {
    let mut out = initial.to_string();
    for record in log {
        out.push_str(" → ");
        out.push_str(&record.to.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Off,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl LifecycleState for Light {
        const KIND: &'static str = "light";

        fn is_terminal(self) -> bool {
            self == Light::Off
        }

        fn can_transition_to(self, to: Self) -> bool {
            matches!(
                (self, to),
                (Light::Red, Light::Green) | (Light::Green, Light::Red) | (_, Light::Off)
            )
        }
    }

    #[test]
    fn test_advance_records_transition() {
        let mut state = Light::Red;
        let mut log = Vec::new();
        advance(&mut state, &mut log, Light::Green, Some("go")).unwrap();
        assert_eq!(state, Light::Green);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].reason.as_deref(), Some("go"));
    }

    #[test]
    fn test_terminal_blocks_everything() {
        let mut state = Light::Red;
        let mut log = Vec::new();
        advance(&mut state, &mut log, Light::Off, None).unwrap();
        let err = advance(&mut state, &mut log, Light::Red, None).unwrap_err();
        assert!(matches!(err, SupervisorError::IllegalTransition { kind: "light", .. }));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_illegal_edge_leaves_state_untouched() {
        let mut state = Light::Red;
        let mut log = Vec::new();
        assert!(advance(&mut state, &mut log, Light::Red, None).is_err());
        assert_eq!(state, Light::Red);
        assert!(log.is_empty());
    }

    #[test]
    fn test_path_summary() {
        let mut state = Light::Red;
        let mut log = Vec::new();
        advance(&mut state, &mut log, Light::Green, None).unwrap();
        advance(&mut state, &mut log, Light::Off, None).unwrap();
        assert_eq!(path_summary(Light::Red, &log), "Red → Green → Off");
    }
}
