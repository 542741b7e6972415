//! Supervisor event bus
//!
//! Pub/sub over a Tokio broadcast channel. Events are published only after
//! the owning transaction commits. Publishing never blocks and works without
//! a runtime; having no subscribers is fine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::issues::Severity;
use crate::model::{PhaseState, RunState};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Everything observable that happens to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    RunStarted {
        run_id: String,
        tiers: usize,
        phases: usize,
        timestamp: DateTime<Utc>,
    },

    RunStateChanged {
        run_id: String,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    },

    PhaseTransition {
        run_id: String,
        phase_id: String,
        from: PhaseState,
        to: PhaseState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    IssueRecorded {
        run_id: String,
        phase_id: String,
        issue_key: String,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },

    PatchApplied {
        run_id: String,
        phase_id: String,
        commit_ref: String,
        timestamp: DateTime<Utc>,
    },

    PatchRejected {
        run_id: String,
        phase_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    TokenEscalation {
        run_id: String,
        phase_id: String,
        from: u32,
        to: u32,
        timestamp: DateTime<Utc>,
    },

    DiagnosticsEscalated {
        run_id: String,
        phase_id: String,
        trigger: String,
        snippets: usize,
        timestamp: DateTime<Utc>,
    },

    RunFinished {
        run_id: String,
        state: RunState,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl SupervisorEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunStateChanged { .. } => "run_state_changed",
            Self::PhaseTransition { .. } => "phase_transition",
            Self::IssueRecorded { .. } => "issue_recorded",
            Self::PatchApplied { .. } => "patch_applied",
            Self::PatchRejected { .. } => "patch_rejected",
            Self::TokenEscalation { .. } => "token_escalation",
            Self::DiagnosticsEscalated { .. } => "diagnostics_escalated",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    /// Run the event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunStateChanged { run_id, .. }
            | Self::PhaseTransition { run_id, .. }
            | Self::IssueRecorded { run_id, .. }
            | Self::PatchApplied { run_id, .. }
            | Self::PatchRejected { run_id, .. }
            | Self::TokenEscalation { run_id, .. }
            | Self::DiagnosticsEscalated { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Event bus with broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SupervisorEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            // No receivers is OK
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = SupervisorEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &SupervisorEvent) -> bool {
        if let Some(ref rid) = self.run_id {
            if event.run_id() != rid {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

/// Receiver that drops events its filter rejects.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<SupervisorEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<SupervisorEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Next buffered matching event, if any. Lagged gaps are skipped.
    pub fn try_next(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Filtered receiver lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next matching event; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
