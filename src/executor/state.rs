//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No worker process.
    Stopped,
    /// Process spawned, waiting for its ready notice.
    Starting,
    /// Accepting calls.
    Running,
    /// Process exited unexpectedly; a restart may follow.
    Crashed,
    /// Shutdown requested, waiting for the process to exit.
    Stopping,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Stopped
            (Stopped, Starting) |
            // From Starting
            (Starting, Running) | (Starting, Crashed) |
            (Starting, Stopping) | (Starting, Stopped) |
            // From Running
            (Running, Crashed) | (Running, Stopping) |
            // From Crashed (restart, give up, or shut down)
            (Crashed, Starting) | (Crashed, Stopped) | (Crashed, Stopping) |
            // From Stopping
            (Stopping, Stopped)
        )
    }

    /// Only a running worker takes new calls.
    pub fn accepts_calls(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current state plus a bounded transition history.
#[derive(Debug, Clone, Serialize)]
pub struct Lifecycle {
    pub state: WorkerState,
    /// When the current worker generation became ready.
    pub started_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: WorkerState::Stopped,
            started_at: None,
            transitions: Vec::new(),
        }
    }
}

impl Lifecycle {
    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: WorkerState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        const MAX_TRANSITIONS: usize = 200;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        match new_state {
            WorkerState::Running => self.started_at = Some(Utc::now()),
            WorkerState::Stopped | WorkerState::Crashed => self.started_at = None,
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use WorkerState::*;

        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_only_running_accepts_calls() {
        assert!(WorkerState::Running.accepts_calls());
        assert!(!WorkerState::Starting.accepts_calls());
        assert!(!WorkerState::Crashed.accepts_calls());
    }

    #[test]
    fn test_lifecycle_tracks_history() {
        let mut lifecycle = Lifecycle::default();
        lifecycle
            .transition_to(WorkerState::Starting, Some("start".into()))
            .unwrap();
        lifecycle.transition_to(WorkerState::Running, None).unwrap();
        assert!(lifecycle.started_at.is_some());

        let err = lifecycle
            .transition_to(WorkerState::Starting, None)
            .unwrap_err();
        assert!(err.contains("running"));
        assert_eq!(lifecycle.state, WorkerState::Running);
        assert_eq!(lifecycle.transitions.len(), 2);

        lifecycle.transition_to(WorkerState::Crashed, None).unwrap();
        assert!(lifecycle.started_at.is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(WorkerState::Stopping.to_string(), "stopping");
    }
}
