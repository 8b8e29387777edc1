//! Session state machine.

use std::fmt;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No backend selected.
    #[default]
    Uninitialized,
    /// Backend and transport chosen, link down.
    Initialized,
    /// Logical connection with the target is up.
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "UNINITIALIZED"),
            SessionState::Initialized => write!(f, "INITIALIZED"),
            SessionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

impl SessionState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Initialized)
                | (Initialized, Connected)
                | (Connected, Initialized)
                | (Initialized, Uninitialized)
                | (Connected, Uninitialized)
        )
    }
}

/// Current state plus transition bookkeeping.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, returning the previous state. Transitions to the
    /// current state are ignored and return `None`.
    pub fn goto_state(&mut self, next: SessionState) -> Option<SessionState> {
        if self.state == next {
            return None;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "no transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(from = %self.state, to = %next, "State transition");
        let previous = self.state;
        self.state = next;
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), SessionState::Uninitialized);

        assert_eq!(
            machine.goto_state(SessionState::Initialized),
            Some(SessionState::Uninitialized)
        );
        assert_eq!(machine.goto_state(SessionState::Initialized), None);
        machine.goto_state(SessionState::Connected);
        machine.goto_state(SessionState::Uninitialized);
        assert_eq!(machine.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_edges() {
        use SessionState::*;
        assert!(Uninitialized.can_transition_to(Initialized));
        assert!(!Uninitialized.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Initialized));
        assert!(Connected.can_transition_to(Uninitialized));
        assert_eq!(Connected.to_string(), "CONNECTED");
    }
}
