//! Agent lifecycle states.
//!
//! This module defines the state machine every agent handle follows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent handle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Handle built, backend not started yet.
    Uninitialized,
    /// Backend initialization in progress.
    Initializing,
    /// Idle and accepting work.
    Ready,
    /// Serving exactly one send or tool call.
    Busy,
    /// Initialization or transport failed; the handle must be replaced.
    Error,
    /// Backend shutdown in progress.
    ShuttingDown,
    /// Terminal; every operation fails.
    Disposed,
}

impl AgentState {
    /// Checks if the handle can transition to the given state.
    ///
    /// # Arguments
    /// * `to` - The target state
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct state transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Uninitialized: start up, or be disposed without ever starting
            (Self::Uninitialized, Self::Initializing | Self::ShuttingDown) => true,
            // From Initializing: success, failure, or torn down mid-start
            (Self::Initializing, Self::Ready | Self::Error | Self::ShuttingDown) => true,
            // From Ready: take work or shut down
            (Self::Ready, Self::Busy | Self::ShuttingDown) => true,
            // From Busy: finish, fail, or be torn down mid-call
            (Self::Busy, Self::Ready | Self::Error | Self::ShuttingDown) => true,
            // From Error: only shutdown
            (Self::Error, Self::ShuttingDown) => true,
            // From ShuttingDown: Disposed
            (Self::ShuttingDown, Self::Disposed) => true,
            // All other transitions are invalid, including Busy -> Busy
            _ => false,
        }
    }

    /// Returns `true` once disposal has started or finished.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Disposed)
    }

    /// Returns `true` if a cached handle in this state must be replaced.
    #[must_use]
    pub fn is_unusable(&self) -> bool {
        matches!(self, Self::Error | Self::ShuttingDown | Self::Disposed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::ShuttingDown => "shutting_down",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        // Uninitialized transitions
        assert!(AgentState::Uninitialized.can_transition_to(AgentState::Initializing));
        assert!(AgentState::Uninitialized.can_transition_to(AgentState::ShuttingDown));
        assert!(!AgentState::Uninitialized.can_transition_to(AgentState::Ready));

        // Initializing transitions
        assert!(AgentState::Initializing.can_transition_to(AgentState::Ready));
        assert!(AgentState::Initializing.can_transition_to(AgentState::Error));
        assert!(!AgentState::Initializing.can_transition_to(AgentState::Busy));

        // Ready transitions
        assert!(AgentState::Ready.can_transition_to(AgentState::Busy));
        assert!(AgentState::Ready.can_transition_to(AgentState::ShuttingDown));
        assert!(!AgentState::Ready.can_transition_to(AgentState::Disposed));

        // Busy transitions
        assert!(AgentState::Busy.can_transition_to(AgentState::Ready));
        assert!(AgentState::Busy.can_transition_to(AgentState::Error));
        assert!(!AgentState::Busy.can_transition_to(AgentState::Busy));

        // Error transitions
        assert!(AgentState::Error.can_transition_to(AgentState::ShuttingDown));
        assert!(!AgentState::Error.can_transition_to(AgentState::Ready));

        // Terminal
        assert!(AgentState::ShuttingDown.can_transition_to(AgentState::Disposed));
        assert!(!AgentState::Disposed.can_transition_to(AgentState::Ready));
        assert!(!AgentState::Disposed.can_transition_to(AgentState::ShuttingDown));
    }

    #[test]
    fn test_unusable_states() {
        assert!(AgentState::Error.is_unusable());
        assert!(AgentState::Disposed.is_unusable());
        assert!(!AgentState::Ready.is_unusable());
        assert!(!AgentState::Busy.is_unusable());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AgentState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(AgentState::Ready.to_string(), "ready");
    }
}
