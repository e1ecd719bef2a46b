//! Server lifecycle state machine.
//!
//! The server moves strictly forward through
//! `NotStarted -> Running -> Stopping -> Stopped`. All state changes go
//! through [`ServerState::transition`], which rejects anything else.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Listener not yet started (or start failed)
    #[default]
    NotStarted,
    /// Accepting connections
    Running,
    /// Listener closed, waiting for users to disconnect
    Stopping,
    /// Terminal state, all users gone
    Stopped,
}

impl ServerState {
    /// Validates a transition and returns the new state.
    ///
    /// # Errors
    ///
    /// Returns `StateError::IllegalTransition` unless `to` directly follows
    /// `self` in the lifecycle.
    pub fn transition(self, to: ServerState) -> Result<ServerState, StateError> {
        use ServerState::*;

        match (self, to) {
            (NotStarted, Running) | (Running, Stopping) | (Stopping, Stopped) => Ok(to),
            (from, to) => Err(StateError::IllegalTransition { from, to }),
        }
    }

    /// Returns true once the server has fully stopped.
    pub fn is_terminal(self) -> bool {
        self == ServerState::Stopped
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Error returned for a transition the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("illegal server state transition: {from} -> {to}")]
    IllegalTransition { from: ServerState, to: ServerState },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ServerState; 4] = [
        ServerState::NotStarted,
        ServerState::Running,
        ServerState::Stopping,
        ServerState::Stopped,
    ];

    #[test]
    fn test_default_is_not_started() {
        assert_eq!(ServerState::default(), ServerState::NotStarted);
    }

    #[test]
    fn test_forward_transitions_allowed() {
        assert_eq!(
            ServerState::NotStarted.transition(ServerState::Running),
            Ok(ServerState::Running)
        );
        assert_eq!(
            ServerState::Running.transition(ServerState::Stopping),
            Ok(ServerState::Stopping)
        );
        assert_eq!(
            ServerState::Stopping.transition(ServerState::Stopped),
            Ok(ServerState::Stopped)
        );
    }

    #[test]
    fn test_every_other_transition_rejected() {
        let legal = [
            (ServerState::NotStarted, ServerState::Running),
            (ServerState::Running, ServerState::Stopping),
            (ServerState::Stopping, ServerState::Stopped),
        ];

        for from in ALL {
            for to in ALL {
                if legal.contains(&(from, to)) {
                    continue;
                }
                assert_eq!(
                    from.transition(to),
                    Err(StateError::IllegalTransition { from, to }),
                    "{from} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_only_running_can_be_entered_from_not_started() {
        for from in ALL {
            let result = from.transition(ServerState::Running);
            assert_eq!(result.is_ok(), from == ServerState::NotStarted);
        }
    }

    #[test]
    fn test_state_error_display() {
        let err = ServerState::Stopped
            .transition(ServerState::Running)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal server state transition: stopped -> running"
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(ServerState::Stopped.is_terminal());
        assert!(!ServerState::Stopping.is_terminal());
    }
}
