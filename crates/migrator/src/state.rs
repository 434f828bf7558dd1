//! Execution state machine.

use serde::{Deserialize, Serialize};

/// The state of one [`crate::Migrator::execute`] call.
///
/// State transitions:
/// ```text
/// Init ──┬──► Validate ──► Connect ──► AcquireLock ──┬──► Run ──► ReleaseLock ──► Done
///        └──► Disabled                                └──► Done (lock busy, quiet)
///
/// Validate, Connect, AcquireLock, Run, ReleaseLock ──► Failed
/// ```
///
/// `ReleaseLock` follows `Run` whatever `Run` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionState {
    #[default]
    Init,

    /// Configuration and registry are checked. No store access yet.
    Validate,

    /// History index and lock document are prepared.
    Connect,

    AcquireLock,

    /// Rollbacks and forward application.
    Run,

    ReleaseLock,

    /// Finished normally (terminal state).
    Done,

    /// The engine is switched off (terminal state).
    Disabled,

    /// Finished with an error (terminal state).
    Failed,
}

impl ExecutionState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Init, Validate)
                | (Init, Disabled)
                | (Validate, Connect)
                | (Validate, Failed)
                | (Connect, AcquireLock)
                | (Connect, Failed)
                | (AcquireLock, Run)
                | (AcquireLock, Done)
                | (AcquireLock, Failed)
                | (Run, ReleaseLock)
                | (ReleaseLock, Done)
                | (ReleaseLock, Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Done | ExecutionState::Disabled | ExecutionState::Failed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Init => "Init",
            ExecutionState::Validate => "Validate",
            ExecutionState::Connect => "Connect",
            ExecutionState::AcquireLock => "AcquireLock",
            ExecutionState::Run => "Run",
            ExecutionState::ReleaseLock => "ReleaseLock",
            ExecutionState::Done => "Done",
            ExecutionState::Disabled => "Disabled",
            ExecutionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_default_state_is_init() {
        assert_eq!(ExecutionState::default(), Init);
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [Init, Validate, Connect, AcquireLock, Run, ReleaseLock, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_run_always_goes_through_release() {
        assert!(Run.can_transition_to(ReleaseLock));
        assert!(!Run.can_transition_to(Done));
        assert!(!Run.can_transition_to(Failed));
    }

    #[test]
    fn test_disabled_only_from_init() {
        assert!(Init.can_transition_to(Disabled));
        assert!(!Validate.can_transition_to(Disabled));
        assert!(!Connect.can_transition_to(Disabled));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!Init.is_terminal());
        assert!(!Run.is_terminal());
        assert!(Done.is_terminal());
        assert!(Disabled.is_terminal());
        assert!(Failed.is_terminal());

        for terminal in [Done, Disabled, Failed] {
            assert!(!terminal.can_transition_to(Validate));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(AcquireLock.to_string(), "AcquireLock");
        assert_eq!(ReleaseLock.to_string(), "ReleaseLock");
        assert_eq!(Disabled.to_string(), "Disabled");
    }
}
