use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a test environment. Transitions only ever move forward;
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Uninitialized,
    Rendered,
    Created,
    Bootstrapped,
    Provisioned,
    Destroyed,
    Failed,
}

impl EnvironmentState {
    fn rank(&self) -> u8 {
        match self {
            EnvironmentState::Uninitialized => 0,
            EnvironmentState::Rendered => 1,
            EnvironmentState::Created => 2,
            EnvironmentState::Bootstrapped => 3,
            EnvironmentState::Provisioned => 4,
            EnvironmentState::Failed => 5,
            EnvironmentState::Destroyed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvironmentState::Destroyed | EnvironmentState::Failed)
    }

    /// Commands can be executed once the backend resource exists.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EnvironmentState::Created
                | EnvironmentState::Bootstrapped
                | EnvironmentState::Provisioned
        )
    }

    pub fn can_advance_to(&self, next: EnvironmentState) -> bool {
        match (self, next) {
            (EnvironmentState::Destroyed, _) => false,
            (_, EnvironmentState::Destroyed) => true,
            (EnvironmentState::Failed, _) => false,
            (_, EnvironmentState::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentState::Uninitialized => "UNINITIALIZED",
            EnvironmentState::Rendered => "RENDERED",
            EnvironmentState::Created => "CREATED",
            EnvironmentState::Bootstrapped => "BOOTSTRAPPED",
            EnvironmentState::Provisioned => "PROVISIONED",
            EnvironmentState::Destroyed => "DESTROYED",
            EnvironmentState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}
