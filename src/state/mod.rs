//! Lifecycle state machine.
//!
//! States: IDLE → STAGING → VALIDATING → PROMOTING → COMPLETE → IDLE,
//! with FAILED reachable from STAGING/VALIDATING, ROLLING_BACK from
//! PROMOTING, and the terminal FAILED_HARD reachable from ROLLING_BACK or
//! (bypassing the edge table) from corruption of any persisted document.

mod record;
mod store;
mod versions;

pub use record::{
    ActiveOperation, LastFailure, Locks, NewOperation, OperationType, RecordedAuthority,
    StateRecord, TransitionMetadata, SCHEMA_ID, SCHEMA_VERSION,
};
pub use store::{OperationGuard, StateStore, StateStoreConfig};
pub use versions::{InstalledVersions, VersionsStore, VERSIONS_SCHEMA_ID};

use lifecycle_protocol::{Actor, Authority};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audit::AuditError;
use crate::fileops::FileOpsError;
use crate::lock::LockError;

/// Lifecycle state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Idle,
    Staging,
    Validating,
    Promoting,
    Complete,
    RollingBack,
    Failed,
    FailedHard,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Idle,
        LifecycleState::Staging,
        LifecycleState::Validating,
        LifecycleState::Promoting,
        LifecycleState::Complete,
        LifecycleState::RollingBack,
        LifecycleState::Failed,
        LifecycleState::FailedHard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Staging => "STAGING",
            LifecycleState::Validating => "VALIDATING",
            LifecycleState::Promoting => "PROMOTING",
            LifecycleState::Complete => "COMPLETE",
            LifecycleState::RollingBack => "ROLLING_BACK",
            LifecycleState::Failed => "FAILED",
            LifecycleState::FailedHard => "FAILED_HARD",
        }
    }

    /// States that require an `active_operation`.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Staging
                | LifecycleState::Validating
                | LifecycleState::Promoting
                | LifecycleState::RollingBack
        )
    }

    /// No outgoing edges at all.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::FailedHard)
    }

    /// Authority required to move from this state to `target`, or `None`
    /// when the edge does not exist.
    pub fn edge_authority(&self, target: LifecycleState) -> Option<Authority> {
        use LifecycleState::*;
        match (self, target) {
            (Idle, Staging) => Some(Authority::Executor),

            (Staging, Validating) | (Staging, Failed) => Some(Authority::Executor),

            (Validating, Promoting) | (Validating, Failed) => Some(Authority::Executor),

            (Promoting, Complete) | (Promoting, RollingBack) => Some(Authority::Executor),

            // Completion is confirmed by a human only
            (Complete, Idle) => Some(Authority::Human),

            (RollingBack, Idle) | (RollingBack, FailedHard) => Some(Authority::Executor),

            // Failures are cleared by a human only
            (Failed, Idle) | (Failed, Staging) => Some(Authority::Human),

            _ => None,
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        self.edge_authority(target).is_some()
    }

    /// Every allowed successor with its required authority.
    pub fn successors(&self) -> Vec<(LifecycleState, Authority)> {
        Self::ALL
            .iter()
            .filter_map(|to| self.edge_authority(*to).map(|a| (*to, a)))
            .collect()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors for state operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("transition {from} -> {to} is not allowed")]
    EdgeNotAllowed {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("state is FAILED_HARD; manual out-of-band repair is required")]
    TerminalState,

    #[error("{actor} cannot drive {from} -> {to}: requires {required} authority")]
    Authority {
        actor: String,
        from: LifecycleState,
        to: LifecycleState,
        required: Authority,
    },

    #[error("entering {to} requires an active operation")]
    MissingOperation { to: LifecycleState },

    #[error("expected state {expected}, found {actual}")]
    WrongState {
        expected: String,
        actual: LifecycleState,
    },

    #[error("state invariant violated: {0}")]
    InvariantViolation(String),

    #[error("another lifecycle operation is in flight: {0}")]
    OperationInFlight(#[source] LockError),

    #[error("state document is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl StateError {
    pub fn is_corruption(&self) -> bool {
        match self {
            StateError::Corrupt(_) => true,
            StateError::FileOps(e) => e.is_corruption(),
            StateError::Audit(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Check whether `actor` may drive `from -> to`.
pub fn check_edge(
    from: LifecycleState,
    to: LifecycleState,
    actor: &Actor,
) -> Result<Authority, StateError> {
    if from.is_terminal() {
        return Err(StateError::TerminalState);
    }
    let required = from
        .edge_authority(to)
        .ok_or(StateError::EdgeNotAllowed { from, to })?;
    if actor.authority != required {
        return Err(StateError::Authority {
            actor: actor.to_string(),
            from,
            to,
            required,
        });
    }
    Ok(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_edge_table() {
        let allowed = [
            (Idle, Staging),
            (Staging, Validating),
            (Staging, Failed),
            (Validating, Promoting),
            (Validating, Failed),
            (Promoting, Complete),
            (Promoting, RollingBack),
            (Complete, Idle),
            (RollingBack, Idle),
            (RollingBack, FailedHard),
            (Failed, Idle),
            (Failed, Staging),
        ];
        for from in LifecycleState::ALL {
            for to in LifecycleState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_failed_hard_has_no_exit() {
        assert!(FailedHard.successors().is_empty());
        assert!(FailedHard.is_terminal());
    }

    #[test]
    fn test_human_only_edges() {
        assert_eq!(Failed.edge_authority(Idle), Some(Authority::Human));
        assert_eq!(Complete.edge_authority(Idle), Some(Authority::Human));
        assert_eq!(Idle.edge_authority(Staging), Some(Authority::Executor));
    }

    #[test]
    fn test_check_edge_authority() {
        let human = Actor::human("alice");
        let executor = Actor::executor_for("runner", "alice");
        let observer = Actor::observer("watcher");

        assert!(check_edge(Failed, Idle, &human).is_ok());
        assert!(matches!(
            check_edge(Failed, Idle, &executor),
            Err(StateError::Authority { .. })
        ));
        assert!(matches!(
            check_edge(Idle, Staging, &observer),
            Err(StateError::Authority { .. })
        ));
        assert!(matches!(
            check_edge(Idle, Complete, &executor),
            Err(StateError::EdgeNotAllowed { .. })
        ));
        assert!(matches!(
            check_edge(FailedHard, Idle, &human),
            Err(StateError::TerminalState)
        ));
    }

    #[test]
    fn test_active_states() {
        let active: Vec<_> = LifecycleState::ALL
            .iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(active, vec![&Staging, &Validating, &Promoting, &RollingBack]);
    }

    #[test]
    fn test_serialization_names() {
        assert_eq!(serde_json::to_string(&RollingBack).unwrap(), "\"ROLLING_BACK\"");
        assert_eq!(serde_json::to_string(&FailedHard).unwrap(), "\"FAILED_HARD\"");
        for s in LifecycleState::ALL {
            assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{}\"", s.as_str()));
        }
    }
}
