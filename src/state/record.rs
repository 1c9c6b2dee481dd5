//! The persisted state record (state.json).
//!
//! Singleton document. Created once at first run, mutated only through
//! validated transitions, never deleted.

use chrono::{DateTime, Utc};
use lifecycle_protocol::{Actor, Authority};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{check_edge, LifecycleState, StateError};
use crate::schema::{self, Document};

/// Schema version for state.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "billy-lifecycle/state@1";

/// Authority recorded for the most recent state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordedAuthority {
    Executor,
    Human,
    /// First-run initialization and forced corruption handling
    System,
}

impl From<Authority> for RecordedAuthority {
    fn from(a: Authority) -> Self {
        match a {
            Authority::Human => RecordedAuthority::Human,
            // Observers can never transition; check_edge rejects them first.
            Authority::Executor | Authority::Observer => RecordedAuthority::Executor,
        }
    }
}

/// Kind of in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Upgrade,
    Rollback,
}

/// Operation in flight while the state is STAGING/VALIDATING/PROMOTING/ROLLING_BACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub target_version: String,
    pub started_at: DateTime<Utc>,
    /// Current pipeline stage, if the operation reports stages
    pub stage: Option<String>,
    /// Build identifier for upgrade operations
    pub build_id: Option<String>,
}

/// Most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LastFailure {
    /// State in which the failure occurred (null when unknown, e.g. corruption)
    pub state: Option<LifecycleState>,
    pub error: String,
    pub reason_code: String,
    pub occurred_at: DateTime<Utc>,
    pub cleared: bool,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_by: Option<String>,
}

/// Operator locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Locks {
    pub upgrade_locked: bool,
    pub rollback_locked: bool,
    pub lock_reason: Option<String>,
}

/// state.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateRecord {
    pub schema_version: u32,
    pub schema_id: String,
    pub current_state: LifecycleState,
    pub entered_at: DateTime<Utc>,
    pub previous_state: Option<LifecycleState>,
    pub authority_level: RecordedAuthority,
    /// Actor id that caused entry into the current state
    pub entered_by: String,
    /// Reason code supplied with the transition into the current state
    pub reason_code: String,
    pub active_operation: Option<ActiveOperation>,
    pub last_failure: Option<LastFailure>,
    pub locks: Locks,
    /// Monotonic count of accepted mutations
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Operation to attach when entering an active state from an inactive one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub target_version: String,
    pub build_id: Option<String>,
}

/// Extra information carried with a transition request.
#[derive(Debug, Clone, Default)]
pub struct TransitionMetadata {
    /// Required when entering an active state from an inactive one
    pub operation: Option<NewOperation>,
    /// Error text recorded in `last_failure` when entering FAILED/FAILED_HARD
    pub error: Option<String>,
    /// Free-form details copied into the audit event
    pub details: Value,
}

impl TransitionMetadata {
    pub fn with_operation(op: NewOperation) -> Self {
        Self {
            operation: Some(op),
            ..Self::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl StateRecord {
    /// Fresh IDLE record written on first run.
    pub fn initial() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            current_state: LifecycleState::Idle,
            entered_at: now,
            previous_state: None,
            authority_level: RecordedAuthority::System,
            entered_by: "system".to_string(),
            reason_code: "INITIALIZED".to_string(),
            active_operation: None,
            last_failure: None,
            locks: Locks::default(),
            seq: 0,
            updated_at: now,
        }
    }

    /// Synthetic FAILED_HARD record replacing a corrupt document.
    pub fn failed_hard(previous: Option<&StateRecord>, reason_code: &str, error: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            current_state: LifecycleState::FailedHard,
            entered_at: now,
            previous_state: previous.map(|p| p.current_state),
            authority_level: RecordedAuthority::System,
            entered_by: "system".to_string(),
            reason_code: reason_code.to_string(),
            active_operation: None,
            last_failure: Some(LastFailure {
                state: previous.map(|p| p.current_state),
                error: error.to_string(),
                reason_code: reason_code.to_string(),
                occurred_at: now,
                cleared: false,
                cleared_at: None,
                cleared_by: None,
            }),
            locks: previous.map(|p| p.locks.clone()).unwrap_or_default(),
            seq: previous.map(|p| p.seq + 1).unwrap_or(0),
            updated_at: now,
        }
    }

    /// `active_operation != null` iff the state is active.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let active = self.current_state.is_active();
        match (&self.active_operation, active) {
            (Some(_), false) => Err(StateError::InvariantViolation(format!(
                "{} must not carry an active operation",
                self.current_state
            ))),
            (None, true) => Err(StateError::InvariantViolation(format!(
                "{} requires an active operation",
                self.current_state
            ))),
            _ => Ok(()),
        }
    }

    /// Compute the record that results from an accepted transition.
    pub fn apply_transition(
        &self,
        to: LifecycleState,
        reason_code: &str,
        actor: &Actor,
        metadata: &TransitionMetadata,
    ) -> Result<StateRecord, StateError> {
        let from = self.current_state;
        let authority = check_edge(from, to, actor)?;
        let now = Utc::now();
        let mut next = self.clone();

        next.active_operation = if to.is_active() {
            match (&metadata.operation, &self.active_operation) {
                (Some(op), _) => Some(ActiveOperation {
                    op_type: op.op_type,
                    target_version: op.target_version.clone(),
                    started_at: now,
                    stage: None,
                    build_id: op.build_id.clone(),
                }),
                (None, Some(existing)) if from.is_active() => Some(existing.clone()),
                _ => return Err(StateError::MissingOperation { to }),
            }
        } else {
            None
        };

        if matches!(to, LifecycleState::Failed | LifecycleState::FailedHard) {
            next.last_failure = Some(LastFailure {
                state: Some(from),
                error: metadata
                    .error
                    .clone()
                    .unwrap_or_else(|| reason_code.to_string()),
                reason_code: reason_code.to_string(),
                occurred_at: now,
                cleared: false,
                cleared_at: None,
                cleared_by: None,
            });
        } else if from == LifecycleState::Failed {
            if let Some(failure) = next.last_failure.as_mut() {
                failure.cleared = true;
                failure.cleared_at = Some(now);
                failure.cleared_by = Some(actor.id.clone());
            }
        }

        next.previous_state = Some(from);
        next.current_state = to;
        next.entered_at = now;
        next.authority_level = authority.into();
        next.entered_by = actor.id.clone();
        next.reason_code = reason_code.to_string();
        next.seq = self.seq + 1;
        next.updated_at = now;

        next.check_invariants()?;
        Ok(next)
    }
}

fn state_enum() -> Value {
    json!({
        "enum": ["IDLE", "STAGING", "VALIDATING", "PROMOTING", "COMPLETE",
                 "ROLLING_BACK", "FAILED", "FAILED_HARD"]
    })
}

impl Document for StateRecord {
    const SCHEMA_ID: &'static str = SCHEMA_ID;

    fn json_schema() -> Value {
        let operation = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["type", "target_version", "started_at", "stage", "build_id"],
            "properties": {
                "type": { "enum": ["upgrade", "rollback"] },
                "target_version": { "type": "string", "minLength": 1 },
                "started_at": schema::timestamp(),
                "stage": schema::nullable(json!({ "type": "string" })),
                "build_id": schema::nullable(json!({ "type": "string" })),
            }
        });
        let failure = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["state", "error", "reason_code", "occurred_at", "cleared",
                         "cleared_at", "cleared_by"],
            "properties": {
                "state": schema::nullable(state_enum()),
                "error": { "type": "string" },
                "reason_code": { "type": "string", "minLength": 1 },
                "occurred_at": schema::timestamp(),
                "cleared": { "type": "boolean" },
                "cleared_at": schema::nullable(schema::timestamp()),
                "cleared_by": schema::nullable(json!({ "type": "string" })),
            }
        });

        let mut props = schema::header_properties(SCHEMA_ID);
        props.insert("current_state".into(), state_enum());
        props.insert("entered_at".into(), schema::timestamp());
        props.insert("previous_state".into(), schema::nullable(state_enum()));
        props.insert(
            "authority_level".into(),
            json!({ "enum": ["executor", "human", "system"] }),
        );
        props.insert("entered_by".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("reason_code".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("active_operation".into(), schema::nullable(operation));
        props.insert("last_failure".into(), schema::nullable(failure));
        props.insert(
            "locks".into(),
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["upgrade_locked", "rollback_locked", "lock_reason"],
                "properties": {
                    "upgrade_locked": { "type": "boolean" },
                    "rollback_locked": { "type": "boolean" },
                    "lock_reason": schema::nullable(json!({ "type": "string" })),
                }
            }),
        );
        props.insert("seq".into(), json!({ "type": "integer", "minimum": 0 }));
        props.insert("updated_at".into(), schema::timestamp());

        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "current_state", "entered_at",
                         "previous_state", "authority_level", "entered_by", "reason_code",
                         "active_operation", "last_failure", "locks", "seq", "updated_at"],
            "properties": props,
            // active_operation != null iff the state is active
            "if": {
                "properties": {
                    "current_state": { "enum": ["STAGING", "VALIDATING", "PROMOTING", "ROLLING_BACK"] }
                }
            },
            "then": { "properties": { "active_operation": { "type": "object" } } },
            "else": { "properties": { "active_operation": { "type": "null" } } },
        })
    }
}
