//! Append-only audit journal (`audit.jsonl`).
//!
//! One JSON object per line. Events are never mutated or deleted; the
//! journal is the sole source of forensic truth. Each line is validated
//! against the audit-event schema on write and on read, and a line that
//! fails is corruption.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fileops::{self, FileOpsError};
use crate::schema::{self, Document};

/// Schema version for audit events
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "billy-lifecycle/audit_event@1";

/// Event type names.
pub mod events {
    pub const STATE_TRANSITION: &str = "state_transition";
    pub const STATE_CORRUPTION: &str = "state_corruption_detected";
    pub const STATE_INITIALIZED: &str = "state_initialized";
    pub const LOCKS_CHANGED: &str = "locks_changed";
    pub const UPGRADE_REQUESTED: &str = "upgrade_requested";
    pub const UPGRADE_REQUEST_REJECTED: &str = "upgrade_request_rejected";
    pub const APPROVAL_GRANTED: &str = "approval_granted";
    pub const APPROVAL_DENIED: &str = "approval_denied";
    pub const APPROVAL_CONSUMED: &str = "approval_consumed";
    pub const STAGING_STAGE_SUCCEEDED: &str = "staging_stage_succeeded";
    pub const STAGING_STAGE_FAILED: &str = "staging_stage_failed";
    pub const STAGING_DRY_RUN: &str = "staging_dry_run";
    pub const VALIDATION_COMPLETED: &str = "validation_completed";
    pub const ARTIFACT_REMOVED: &str = "artifact_removed";
    pub const VERSIONS_UPDATED: &str = "versions_updated";
    pub const COMMAND_REJECTED: &str = "command_rejected";
}

/// One audit journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEvent {
    pub schema_version: u32,
    pub schema_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor: String,
    pub details: Value,
}

impl Document for AuditEvent {
    const SCHEMA_ID: &'static str = SCHEMA_ID;

    fn json_schema() -> Value {
        let mut props = schema::header_properties(SCHEMA_ID);
        props.insert("event_id".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("timestamp".into(), schema::timestamp());
        props.insert(
            "event_type".into(),
            json!({ "type": "string", "pattern": "^[a-z][a-z_]*$" }),
        );
        props.insert("actor".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("details".into(), json!({ "type": "object" }));
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "event_id", "timestamp",
                         "event_type", "actor", "details"],
            "properties": props,
        })
    }
}

/// Errors for audit log operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error("corrupt audit line {line} in {path}: {reason}")]
    CorruptLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl AuditError {
    pub fn is_corruption(&self) -> bool {
        match self {
            AuditError::FileOps(e) => e.is_corruption(),
            AuditError::CorruptLine { .. } => true,
        }
    }
}

/// Handle on the append-only journal.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. `details` must be a JSON object.
    pub fn record(
        &self,
        event_type: &str,
        actor: &str,
        details: Value,
    ) -> Result<AuditEvent, AuditError> {
        let event = AuditEvent {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            event_id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            details,
        };

        let value = schema::to_validated_value(&event).map_err(|source| {
            FileOpsError::InvalidDocument {
                path: self.path.clone(),
                source,
            }
        })?;
        let line = serde_json::to_string(&value).map_err(|e| FileOpsError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        fileops::append_line(&self.path, &line)?;

        tracing::debug!(event_type, actor, "audit event recorded");
        Ok(event)
    }

    /// Read every event in order. Any unparseable line is corruption.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileOpsError::io(&self.path, e).into()),
        };

        let mut events = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(line).map_err(|e| AuditError::CorruptLine {
                    path: self.path.clone(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            let event: AuditEvent =
                schema::from_validated_value(value).map_err(|e| AuditError::CorruptLine {
                    path: self.path.clone(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            events.push(event);
        }
        Ok(events)
    }

    /// The last `n` events.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let mut events = self.read_all()?;
        let skip = events.len().saturating_sub(n);
        Ok(events.split_off(skip))
    }

    /// All events of one type, in order.
    pub fn events_of_type(&self, event_type: &str) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_read() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));

        log.record(events::UPGRADE_REQUESTED, "alice", json!({"version": "1.2.0"}))
            .unwrap();
        log.record(events::APPROVAL_GRANTED, "bob", json!({"version": "1.2.0"}))
            .unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "upgrade_requested");
        assert_eq!(all[1].actor, "bob");
        assert_eq!(all[1].details["version"], "1.2.0");
    }

    #[test]
    fn test_event_ids_are_ulids() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        let first = log.record(events::STATE_TRANSITION, "x", json!({})).unwrap();
        let second = log.record(events::STATE_TRANSITION, "x", json!({})).unwrap();
        assert!(ulid::Ulid::from_string(&first.event_id).is_ok());
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn test_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        for i in 0..5 {
            log.record(events::STATE_TRANSITION, "executor", json!({"i": i}))
                .unwrap();
        }
        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 5);
    }

    #[test]
    fn test_details_must_be_object() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        assert!(log.record(events::STATE_TRANSITION, "x", json!("text")).is_err());
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_line_detected() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record(events::STATE_TRANSITION, "x", json!({})).unwrap();
        fileops::append_line(log.path(), "{\"truncated\":").unwrap();

        let err = log.read_all().unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, AuditError::CorruptLine { line: 2, .. }));
    }

    #[test]
    fn test_tail_and_filter() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        for i in 0..4 {
            log.record(events::STATE_TRANSITION, "x", json!({"i": i})).unwrap();
        }
        log.record(events::APPROVAL_DENIED, "alice", json!({})).unwrap();

        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].event_type, "approval_denied");
        assert_eq!(log.events_of_type(events::STATE_TRANSITION).unwrap().len(), 4);
        assert_eq!(log.tail(100).unwrap().len(), 5);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
