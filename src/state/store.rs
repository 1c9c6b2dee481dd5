//! Persistent state store with single-writer enforcement.
//!
//! The store is an explicit handle: nothing about lifecycle state lives in
//! module-level globals. Every mutation requires an [`OperationGuard`],
//! obtained from [`StateStore::begin_operation`], which holds the exclusive
//! operation lock for as long as the caller keeps it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lifecycle_protocol::Actor;
use serde_json::{json, Value};

use super::record::{Locks, StateRecord, TransitionMetadata};
use super::{LifecycleState, StateError};
use crate::audit::{events, AuditLog};
use crate::fileops::{self, FileOpsError};
use crate::lock::{LockError, LockGuard, LockStrategy};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Paths and timing for a state store.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    /// How long `begin_operation` waits for a competing operation
    pub lock_timeout: Duration,
}

impl StateStoreConfig {
    /// `state.json` and `state.lock` under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            state_path: root.join("state.json"),
            lock_path: root.join("state.lock"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Proof that the caller holds the exclusive operation lock.
pub struct OperationGuard {
    held: Box<dyn LockGuard>,
}

impl OperationGuard {
    pub fn lock_path(&self) -> &Path {
        self.held.path()
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("lock_path", &self.held.path())
            .finish()
    }
}

/// Handle on the authoritative lifecycle state.
pub struct StateStore {
    config: StateStoreConfig,
    lock: Arc<dyn LockStrategy>,
    audit: AuditLog,
}

impl StateStore {
    pub fn new(config: StateStoreConfig, lock: Arc<dyn LockStrategy>, audit: AuditLog) -> Self {
        Self {
            config,
            lock,
            audit,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.config.state_path
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Acquire the single-writer lock. Fails with `OperationInFlight` when
    /// another operation holds it past the configured timeout.
    pub fn begin_operation(&self) -> Result<OperationGuard, StateError> {
        match self
            .lock
            .acquire(&self.config.lock_path, self.config.lock_timeout)
        {
            Ok(held) => Ok(OperationGuard { held }),
            Err(err @ LockError::Contended { .. }) => {
                tracing::warn!(error = %err, "operation rejected: lock contended");
                Err(StateError::OperationInFlight(err))
            }
            Err(LockError::Io { path, source }) => {
                Err(StateError::FileOps(FileOpsError::io(&path, source)))
            }
        }
    }

    /// Read state without the lock. A missing document yields the initial
    /// record (not persisted); a corrupt one is an error.
    pub fn read(&self) -> Result<StateRecord, StateError> {
        let record = fileops::read_document::<StateRecord>(&self.config.state_path)?;
        match record {
            Some(record) => {
                record
                    .check_invariants()
                    .map_err(|e| StateError::Corrupt(e.to_string()))?;
                Ok(record)
            }
            None => Ok(StateRecord::initial()),
        }
    }

    /// Read state while holding the lock. First run persists the initial
    /// record; corruption forces FAILED_HARD and returns that record.
    pub fn current(&self, guard: &OperationGuard) -> Result<StateRecord, StateError> {
        match fileops::read_document::<StateRecord>(&self.config.state_path) {
            Ok(Some(record)) => match record.check_invariants() {
                Ok(()) => Ok(record),
                Err(e) => self.force_failed_hard(guard, &e.to_string()),
            },
            Ok(None) => {
                let record = StateRecord::initial();
                fileops::write_document(&self.config.state_path, &record)?;
                self.audit.record(
                    events::STATE_INITIALIZED,
                    "system",
                    json!({ "state": record.current_state }),
                )?;
                tracing::info!(path = %self.config.state_path.display(), "state initialized");
                Ok(record)
            }
            Err(e) if e.is_corruption() => self.force_failed_hard(guard, &e.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read state, taking the lock briefly so that corruption can be
    /// handled. When another operation holds the lock the unlocked read is
    /// returned instead.
    pub fn load(&self) -> Result<StateRecord, StateError> {
        match self.begin_operation() {
            Ok(guard) => self.current(&guard),
            Err(StateError::OperationInFlight(_)) => self.read(),
            Err(e) => Err(e),
        }
    }

    /// Validate one transition, journal it, then persist it.
    ///
    /// The journal entry is written first: a transition that cannot be
    /// journaled is never persisted and the record stays as it was.
    pub fn transition(
        &self,
        guard: &OperationGuard,
        to: LifecycleState,
        reason_code: &str,
        actor: &Actor,
        metadata: TransitionMetadata,
    ) -> Result<StateRecord, StateError> {
        let current = self.current(guard)?;
        let from = current.current_state;
        let next = current.apply_transition(to, reason_code, actor, &metadata)?;

        let mut details = json!({
            "from": from,
            "to": to,
            "reason_code": reason_code,
            "actor": actor.to_string(),
            "authority_level": next.authority_level,
            "seq": next.seq,
        });
        if let Some(op) = &next.active_operation {
            details["target_version"] = json!(op.target_version);
        }
        if !metadata.details.is_null() {
            details["metadata"] = metadata.details;
        }
        self.audit
            .record(events::STATE_TRANSITION, &actor.id, details)?;

        if let Err(e) = fileops::write_document(&self.config.state_path, &next) {
            tracing::error!(%from, %to, error = %e, "transition journaled but not persisted");
            return Err(e.into());
        }

        tracing::info!(%from, %to, reason_code, actor = %actor, "state transition");
        Ok(next)
    }

    /// Convenience for single-step operations: lock, transition, release.
    pub fn transition_once(
        &self,
        to: LifecycleState,
        reason_code: &str,
        actor: &Actor,
        metadata: TransitionMetadata,
    ) -> Result<StateRecord, StateError> {
        let guard = self.begin_operation()?;
        self.transition(&guard, to, reason_code, actor, metadata)
    }

    /// Record the current pipeline stage of the active operation.
    pub fn record_stage(
        &self,
        guard: &OperationGuard,
        stage: &str,
    ) -> Result<StateRecord, StateError> {
        let mut record = self.current(guard)?;
        let op = record
            .active_operation
            .as_mut()
            .ok_or_else(|| StateError::WrongState {
                expected: "an active operation".to_string(),
                actual: record.current_state,
            })?;
        op.stage = Some(stage.to_string());
        record.seq += 1;
        record.updated_at = Utc::now();
        fileops::write_document(&self.config.state_path, &record)?;
        tracing::debug!(stage, "operation stage recorded");
        Ok(record)
    }

    /// Replace the operator locks.
    pub fn set_locks(
        &self,
        guard: &OperationGuard,
        actor: &Actor,
        locks: Locks,
    ) -> Result<StateRecord, StateError> {
        let mut record = self.current(guard)?;
        if record.current_state.is_terminal() {
            return Err(StateError::TerminalState);
        }
        let before = record.locks.clone();
        record.locks = locks;
        record.seq += 1;
        record.updated_at = Utc::now();
        self.audit.record(
            events::LOCKS_CHANGED,
            &actor.id,
            json!({ "before": before, "after": record.locks }),
        )?;
        fileops::write_document(&self.config.state_path, &record)?;
        Ok(record)
    }

    /// Irreversibly enter FAILED_HARD after a corrupt document was found.
    ///
    /// The unreadable document (if any) is moved aside, never deleted.
    pub fn force_failed_hard(
        &self,
        guard: &OperationGuard,
        error: &str,
    ) -> Result<StateRecord, StateError> {
        self.enter_failed_hard(guard, "DOCUMENT_CORRUPT", error)
    }

    /// Enter FAILED_HARD bypassing the edge table. The state document is
    /// written before the journal entry, and a journal that cannot be
    /// appended to does not keep the record out of FAILED_HARD.
    pub fn enter_failed_hard(
        &self,
        _guard: &OperationGuard,
        reason_code: &str,
        error: &str,
    ) -> Result<StateRecord, StateError> {
        let path = &self.config.state_path;
        let prior = fileops::read_document::<StateRecord>(path).ok().flatten();
        if let Some(prior) = prior.as_ref().filter(|p| p.current_state.is_terminal()) {
            return Ok(prior.clone());
        }

        let preserved = if prior.is_none() && path.exists() {
            let aside = corrupt_copy_path(path);
            fs::rename(path, &aside).map_err(|e| FileOpsError::io(path, e))?;
            Some(aside)
        } else {
            None
        };

        let record = StateRecord::failed_hard(prior.as_ref(), reason_code, error);
        fileops::write_document(path, &record)?;

        let mut details = json!({
            "error": error,
            "reason_code": reason_code,
            "document": path.display().to_string(),
        });
        if let Some(aside) = &preserved {
            details["preserved_copy"] = Value::String(aside.display().to_string());
        }
        if let Some(prior) = &prior {
            details["previous_state"] = json!(prior.current_state);
        }
        if let Err(e) = self.audit.record(events::STATE_CORRUPTION, "system", details) {
            tracing::error!(error = %e, "FAILED_HARD entered but not journaled");
        }

        tracing::error!(error, reason_code, "state forced to FAILED_HARD");
        Ok(record)
    }
}

fn corrupt_copy_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}
