//! The assembled lifecycle: one handle owning every store and executor.
//!
//! Pipeline work lives in `approval`, `staging` and `validator`. This
//! module wires them together over a single root directory and carries the
//! bookkeeping-only operations (promote, rollback, confirm, clear, locks,
//! retention) that have no executor of their own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lifecycle_protocol::{Actor, Authority, LockScope};
use serde::Serialize;
use serde_json::json;

use crate::approval::{
    ApprovalError, ApprovalGrant, ApprovalWorkflow, PendingApproval, RequestContext,
    RequestOptions,
};
use crate::audit::{events, AuditEvent, AuditLog};
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::github::{GitHubReleaseClient, ReleaseSource};
use crate::lock::FileLockStrategy;
use crate::staging::build::{CommandBuilder, EnvironmentBuilder};
use crate::staging::fetch::{GitFetcher, SourceFetcher};
use crate::staging::retention::{self, CleanupReport, RetentionPolicy};
use crate::staging::status::StagingStatus;
use crate::staging::store::{ArtifactStore, StoreError};
use crate::staging::{
    BeginOptions, StagingDeps, StagingExecutor, StagingOutcome, StagingSettings,
};
use crate::state::{
    ActiveOperation, InstalledVersions, LastFailure, LifecycleState, Locks, NewOperation,
    OperationGuard, OperationType, StateError, StateRecord, StateStore, StateStoreConfig,
    TransitionMetadata, VersionsStore,
};
use crate::validator::{ArtifactValidator, ReportStore, ValidationReport};
use crate::version::PackageVersion;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Where every document lives under the root.
#[derive(Debug, Clone)]
pub struct LifecyclePaths {
    pub root: PathBuf,
    pub audit: PathBuf,
    pub versions: PathBuf,
    pub approvals: PathBuf,
    pub artifacts: PathBuf,
    pub scratch: PathBuf,
    pub staging_status: PathBuf,
    pub reports: PathBuf,
}

impl LifecyclePaths {
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            audit: root.join("audit.jsonl"),
            versions: root.join("versions.json"),
            approvals: root.join("approvals"),
            artifacts: root.join("artifacts"),
            scratch: root.join("scratch"),
            staging_status: root.join("staging_status.json"),
            reports: root.join("reports"),
        }
    }
}

/// External collaborators, injectable for tests.
#[derive(Clone)]
pub struct Collaborators {
    pub releases: Arc<dyn ReleaseSource>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub builder: Arc<dyn EnvironmentBuilder>,
}

impl Collaborators {
    /// GitHub API, `git` CLI and configured build commands.
    pub fn production(config: &LifecycleConfig) -> Result<Self> {
        let token = config
            .github
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.trim().is_empty());
        let client = match &config.github.api_base_url {
            Some(base) => GitHubReleaseClient::with_api_base_url(
                &config.github.owner,
                &config.github.repo,
                token,
                base,
            )?,
            None => GitHubReleaseClient::new(&config.github.owner, &config.github.repo, token)?,
        };
        Ok(Self {
            releases: Arc::new(client),
            fetcher: Arc::new(GitFetcher::default()),
            builder: Arc::new(CommandBuilder::new(
                config.staging.build_commands.clone(),
                config.timeouts().build(),
            )),
        })
    }
}

/// `status` result.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub state: StateRecord,
    pub versions: InstalledVersions,
    pub pending_approval: Option<PendingApproval>,
    pub approval_grant: Option<ApprovalGrant>,
    pub staging: Option<StagingStatus>,
}

/// One outgoing edge and who may take it.
#[derive(Debug, Clone, Serialize)]
pub struct AllowedTransition {
    pub to: LifecycleState,
    pub authority: Authority,
}

/// `explain-state` result.
#[derive(Debug, Clone, Serialize)]
pub struct StateExplanation {
    pub state: LifecycleState,
    pub summary: &'static str,
    pub entered_at: chrono::DateTime<chrono::Utc>,
    pub entered_by: String,
    pub reason_code: String,
    pub previous_state: Option<LifecycleState>,
    pub active_operation: Option<ActiveOperation>,
    pub last_failure: Option<LastFailure>,
    pub locks: Locks,
    pub allowed_transitions: Vec<AllowedTransition>,
    /// Commands that can make progress from here
    pub next_commands: Vec<&'static str>,
}

/// `report` result.
#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
    pub report: Option<ValidationReport>,
    /// History entries for the requested version, oldest first
    pub history: Vec<PathBuf>,
}

/// One row of `list-artifacts`.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub path: PathBuf,
    pub version: Option<PackageVersion>,
    pub built_at: Option<chrono::DateTime<chrono::Utc>>,
    pub commit_sha: Option<String>,
    pub tree_hash: Option<String>,
    pub size_bytes: u64,
    pub current: bool,
    pub known_good: bool,
    pub error: Option<String>,
}

/// `promote`, `rollback` and `confirm` result.
#[derive(Debug, Clone, Serialize)]
pub struct BookkeepingOutcome {
    pub state: LifecycleState,
    pub versions: InstalledVersions,
}

/// Assembled lifecycle over one root directory.
pub struct Lifecycle {
    config: LifecycleConfig,
    paths: LifecyclePaths,
    audit: AuditLog,
    state: Arc<StateStore>,
    versions: VersionsStore,
    approvals: Arc<ApprovalWorkflow>,
    store: ArtifactStore,
    staging: StagingExecutor,
    validator: ArtifactValidator,
}

impl Lifecycle {
    /// Wire every component under `config.paths.root`.
    pub fn open(config: LifecycleConfig, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let paths = LifecyclePaths::under(&config.paths.root);
        let audit = AuditLog::new(&paths.audit);
        let state = Arc::new(StateStore::new(
            StateStoreConfig::under(&paths.root),
            Arc::new(FileLockStrategy),
            audit.clone(),
        ));
        let versions = VersionsStore::new(&paths.versions, config.installed_version()?);
        let approvals = Arc::new(ApprovalWorkflow::new(
            &paths.approvals,
            audit.clone(),
            collab.releases.clone(),
            &config.package.tag_prefix,
            config.approval_ttl(),
        ));
        let store = ArtifactStore::new(&paths.artifacts, &paths.scratch);
        let timeouts = config.timeouts();

        let staging = StagingExecutor::new(
            StagingDeps {
                state: state.clone(),
                approvals: approvals.clone(),
                store: store.clone(),
                releases: collab.releases,
                fetcher: collab.fetcher,
                builder: collab.builder,
                audit: audit.clone(),
            },
            StagingSettings {
                repo_url: config.package.repo_url.clone(),
                tag_prefix: config.package.tag_prefix.clone(),
                fetch_timeout: timeouts.fetch(),
            },
            paths.staging_status.clone(),
        );
        let validator = ArtifactValidator::new(
            state.clone(),
            store.clone(),
            ReportStore::new(&paths.reports, config.validation.history_limit),
            audit.clone(),
            config.validation_settings(),
        );

        tracing::debug!(root = %paths.root.display(), "lifecycle opened");
        Ok(Self {
            config,
            paths,
            audit,
            state,
            versions,
            approvals,
            store,
            staging,
            validator,
        })
    }

    /// Production wiring.
    pub fn open_default(config: LifecycleConfig) -> Result<Self> {
        config.validate()?;
        let collab = Collaborators::production(&config)?;
        Self::open(config, collab)
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn paths(&self) -> &LifecyclePaths {
        &self.paths
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn versions(&self) -> Result<InstalledVersions> {
        Ok(self.versions.load()?)
    }

    // Read-only queries

    pub fn status(&self) -> Result<StatusView> {
        let state = self.state.load()?;
        Ok(StatusView {
            state,
            versions: self.versions.load()?,
            pending_approval: self.approvals.get_pending()?,
            approval_grant: self.approvals.get_grant()?,
            staging: self.staging.status()?,
        })
    }

    pub fn explain_state(&self) -> Result<StateExplanation> {
        let record = self.state.load()?;
        let state = record.current_state;
        Ok(StateExplanation {
            state,
            summary: describe(state),
            entered_at: record.entered_at,
            entered_by: record.entered_by,
            reason_code: record.reason_code,
            previous_state: record.previous_state,
            active_operation: record.active_operation,
            last_failure: record.last_failure,
            locks: record.locks,
            allowed_transitions: state
                .successors()
                .into_iter()
                .map(|(to, authority)| AllowedTransition { to, authority })
                .collect(),
            next_commands: next_commands(state),
        })
    }

    pub fn pending_approvals(&self) -> Result<Option<PendingApproval>> {
        Ok(self.approvals.get_pending()?)
    }

    pub fn staging_status(&self) -> Result<Option<StagingStatus>> {
        Ok(self.staging.status()?)
    }

    /// Latest report overall, or for one version with its history.
    pub fn report(&self, version: Option<&str>) -> Result<ReportView> {
        let reports = self.validator.reports();
        match version {
            None => Ok(ReportView {
                report: reports.latest()?,
                history: Vec::new(),
            }),
            Some(v) => {
                let version = PackageVersion::parse(v)?;
                Ok(ReportView {
                    report: reports.latest_for(&version)?,
                    history: reports.history(&version)?,
                })
            }
        }
    }

    pub fn list_artifacts(&self) -> Result<Vec<ArtifactSummary>> {
        let versions = self.versions.load()?;
        let listed = self.store.list()?;
        Ok(listed
            .into_iter()
            .map(|a| {
                let is = |v: &Option<PackageVersion>| a.version.is_some() && *v == a.version;
                ArtifactSummary {
                    current: is(&versions.current_version),
                    known_good: is(&versions.known_good_version),
                    built_at: a.manifest.as_ref().map(|m| m.built_at),
                    commit_sha: a.manifest.as_ref().map(|m| m.commit_sha.clone()),
                    tree_hash: a.manifest.as_ref().map(|m| m.checksums.tree_hash.clone()),
                    name: a.name,
                    path: a.path,
                    version: a.version,
                    size_bytes: a.size_bytes,
                    error: a.error,
                }
            })
            .collect())
    }

    pub fn audit_tail(&self, n: usize) -> Result<Vec<AuditEvent>> {
        Ok(self.audit.tail(n)?)
    }

    // Approval

    pub fn request_upgrade(
        &self,
        version: &str,
        actor: &Actor,
        opts: RequestOptions,
    ) -> Result<PendingApproval> {
        let guard = self.state.begin_operation()?;
        let record = self.usable_state(&guard)?;
        let context = RequestContext {
            current_version: self.versions.load()?.current_version,
            upgrade_lock: record.locks.upgrade_locked.then(|| lock_reason(&record.locks)),
        };
        match self
            .approvals
            .request_upgrade(&guard, version, actor, opts, &context)
        {
            Ok(pending) => Ok(pending),
            Err(e) if e.is_corruption() => Err(e.into()),
            Err(e) => {
                self.record_rejected_request(version, actor, &e);
                Err(e.into())
            }
        }
    }

    pub fn approve(&self, version: &str, actor: &Actor) -> Result<ApprovalGrant> {
        let guard = self.state.begin_operation()?;
        self.usable_state(&guard)?;
        Ok(self.approvals.approve(&guard, version, actor)?)
    }

    pub fn deny(&self, version: &str, actor: &Actor, reason: &str) -> Result<PendingApproval> {
        let guard = self.state.begin_operation()?;
        self.usable_state(&guard)?;
        Ok(self.approvals.deny(&guard, version, actor, reason)?)
    }

    // Pipeline

    pub fn begin_staging(
        &self,
        version: &str,
        actor: &Actor,
        opts: BeginOptions,
    ) -> Result<StagingOutcome> {
        Ok(self.staging.begin_staging(version, actor, opts)?)
    }

    /// Run the suite. A failing suite that moved state to FAILED is still
    /// returned as a report; callers decide how to surface it.
    pub fn validate(&self, version: &str, actor: &Actor) -> Result<ValidationReport> {
        Ok(self.validator.validate(version, actor)?)
    }

    /// Apply retention, protecting the current, known-good and in-flight
    /// versions regardless of `keep`.
    pub fn cleanup_artifacts(
        &self,
        keep: usize,
        dry_run: bool,
        actor: &Actor,
    ) -> Result<CleanupReport> {
        let guard = self.state.begin_operation()?;
        let record = self.usable_state(&guard)?;
        let versions = self.versions.load()?;

        let mut protected: Vec<PackageVersion> =
            versions.protected().into_iter().cloned().collect();
        if let Some(op) = &record.active_operation {
            protected.push(PackageVersion::parse(&op.target_version)?);
        }

        let policy = RetentionPolicy::keep_last_n(keep).with_dry_run(dry_run);
        let report = retention::cleanup(&self.store, policy, &protected)?;
        if !dry_run {
            for version in &report.removed {
                self.audit.record(
                    events::ARTIFACT_REMOVED,
                    &actor.id,
                    json!({ "version": version, "keep": keep }),
                )?;
            }
        }
        tracing::info!(
            keep,
            dry_run,
            removed = report.removed.len(),
            protected = report.protected.len(),
            "artifact cleanup finished"
        );
        Ok(report)
    }

    // Human-gated bookkeeping

    /// FAILED -> IDLE.
    pub fn clear_failure(&self, actor: &Actor, reason: Option<&str>) -> Result<StateRecord> {
        let guard = self.state.begin_operation()?;
        self.expect_state(&guard, LifecycleState::Failed)?;
        Ok(self.state.transition(
            &guard,
            LifecycleState::Idle,
            "FAILURE_CLEARED",
            actor,
            TransitionMetadata::default().details(json!({ "reason": reason })),
        )?)
    }

    /// COMPLETE -> IDLE; the promoted version becomes known-good.
    pub fn confirm(&self, actor: &Actor) -> Result<BookkeepingOutcome> {
        let guard = self.state.begin_operation()?;
        self.expect_state(&guard, LifecycleState::Complete)?;

        let before = self.versions.load()?;
        let mut after = before.clone();
        after.known_good_version = before.current_version.clone();
        self.commit_bookkeeping(
            &guard,
            actor,
            &before,
            after,
            "confirm",
            LifecycleState::Idle,
            "COMPLETION_CONFIRMED",
            TransitionMetadata::default(),
        )
    }

    /// PROMOTING -> COMPLETE; the validated target becomes current. No
    /// service swap happens here.
    pub fn promote(&self, actor: &Actor) -> Result<BookkeepingOutcome> {
        let guard = self.state.begin_operation()?;
        let record = self.expect_state(&guard, LifecycleState::Promoting)?;
        let target = active_target(&record)?;
        if !self.store.exists(&target) {
            return Err(StoreError::ArtifactMissing { version: target }.into());
        }

        let before = self.versions.load()?;
        let mut after = before.clone();
        after.current_version = Some(target.clone());
        self.commit_bookkeeping(
            &guard,
            actor,
            &before,
            after,
            "promote",
            LifecycleState::Complete,
            "PROMOTED",
            TransitionMetadata::default().details(json!({ "version": target })),
        )
    }

    /// PROMOTING -> ROLLING_BACK -> IDLE, restoring the known-good version.
    /// Without a known-good artifact the rollback ends in FAILED_HARD.
    pub fn rollback(&self, actor: &Actor, reason: &str) -> Result<BookkeepingOutcome> {
        let guard = self.state.begin_operation()?;
        let record = self.expect_state(&guard, LifecycleState::Promoting)?;
        if record.locks.rollback_locked {
            return Err(LifecycleError::RollbackLocked {
                reason: lock_reason(&record.locks),
            });
        }

        let before = self.versions.load()?;
        let restorable = before
            .known_good_version
            .clone()
            .filter(|v| self.store.exists(v));
        let abandoned = active_target(&record)?;
        let target = restorable
            .clone()
            .or_else(|| before.known_good_version.clone())
            .unwrap_or_else(|| abandoned.clone());

        self.state.transition(
            &guard,
            LifecycleState::RollingBack,
            "ROLLBACK_REQUESTED",
            actor,
            TransitionMetadata::with_operation(NewOperation {
                op_type: OperationType::Rollback,
                target_version: target.to_string(),
                build_id: None,
            })
            .details(json!({ "reason": reason, "abandoned": abandoned })),
        )?;

        let Some(known_good) = restorable else {
            let error = format!(
                "no known-good artifact to restore (known-good: {})",
                before
                    .known_good_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            tracing::error!(%abandoned, "rollback impossible: no known-good artifact");
            self.state.transition(
                &guard,
                LifecycleState::FailedHard,
                "NO_KNOWN_GOOD",
                actor,
                TransitionMetadata::with_error(error),
            )?;
            return Err(LifecycleError::NoKnownGood);
        };

        let mut after = before.clone();
        after.current_version = Some(known_good.clone());
        let outcome = self.commit_bookkeeping(
            &guard,
            actor,
            &before,
            after,
            "rollback",
            LifecycleState::Idle,
            "ROLLBACK_COMPLETE",
            TransitionMetadata::default().details(json!({ "restored": known_good })),
        );
        if let Err(e) = &outcome {
            // ROLLING_BACK has no way back to PROMOTING.
            tracing::error!(error = %e, "rollback bookkeeping failed");
            let error = format!("rollback to {} could not be recorded: {}", known_good, e);
            let forced = self
                .state
                .transition(
                    &guard,
                    LifecycleState::FailedHard,
                    "ROLLBACK_INCOMPLETE",
                    actor,
                    TransitionMetadata::with_error(error.clone()),
                )
                .or_else(|_| {
                    self.state
                        .enter_failed_hard(&guard, "ROLLBACK_INCOMPLETE", &error)
                });
            if let Err(e) = forced {
                tracing::error!(error = %e, "failed to force FAILED_HARD");
            }
        }
        outcome
    }

    pub fn lock(&self, actor: &Actor, scope: LockScope, reason: &str) -> Result<Locks> {
        self.require_human(actor, "lock")?;
        let guard = self.state.begin_operation()?;
        let mut locks = self.usable_state(&guard)?.locks;
        match scope {
            LockScope::Upgrade => locks.upgrade_locked = true,
            LockScope::Rollback => locks.rollback_locked = true,
        }
        locks.lock_reason = Some(reason.to_string());
        Ok(self.state.set_locks(&guard, actor, locks)?.locks)
    }

    pub fn unlock(&self, actor: &Actor, scope: LockScope) -> Result<Locks> {
        self.require_human(actor, "unlock")?;
        let guard = self.state.begin_operation()?;
        let mut locks = self.usable_state(&guard)?.locks;
        match scope {
            LockScope::Upgrade => locks.upgrade_locked = false,
            LockScope::Rollback => locks.rollback_locked = false,
        }
        if !locks.upgrade_locked && !locks.rollback_locked {
            locks.lock_reason = None;
        }
        Ok(self.state.set_locks(&guard, actor, locks)?.locks)
    }

    /// Force FAILED_HARD after a corrupt document was found outside the
    /// state store itself (approvals, versions, manifests, audit log).
    pub fn quarantine(&self, error: &str) -> Result<StateRecord> {
        let guard = self.state.begin_operation()?;
        Ok(self.state.force_failed_hard(&guard, error)?)
    }

    // Helpers

    /// Current record, refusing to proceed from FAILED_HARD.
    fn usable_state(&self, guard: &OperationGuard) -> Result<StateRecord> {
        let record = self.state.current(guard)?;
        if record.current_state.is_terminal() {
            return Err(StateError::TerminalState.into());
        }
        Ok(record)
    }

    fn expect_state(&self, guard: &OperationGuard, expected: LifecycleState) -> Result<StateRecord> {
        let record = self.usable_state(guard)?;
        if record.current_state != expected {
            return Err(StateError::WrongState {
                expected: expected.to_string(),
                actual: record.current_state,
            }
            .into());
        }
        Ok(record)
    }

    fn require_human(&self, actor: &Actor, command: &str) -> Result<()> {
        if actor.authority != Authority::Human {
            return Err(LifecycleError::Unauthorized {
                command: command.to_string(),
                required: Authority::Human.to_string(),
                actor: actor.to_string(),
            });
        }
        Ok(())
    }

    /// Update the installed versions, then take the transition that goes
    /// with them. Versions are restored when the transition is refused or
    /// cannot be journaled, so the two documents never disagree.
    #[allow(clippy::too_many_arguments)]
    fn commit_bookkeeping(
        &self,
        guard: &OperationGuard,
        actor: &Actor,
        before: &InstalledVersions,
        after: InstalledVersions,
        cause: &str,
        to: LifecycleState,
        reason_code: &str,
        metadata: TransitionMetadata,
    ) -> Result<BookkeepingOutcome> {
        let versions = self.save_versions(guard, actor, before, after, cause)?;
        match self.state.transition(guard, to, reason_code, actor, metadata) {
            Ok(record) => Ok(BookkeepingOutcome {
                state: record.current_state,
                versions,
            }),
            Err(e) => {
                self.restore_versions(guard, before, cause);
                Err(e.into())
            }
        }
    }

    fn restore_versions(&self, guard: &OperationGuard, before: &InstalledVersions, cause: &str) {
        if let Err(e) = self.versions.save(guard, before.clone()) {
            tracing::error!(cause, error = %e, "failed to restore installed versions");
        }
    }

    fn save_versions(
        &self,
        guard: &OperationGuard,
        actor: &Actor,
        before: &InstalledVersions,
        after: InstalledVersions,
        cause: &str,
    ) -> Result<InstalledVersions> {
        let saved = self.versions.save(guard, after)?;
        let journaled = self.audit.record(
            events::VERSIONS_UPDATED,
            &actor.id,
            json!({
                "cause": cause,
                "before": {
                    "current_version": before.current_version,
                    "known_good_version": before.known_good_version,
                },
                "after": {
                    "current_version": saved.current_version,
                    "known_good_version": saved.known_good_version,
                },
            }),
        );
        if let Err(e) = journaled {
            self.restore_versions(guard, before, cause);
            return Err(e.into());
        }
        tracing::info!(
            cause,
            current = ?saved.current_version.as_ref().map(|v| v.to_string()),
            known_good = ?saved.known_good_version.as_ref().map(|v| v.to_string()),
            "installed versions updated"
        );
        Ok(saved)
    }

    fn record_rejected_request(&self, version: &str, actor: &Actor, err: &ApprovalError) {
        let code = crate::error::approval_reason(err);
        let result = self.audit.record(
            events::UPGRADE_REQUEST_REJECTED,
            &actor.id,
            json!({ "version": version, "reason_code": code, "error": err.to_string() }),
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to journal rejected upgrade request");
        }
    }
}

fn lock_reason(locks: &Locks) -> String {
    locks
        .lock_reason
        .clone()
        .unwrap_or_else(|| "no reason given".to_string())
}

fn active_target(record: &StateRecord) -> Result<PackageVersion> {
    let op = record
        .active_operation
        .as_ref()
        .ok_or(StateError::MissingOperation {
            to: record.current_state,
        })?;
    Ok(PackageVersion::parse(&op.target_version)?)
}

fn describe(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Idle => "No operation in flight. An approved upgrade can be staged.",
        LifecycleState::Staging => "An artifact is being fetched and built.",
        LifecycleState::Validating => {
            "An artifact has been staged and is waiting for the validation suite."
        }
        LifecycleState::Promoting => {
            "Validation passed. The artifact can be promoted or rolled back."
        }
        LifecycleState::Complete => "Promotion recorded. A human must confirm completion.",
        LifecycleState::RollingBack => "The known-good version is being restored.",
        LifecycleState::Failed => {
            "The last operation failed. A human must clear the failure before continuing."
        }
        LifecycleState::FailedHard => {
            "Unrecoverable. A persisted document was corrupt or rollback was impossible; \
             repair out of band."
        }
    }
}

fn next_commands(state: LifecycleState) -> Vec<&'static str> {
    match state {
        LifecycleState::Idle => vec!["request-upgrade", "approve-upgrade", "begin-staging"],
        LifecycleState::Staging => vec!["staging-status"],
        LifecycleState::Validating => vec!["validate"],
        LifecycleState::Promoting => vec!["promote", "rollback"],
        LifecycleState::Complete => vec!["confirm"],
        LifecycleState::RollingBack => vec![],
        LifecycleState::Failed => vec!["clear-failure"],
        LifecycleState::FailedHard => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFetcher, MockReleaseSource, ScriptedBuilder};
    use tempfile::TempDir;

    fn lifecycle(dir: &TempDir) -> (Lifecycle, Arc<MockReleaseSource>) {
        let mut config = LifecycleConfig::default();
        config.paths.root = dir.path().join("root");
        config.package.repo_url = "https://example.invalid/billy-pkg.git".to_string();
        config.package.installed_version = Some("1.1.0".to_string());
        config.github.owner = "example".to_string();
        config.github.repo = "billy-pkg".to_string();
        let releases = Arc::new(MockReleaseSource::new());
        releases.add_release("v1.2.0", false, false);
        let collab = Collaborators {
            releases: releases.clone(),
            fetcher: Arc::new(MockFetcher::sample_package()),
            builder: Arc::new(ScriptedBuilder::new()),
        };
        (Lifecycle::open(config, collab).unwrap(), releases)
    }

    #[test]
    fn test_status_on_fresh_root() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let status = lc.status().unwrap();
        assert_eq!(status.state.current_state, LifecycleState::Idle);
        assert_eq!(status.versions.current_version.unwrap().to_string(), "1.1.0");
        assert!(status.pending_approval.is_none());
        assert!(status.staging.is_none());
    }

    #[test]
    fn test_explain_idle() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let explained = lc.explain_state().unwrap();
        assert_eq!(explained.state, LifecycleState::Idle);
        assert_eq!(explained.allowed_transitions.len(), 1);
        assert_eq!(explained.allowed_transitions[0].to, LifecycleState::Staging);
        assert!(explained.next_commands.contains(&"begin-staging"));
    }

    #[test]
    fn test_rejected_request_is_journaled() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let err = lc
            .request_upgrade("1.0.0", &Actor::human("alice"), RequestOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Approval(ApprovalError::NotAnUpgrade { .. })
        ));
        let rejected = lc
            .audit_log()
            .events_of_type(events::UPGRADE_REQUEST_REJECTED)
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].details["reason_code"], "NOT_AN_UPGRADE");
    }

    #[test]
    fn test_upgrade_lock_blocks_request() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let alice = Actor::human("alice");
        lc.lock(&alice, LockScope::Upgrade, "freeze").unwrap();
        let err = lc
            .request_upgrade("1.2.0", &alice, RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.classify().1, lifecycle_protocol::ReasonCode::UpgradeLocked);

        let locks = lc.unlock(&alice, LockScope::Upgrade).unwrap();
        assert!(!locks.upgrade_locked);
        assert!(locks.lock_reason.is_none());
        lc.request_upgrade("1.2.0", &alice, RequestOptions::default())
            .unwrap();
    }

    #[test]
    fn test_lock_requires_human() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let bot = Actor::executor_for("ci-bot", "alice");
        let err = lc.lock(&bot, LockScope::Rollback, "nope").unwrap_err();
        assert!(matches!(err, LifecycleError::Unauthorized { .. }));
    }

    #[test]
    fn test_clear_failure_requires_failed_state() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let err = lc.clear_failure(&Actor::human("alice"), None).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::State(StateError::WrongState { .. })
        ));
    }

    #[test]
    fn test_promote_outside_promoting_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (lc, _) = lifecycle(&dir);
        let err = lc
            .promote(&Actor::executor_for("ci-bot", "alice"))
            .unwrap_err();
        assert_eq!(err.classify().1, lifecycle_protocol::ReasonCode::WrongState);
    }
}
