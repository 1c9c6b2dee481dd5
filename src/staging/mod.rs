//! Staging executor: fetch -> build -> checksum -> finalize.
//!
//! Consumes an approval grant, drives IDLE -> STAGING, produces an
//! immutable artifact and hands off with STAGING -> VALIDATING. Any stage
//! failure removes the scratch tree, records the failure and moves the
//! state machine to FAILED. Nothing is retried.

pub mod build;
pub mod checksum;
pub mod fetch;
pub mod manifest;
pub mod retention;
pub mod status;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lifecycle_protocol::Actor;
use serde::Serialize;
use serde_json::{json, Value};

use crate::approval::{ApprovalError, ApprovalGrant, ApprovalWorkflow};
use crate::audit::{events, AuditError, AuditLog};
use crate::fileops::{self, FileOpsError};
use crate::github::ReleaseSource;
use crate::state::{
    LifecycleState, NewOperation, OperationGuard, OperationType, StateError, StateStore,
    TransitionMetadata,
};
use crate::version::{PackageVersion, VersionError};

use build::{BuildRequest, EnvironmentBuilder};
use checksum::compute_checksums;
use fetch::{FetchRequest, SourceFetcher};
use manifest::ArtifactManifest;
use status::{StagingStage, StagingStatus};
use store::{ArtifactStore, ScratchDir, StoreError};

/// Why a pipeline stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineFailure {
    FetchFailed,
    CommitMismatch,
    UpstreamUnavailable,
    BuildFailed,
    ChecksumFailed,
    FinalizeFailed,
    Internal,
}

impl PipelineFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineFailure::FetchFailed => "FETCH_FAILED",
            PipelineFailure::CommitMismatch => "COMMIT_MISMATCH",
            PipelineFailure::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            PipelineFailure::BuildFailed => "BUILD_FAILED",
            PipelineFailure::ChecksumFailed => "CHECKSUM_FAILED",
            PipelineFailure::FinalizeFailed => "FINALIZE_FAILED",
            PipelineFailure::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from staging
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("{actor} may not stage: requires an executor acting on behalf of a human")]
    Authority { actor: String },

    #[error("upgrades are locked: {reason}")]
    UpgradeLocked { reason: String },

    #[error(transparent)]
    InvalidVersion(#[from] VersionError),

    #[error("artifact for {version} already exists (use rebuild to replace it)")]
    ArtifactExists { version: PackageVersion },

    /// The pipeline ran and failed; state is now FAILED.
    #[error("staging failed at {stage} [{failure}]: {message}")]
    StageFailed {
        stage: StagingStage,
        failure: PipelineFailure,
        message: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl StagingError {
    pub fn is_corruption(&self) -> bool {
        match self {
            StagingError::State(e) => e.is_corruption(),
            StagingError::Approval(e) => e.is_corruption(),
            StagingError::Store(e) => e.is_corruption(),
            StagingError::FileOps(e) => e.is_corruption(),
            StagingError::Audit(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Options for `begin_staging`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeginOptions {
    /// Replace an existing artifact for the version
    pub rebuild: bool,
    /// Check preconditions only
    pub dry_run: bool,
}

/// Timing of one completed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: StagingStage,
    pub duration_ms: u64,
}

/// Result of a staging run.
#[derive(Debug, Clone, Serialize)]
pub struct StagingOutcome {
    pub version: String,
    pub dry_run: bool,
    pub build_id: Option<String>,
    pub state: LifecycleState,
    pub approval_id: String,
    pub artifact_path: Option<PathBuf>,
    pub commit_sha: Option<String>,
    pub tree_hash: Option<String>,
    pub stages: Vec<StageTiming>,
}

/// Settings that do not change between runs.
#[derive(Debug, Clone)]
pub struct StagingSettings {
    pub repo_url: String,
    pub tag_prefix: String,
    pub fetch_timeout: Duration,
}

/// Collaborators the executor drives.
pub struct StagingDeps {
    pub state: Arc<StateStore>,
    pub approvals: Arc<ApprovalWorkflow>,
    pub store: ArtifactStore,
    pub releases: Arc<dyn ReleaseSource>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub builder: Arc<dyn EnvironmentBuilder>,
    pub audit: AuditLog,
}

struct StageError {
    failure: PipelineFailure,
    message: String,
}

impl StageError {
    fn new(failure: PipelineFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}

/// Clone -> build -> checksum pipeline.
pub struct StagingExecutor {
    deps: StagingDeps,
    settings: StagingSettings,
    status_path: PathBuf,
}

impl StagingExecutor {
    pub fn new(deps: StagingDeps, settings: StagingSettings, status_path: PathBuf) -> Self {
        Self {
            deps,
            settings,
            status_path,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.deps.store
    }

    /// Most recent staging status, if any run has started.
    pub fn status(&self) -> Result<Option<StagingStatus>, StagingError> {
        Ok(fileops::read_document(&self.status_path)?)
    }

    /// Stage `version`. See the module docs for the pipeline.
    pub fn begin_staging(
        &self,
        version: &str,
        actor: &Actor,
        opts: BeginOptions,
    ) -> Result<StagingOutcome, StagingError> {
        if !actor.is_human_initiated_executor() {
            return Err(StagingError::Authority {
                actor: actor.to_string(),
            });
        }

        let state = &self.deps.state;
        let guard = state.begin_operation()?;
        let record = state.current(&guard)?;
        if record.current_state.is_terminal() {
            return Err(StateError::TerminalState.into());
        }
        if record.current_state != LifecycleState::Idle {
            return Err(StateError::WrongState {
                expected: LifecycleState::Idle.to_string(),
                actual: record.current_state,
            }
            .into());
        }
        if record.locks.upgrade_locked {
            return Err(StagingError::UpgradeLocked {
                reason: record
                    .locks
                    .lock_reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        let version = PackageVersion::parse(version)?;
        let grant = self.deps.approvals.check_grant(&version, Utc::now())?;
        if self.deps.store.exists(&version) && !opts.rebuild {
            return Err(StagingError::ArtifactExists { version });
        }

        if opts.dry_run {
            self.deps.audit.record(
                events::STAGING_DRY_RUN,
                &actor.id,
                json!({
                    "version": version,
                    "approval_id": grant.approval_id,
                    "rebuild": opts.rebuild,
                }),
            )?;
            tracing::info!(%version, "staging dry run: preconditions satisfied");
            return Ok(StagingOutcome {
                version: version.to_string(),
                dry_run: true,
                build_id: None,
                state: record.current_state,
                approval_id: grant.approval_id,
                artifact_path: None,
                commit_sha: None,
                tree_hash: None,
                stages: Vec::new(),
            });
        }

        // Initialize
        let started = Instant::now();
        let build_id = ulid::Ulid::new().to_string().to_lowercase();
        self.sweep_stale_scratch();
        let scratch = match self.deps.store.create_scratch(&build_id) {
            Ok(scratch) => scratch,
            Err(e) => {
                self.deps.audit.record(
                    events::STAGING_STAGE_FAILED,
                    &actor.id,
                    json!({
                        "stage": StagingStage::Initialize,
                        "build_id": build_id,
                        "version": version,
                        "error": e.to_string(),
                    }),
                )?;
                return Err(e.into());
            }
        };
        state.transition(
            &guard,
            LifecycleState::Staging,
            "BEGIN_STAGING",
            actor,
            TransitionMetadata::with_operation(NewOperation {
                op_type: OperationType::Upgrade,
                target_version: version.to_string(),
                build_id: Some(build_id.clone()),
            })
            .details(json!({ "approval_id": grant.approval_id, "rebuild": opts.rebuild })),
        )?;

        // From here on every error ends the run in FAILED.
        let mut status = StagingStatus::started(&build_id, &version.to_string());
        self.write_status(&status);
        let mut run = StageRun {
            exec: self,
            guard: &guard,
            actor,
            build_id: &build_id,
            version: &version,
            status: &mut status,
            timings: vec![StageTiming {
                stage: StagingStage::Initialize,
                duration_ms: started.elapsed().as_millis() as u64,
            }],
        };
        let result = run
            .initialize(&grant, &scratch)
            .and_then(|()| run.pipeline(scratch, opts))
            .and_then(|(artifact_path, manifest)| {
                run.status.at_stage(StagingStage::Transition);
                let stage_start = Instant::now();
                let record = state
                    .transition(
                        &guard,
                        LifecycleState::Validating,
                        "STAGING_COMPLETE",
                        actor,
                        TransitionMetadata::default().details(json!({
                            "build_id": build_id,
                            "tree_hash": manifest.checksums.tree_hash,
                        })),
                    )
                    .map_err(|e| {
                        (
                            StagingStage::Transition,
                            StageError::new(PipelineFailure::Internal, e.to_string()),
                        )
                    })?;
                run.timings.push(StageTiming {
                    stage: StagingStage::Transition,
                    duration_ms: stage_start.elapsed().as_millis() as u64,
                });
                Ok((artifact_path, manifest, record))
            });
        let stages = std::mem::take(&mut run.timings);

        match result {
            Ok((artifact_path, manifest, record)) => {
                status.finish(None);
                self.write_status(&status);
                self.deps.audit.record(
                    events::STAGING_STAGE_SUCCEEDED,
                    &actor.id,
                    json!({
                        "stage": StagingStage::Transition,
                        "build_id": build_id,
                        "version": version,
                    }),
                )?;

                tracing::info!(%version, %build_id, elapsed_ms = started.elapsed().as_millis() as u64, "staging complete");
                Ok(StagingOutcome {
                    version: version.to_string(),
                    dry_run: false,
                    build_id: Some(build_id),
                    state: record.current_state,
                    approval_id: grant.approval_id,
                    artifact_path: Some(artifact_path),
                    commit_sha: Some(manifest.commit_sha),
                    tree_hash: Some(manifest.checksums.tree_hash),
                    stages,
                })
            }
            Err((stage, err)) => {
                tracing::error!(%version, %build_id, %stage, error = %err.message, "staging failed");
                self.fail_run(&guard, actor, &build_id, &version, stage, &err);
                status.finish(Some(format!("{}: {}", stage, err.message)));
                self.write_status(&status);
                Err(StagingError::StageFailed {
                    stage,
                    failure: err.failure,
                    message: err.message,
                })
            }
        }
    }

    /// Move a failed run to FAILED. When even that transition cannot be
    /// recorded the state is forced to FAILED_HARD, so that no error leaves
    /// the lifecycle parked in STAGING.
    fn fail_run(
        &self,
        guard: &OperationGuard,
        actor: &Actor,
        build_id: &str,
        version: &PackageVersion,
        stage: StagingStage,
        err: &StageError,
    ) {
        let message = format!("{}: {}", stage, err.message);
        let failed = self.deps.state.transition(
            guard,
            LifecycleState::Failed,
            err.failure.as_str(),
            actor,
            TransitionMetadata::with_error(message.clone())
                .details(json!({ "stage": stage, "build_id": build_id })),
        );
        if let Err(e) = failed {
            tracing::error!(error = %e, "cannot record staging failure; forcing FAILED_HARD");
            let error = format!("staging failure could not be recorded ({}): {}", e, message);
            if let Err(e) = self
                .deps
                .state
                .enter_failed_hard(guard, "JOURNAL_UNAVAILABLE", &error)
            {
                tracing::error!(error = %e, "failed to force FAILED_HARD");
            }
        }

        let recorded = self.deps.audit.record(
            events::STAGING_STAGE_FAILED,
            &actor.id,
            json!({
                "stage": stage,
                "build_id": build_id,
                "version": version,
                "reason_code": err.failure.as_str(),
                "error": err.message,
            }),
        );
        if let Err(e) = recorded {
            tracing::warn!(error = %e, "failed to journal stage failure");
        }
    }

    /// Remove scratch trees left behind by a crashed run. Only called while
    /// holding the operation lock, so nothing else can be using them.
    fn sweep_stale_scratch(&self) {
        let stale = match self.deps.store.scratch_entries() {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list scratch directories");
                return;
            }
        };
        for path in stale {
            tracing::warn!(path = %path.display(), "removing stale scratch directory");
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::error!(path = %path.display(), error = %e, "failed to remove stale scratch");
            }
        }
    }

    fn write_status(&self, status: &StagingStatus) {
        if let Err(e) = fileops::write_document(&self.status_path, status) {
            tracing::warn!(error = %e, "failed to write staging status");
        }
    }
}

/// Per-run pipeline context.
struct StageRun<'a> {
    exec: &'a StagingExecutor,
    guard: &'a OperationGuard,
    actor: &'a Actor,
    build_id: &'a str,
    version: &'a PackageVersion,
    status: &'a mut StagingStatus,
    timings: Vec<StageTiming>,
}

impl StageRun<'_> {
    /// Consume the grant for this build. A consumed grant cannot stage again.
    fn initialize(
        &mut self,
        grant: &ApprovalGrant,
        scratch: &ScratchDir,
    ) -> Result<(), (StagingStage, StageError)> {
        let internal = |message: String| {
            (
                StagingStage::Initialize,
                StageError::new(PipelineFailure::Internal, message),
            )
        };
        self.exec
            .deps
            .approvals
            .consume_grant(self.guard, grant, self.actor, self.build_id)
            .map_err(|e| internal(e.to_string()))?;
        self.succeeded(StagingStage::Initialize, json!({ "scratch": scratch.path() }))
            .map_err(|e| internal(e.to_string()))
    }

    fn pipeline(
        &mut self,
        scratch: ScratchDir,
        opts: BeginOptions,
    ) -> Result<(PathBuf, ArtifactManifest), (StagingStage, StageError)> {
        let exec = self.exec;
        let settings = &exec.settings;
        let deps = &exec.deps;
        let tag = self.version.tag(&settings.tag_prefix);

        // Fetch
        let commit_sha = self.stage(StagingStage::Fetch, || {
            let expected = deps
                .releases
                .tag_commit(&tag)
                .map_err(|e| StageError::new(PipelineFailure::UpstreamUnavailable, e.to_string()))?
                .ok_or_else(|| {
                    StageError::new(
                        PipelineFailure::FetchFailed,
                        format!("tag {} has no commit on the release source", tag),
                    )
                })?;
            let fetched = deps
                .fetcher
                .fetch(
                    &FetchRequest {
                        repo_url: settings.repo_url.clone(),
                        tag: tag.clone(),
                        timeout: settings.fetch_timeout,
                    },
                    &scratch.source_dir(),
                )
                .map_err(|e| StageError::new(PipelineFailure::FetchFailed, e.to_string()))?;
            if !fetched.commit_sha.eq_ignore_ascii_case(&expected) {
                return Err(StageError::new(
                    PipelineFailure::CommitMismatch,
                    format!(
                        "checked out {} but release source reports {}",
                        fetched.commit_sha, expected
                    ),
                ));
            }
            Ok((fetched.commit_sha, json!({ "tag": tag, "commit_sha": expected })))
        })?;

        // Build
        let version_str = self.version.to_string();
        self.stage(StagingStage::Build, || {
            let steps = deps
                .builder
                .build(&BuildRequest {
                    version: &version_str,
                    tree: &scratch.source_dir(),
                    env_dir: &scratch.env_dir(),
                })
                .map_err(|e| StageError::new(PipelineFailure::BuildFailed, e.to_string()))?;
            Ok(((), json!({ "steps": steps })))
        })?;

        // Checksum
        let checksums = self.stage(StagingStage::Checksum, || {
            let checksums = compute_checksums(&scratch.source_dir())
                .map_err(|e| StageError::new(PipelineFailure::ChecksumFailed, e.to_string()))?;
            let details = json!({
                "files": checksums.files.len(),
                "tree_hash": checksums.tree_hash,
            });
            Ok((checksums, details))
        })?;

        // Finalize
        let manifest = ArtifactManifest::new(
            self.version.clone(),
            &settings.repo_url,
            &tag,
            &commit_sha,
            checksums,
            self.build_id,
        );
        let mut scratch = Some(scratch);
        let path = self.stage(StagingStage::Finalize, || {
            let scratch = scratch.take().ok_or_else(|| {
                StageError::new(PipelineFailure::Internal, "scratch directory already consumed")
            })?;
            let path = deps
                .store
                .finalize(scratch, &manifest, opts.rebuild)
                .map_err(|e| StageError::new(PipelineFailure::FinalizeFailed, e.to_string()))?;
            let details = json!({ "artifact": path });
            Ok((path, details))
        })?;

        Ok((path, manifest))
    }

    /// Run one stage: record it, time it, audit the outcome.
    fn stage<T>(
        &mut self,
        stage: StagingStage,
        body: impl FnOnce() -> Result<(T, Value), StageError>,
    ) -> Result<T, (StagingStage, StageError)> {
        let started = Instant::now();
        self.status.at_stage(stage);
        self.exec.write_status(self.status);
        self.exec
            .deps
            .state
            .record_stage(self.guard, stage.as_str())
            .map_err(|e| (stage, StageError::new(PipelineFailure::Internal, e.to_string())))?;
        tracing::info!(version = %self.version, build_id = self.build_id, %stage, "stage started");

        let (value, details) = body().map_err(|e| (stage, e))?;
        self.timings.push(StageTiming {
            stage,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.succeeded(stage, details)
            .map_err(|e| (stage, StageError::new(PipelineFailure::Internal, e.to_string())))?;
        Ok(value)
    }

    fn succeeded(&self, stage: StagingStage, details: Value) -> Result<(), AuditError> {
        self.exec.deps.audit.record(
            events::STAGING_STAGE_SUCCEEDED,
            &self.actor.id,
            json!({
                "stage": stage,
                "build_id": self.build_id,
                "version": self.version,
                "details": details,
            }),
        )?;
        Ok(())
    }
}
