//! Artifact validation suite.
//!
//! Six independent checks (see [`checks::CheckKind`]) run against a staged
//! artifact. Each runs on its own thread under a per-check timeout, and the
//! whole suite shares one deadline; a failing or timed-out check never stops
//! the rest. Entered from VALIDATING the verdict drives the state machine
//! to PROMOTING or FAILED. Entered from STAGING it is inspection only.

pub mod checks;
pub mod report;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lifecycle_protocol::Actor;
use serde_json::json;

use crate::audit::{events, AuditError, AuditLog};
use crate::fileops::FileOpsError;
use crate::state::{LifecycleState, StateError, StateStore, TransitionMetadata};
use crate::staging::store::ArtifactStore;
use crate::timeout::Deadline;
use crate::version::{PackageVersion, VersionError};

use checks::{CheckContext, CheckKind};
pub use report::{CheckResult, ReportStore, ValidationReport, ValidationStatus};

/// Extra time a check thread gets beyond its budget, so a child process
/// killed at the deadline can still report.
const ISOLATION_GRACE: Duration = Duration::from_secs(3);

/// Errors from validation (check failures are not errors; they are
/// reported in the [`ValidationReport`])
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("{actor} may not validate: requires an executor acting on behalf of a human")]
    Authority { actor: String },

    #[error(transparent)]
    InvalidVersion(#[from] VersionError),

    #[error("active operation targets {active}, not {requested}")]
    VersionMismatch { active: String, requested: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl ValidatorError {
    pub fn is_corruption(&self) -> bool {
        match self {
            ValidatorError::State(e) => e.is_corruption(),
            ValidatorError::FileOps(e) => e.is_corruption(),
            ValidatorError::Audit(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// What the package declares about itself. Paths are relative to the
/// artifact directory (e.g. `source/setup.py`).
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub required_paths: Vec<String>,
    pub primary_module: Option<String>,
    /// argv template; `{env}`, `{source}`, `{artifact}`, `{version}`, `{module}`
    pub import_command: Vec<String>,
    pub config_files: Vec<String>,
    pub plugin_dir: Option<String>,
    pub templates: Vec<String>,
    /// None keeps subsystem_init a placeholder
    pub subsystem_command: Option<Vec<String>>,
    pub check_timeout: Duration,
    pub suite_timeout: Duration,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            required_paths: Vec::new(),
            primary_module: None,
            import_command: vec![
                "{env}/bin/python".to_string(),
                "-c".to_string(),
                "import {module}".to_string(),
            ],
            config_files: Vec::new(),
            plugin_dir: None,
            templates: Vec::new(),
            subsystem_command: None,
            check_timeout: Duration::from_secs(60),
            suite_timeout: Duration::from_secs(300),
        }
    }
}

/// Runs the suite and applies its verdict.
pub struct ArtifactValidator {
    state: Arc<StateStore>,
    store: ArtifactStore,
    reports: ReportStore,
    audit: AuditLog,
    settings: ValidationSettings,
}

impl ArtifactValidator {
    pub fn new(
        state: Arc<StateStore>,
        store: ArtifactStore,
        reports: ReportStore,
        audit: AuditLog,
        settings: ValidationSettings,
    ) -> Self {
        Self {
            state,
            store,
            reports,
            audit,
            settings,
        }
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    /// Validate the artifact for `version` and persist the report.
    pub fn validate(&self, version: &str, actor: &Actor) -> Result<ValidationReport, ValidatorError> {
        if !actor.is_human_initiated_executor() {
            return Err(ValidatorError::Authority {
                actor: actor.to_string(),
            });
        }
        let version = PackageVersion::parse(version)?;

        let guard = self.state.begin_operation()?;
        let record = self.state.current(&guard)?;
        let drives_state = match record.current_state {
            LifecycleState::Validating => {
                let active = record
                    .active_operation
                    .as_ref()
                    .map(|op| op.target_version.clone())
                    .unwrap_or_default();
                if active != version.to_string() {
                    return Err(ValidatorError::VersionMismatch {
                        active,
                        requested: version.to_string(),
                    });
                }
                true
            }
            LifecycleState::Staging => false,
            LifecycleState::FailedHard => return Err(StateError::TerminalState.into()),
            actual => {
                return Err(StateError::WrongState {
                    expected: "VALIDATING or STAGING".to_string(),
                    actual,
                }
                .into())
            }
        };

        let mut report = self.run_suite(&version);
        if drives_state {
            let record = if report.passed() {
                self.state.transition(
                    &guard,
                    LifecycleState::Promoting,
                    "VALIDATION_PASSED",
                    actor,
                    TransitionMetadata::default()
                        .details(json!({ "report_id": report.report_id })),
                )?
            } else {
                self.state.transition(
                    &guard,
                    LifecycleState::Failed,
                    "VALIDATION_FAILED",
                    actor,
                    TransitionMetadata::with_error(format!(
                        "validation failed: {}",
                        report.failed_checks.join(", ")
                    ))
                    .details(json!({
                        "report_id": report.report_id,
                        "failed_checks": report.failed_checks,
                    })),
                )?
            };
            report.transitioned_to = Some(record.current_state);
        }

        self.reports.persist(&report)?;
        self.audit.record(
            events::VALIDATION_COMPLETED,
            &actor.id,
            json!({
                "version": version,
                "report_id": report.report_id,
                "status": report.status,
                "failed_checks": report.failed_checks,
                "inspection_only": !drives_state,
                "elapsed_ms": report.elapsed_ms,
            }),
        )?;
        tracing::info!(
            %version,
            status = ?report.status,
            failed = report.failed_checks.len(),
            elapsed_ms = report.elapsed_ms,
            "validation finished"
        );
        Ok(report)
    }

    /// Run every check without touching state or persisting anything.
    pub fn run_suite(&self, version: &PackageVersion) -> ValidationReport {
        let started = Instant::now();
        let deadline = Deadline::after(self.settings.suite_timeout);
        let manifest = match self.store.read_manifest(version) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(%version, error = %e, "artifact manifest unreadable");
                None
            }
        };
        let artifact_hash = manifest.as_ref().map(|m| m.checksums.tree_hash.clone());

        let mut results = Vec::with_capacity(CheckKind::ALL.len());
        for kind in CheckKind::ALL {
            if deadline.is_expired() {
                tracing::warn!(check = %kind, "suite deadline passed; check not run");
                results.push(CheckResult::fail(
                    kind.name(),
                    "suite timeout exceeded before the check started",
                    json!({ "skipped": true }),
                ));
                continue;
            }
            let budget = deadline.cap(self.settings.check_timeout);
            let ctx = CheckContext {
                version: version.to_string(),
                artifact_dir: self.store.artifact_dir(version),
                manifest: manifest.clone(),
                settings: self.settings.clone(),
                timeout: budget,
            };
            let result = run_with_timeout(kind, ctx, budget);
            tracing::debug!(check = %kind, passed = result.passed, duration_ms = result.duration_ms, "check finished");
            results.push(result);
        }

        ValidationReport::new(
            version.clone(),
            results,
            artifact_hash,
            started.elapsed().as_millis() as u64,
        )
    }
}

/// Run one check on a worker thread. A check that overruns is reported as
/// failed; its thread is abandoned and its eventual result discarded.
fn run_with_timeout(kind: CheckKind, ctx: CheckContext, budget: Duration) -> CheckResult {
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("check-{}", kind))
        .spawn(move || {
            let _ = tx.send(kind.run(&ctx));
        });
    if let Err(e) = spawned {
        return CheckResult::fail(kind.name(), format!("cannot start check: {}", e), json!({}));
    }

    let mut result = match rx.recv_timeout(budget + ISOLATION_GRACE) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(check = %kind, budget_ms = budget.as_millis() as u64, "check timed out");
            CheckResult::fail(
                kind.name(),
                format!("timed out after {:.1}s", budget.as_secs_f64()),
                json!({ "timed_out": true }),
            )
        }
        Err(RecvTimeoutError::Disconnected) => {
            CheckResult::fail(kind.name(), "check panicked", json!({}))
        }
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}
