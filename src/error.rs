//! Crate-level error and its mapping onto the command taxonomy.

use lifecycle_protocol::{CommandError, ErrorClass, ReasonCode};
use serde_json::json;

use crate::approval::ApprovalError;
use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::fileops::FileOpsError;
use crate::github::GitHubError;
use crate::staging::store::StoreError;
use crate::staging::{PipelineFailure, StagingError};
use crate::state::StateError;
use crate::validator::{ValidationReport, ValidatorError};
use crate::version::VersionError;

/// Any failure surfaced by a lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Validator(#[from] ValidatorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    /// The suite ran and at least one check failed; state is now FAILED.
    #[error("validation failed: {}", .report.failed_checks.join(", "))]
    ValidationFailed { report: Box<ValidationReport> },

    #[error("rollbacks are locked: {reason}")]
    RollbackLocked { reason: String },

    #[error("no known-good artifact to roll back to; state is now FAILED_HARD")]
    NoKnownGood,

    #[error("{command} requires {required} authority, caller is {actor}")]
    Unauthorized {
        command: String,
        required: String,
        actor: String,
    },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LifecycleError {
    /// True when the error means a persisted document is unreadable.
    pub fn is_corruption(&self) -> bool {
        self.classify().0 == ErrorClass::Corruption
    }

    pub fn classify(&self) -> (ErrorClass, ReasonCode) {
        match self {
            LifecycleError::Config(_) => (ErrorClass::Validation, ReasonCode::InvalidRequest),
            LifecycleError::Version(_) => (ErrorClass::Validation, ReasonCode::InvalidVersion),
            LifecycleError::State(e) => state(e),
            LifecycleError::Approval(e) => approval(e),
            LifecycleError::Staging(e) => staging(e),
            LifecycleError::Validator(e) => validator(e),
            LifecycleError::Store(e) => store(e),
            LifecycleError::GitHub(e) => github(e),
            LifecycleError::FileOps(e) => fileops(e),
            LifecycleError::Audit(e) => audit(e),
            LifecycleError::ValidationFailed { .. } => {
                (ErrorClass::Pipeline, ReasonCode::ValidationFailed)
            }
            LifecycleError::RollbackLocked { .. } => {
                (ErrorClass::Precondition, ReasonCode::RollbackLocked)
            }
            LifecycleError::NoKnownGood => (ErrorClass::Pipeline, ReasonCode::NoKnownGood),
            LifecycleError::Unauthorized { .. } => {
                (ErrorClass::Authority, ReasonCode::AuthorityInsufficient)
            }
            LifecycleError::InvalidRequest(_) => {
                (ErrorClass::Validation, ReasonCode::InvalidRequest)
            }
            LifecycleError::Encode(_) => (ErrorClass::Internal, ReasonCode::Internal),
        }
    }

    /// Structured form returned to front-ends.
    pub fn to_command_error(&self) -> CommandError {
        let (class, code) = self.classify();
        let err = CommandError::new(class, code, self.to_string());
        match self {
            LifecycleError::ValidationFailed { report } => err.with_data(json!({
                "failed_checks": report.failed_checks,
                "report": report,
            })),
            LifecycleError::State(StateError::WrongState { expected, actual }) => {
                err.with_data(json!({ "expected": expected, "actual": actual }))
            }
            LifecycleError::Staging(StagingError::StageFailed { stage, .. }) => {
                err.with_data(json!({ "stage": stage }))
            }
            _ => err,
        }
    }
}

/// Reason code an approval rejection maps to.
pub(crate) fn approval_reason(e: &ApprovalError) -> ReasonCode {
    approval(e).1
}

fn fileops(e: &FileOpsError) -> (ErrorClass, ReasonCode) {
    match e {
        FileOpsError::Corrupt { .. } => (ErrorClass::Corruption, ReasonCode::DocumentCorrupt),
        FileOpsError::InvalidDocument { .. } => {
            (ErrorClass::Validation, ReasonCode::SchemaViolation)
        }
        FileOpsError::Io { .. } => (ErrorClass::Internal, ReasonCode::Internal),
    }
}

fn audit(e: &AuditError) -> (ErrorClass, ReasonCode) {
    match e {
        AuditError::FileOps(e) => fileops(e),
        AuditError::CorruptLine { .. } => (ErrorClass::Corruption, ReasonCode::DocumentCorrupt),
    }
}

fn github(e: &GitHubError) -> (ErrorClass, ReasonCode) {
    match e {
        GitHubError::InvalidInput { .. } => (ErrorClass::Validation, ReasonCode::InvalidRequest),
        GitHubError::Http { .. } | GitHubError::Decode(_) => {
            (ErrorClass::Internal, ReasonCode::UpstreamUnavailable)
        }
    }
}

fn state(e: &StateError) -> (ErrorClass, ReasonCode) {
    use ErrorClass::*;
    match e {
        StateError::EdgeNotAllowed { .. } => (Precondition, ReasonCode::EdgeNotAllowed),
        StateError::TerminalState => (Precondition, ReasonCode::TerminalState),
        StateError::Authority { .. } => (Authority, ReasonCode::AuthorityInsufficient),
        StateError::MissingOperation { .. } | StateError::InvariantViolation(_) => {
            (Internal, ReasonCode::Internal)
        }
        StateError::WrongState { .. } => (Precondition, ReasonCode::WrongState),
        StateError::OperationInFlight(_) => (Precondition, ReasonCode::OperationInFlight),
        StateError::Corrupt(_) => (Corruption, ReasonCode::DocumentCorrupt),
        StateError::FileOps(e) => fileops(e),
        StateError::Audit(e) => audit(e),
    }
}

fn approval(e: &ApprovalError) -> (ErrorClass, ReasonCode) {
    use ErrorClass::*;
    match e {
        ApprovalError::InvalidVersion(_) => (Validation, ReasonCode::InvalidVersion),
        ApprovalError::NotAnUpgrade { .. } => (Precondition, ReasonCode::NotAnUpgrade),
        ApprovalError::UpgradeLocked { .. } => (Precondition, ReasonCode::UpgradeLocked),
        ApprovalError::ReleaseNotFound { .. } => (Precondition, ReasonCode::ReleaseNotFound),
        ApprovalError::ReleaseNotEligible { .. } => {
            (Precondition, ReasonCode::ReleaseNotEligible)
        }
        ApprovalError::Upstream(e) => github(e),
        ApprovalError::PendingExists { .. } => (Precondition, ReasonCode::PendingExists),
        ApprovalError::PendingMissing => (Precondition, ReasonCode::PendingMissing),
        ApprovalError::VersionMismatch { .. } => (Precondition, ReasonCode::VersionMismatch),
        ApprovalError::NotHuman { .. } => (Authority, ReasonCode::AuthorityInsufficient),
        ApprovalError::ApprovalMissing { .. } => (Precondition, ReasonCode::ApprovalMissing),
        ApprovalError::ApprovalExpired { .. } => (Precondition, ReasonCode::ApprovalExpired),
        ApprovalError::ApprovalDrift { .. } => (Precondition, ReasonCode::ApprovalDrift),
        ApprovalError::Hash(_) => (Internal, ReasonCode::Internal),
        ApprovalError::FileOps(e) => fileops(e),
        ApprovalError::Audit(e) => audit(e),
    }
}

fn store(e: &StoreError) -> (ErrorClass, ReasonCode) {
    match e {
        StoreError::ArtifactExists { .. } => (ErrorClass::Precondition, ReasonCode::ArtifactExists),
        StoreError::ArtifactMissing { .. } => {
            (ErrorClass::Precondition, ReasonCode::ArtifactMissing)
        }
        StoreError::ScratchExists(_) => (ErrorClass::Internal, ReasonCode::Internal),
        StoreError::FileOps(e) => fileops(e),
    }
}

fn staging(e: &StagingError) -> (ErrorClass, ReasonCode) {
    use ErrorClass::*;
    match e {
        StagingError::Authority { .. } => (Authority, ReasonCode::AuthorityInsufficient),
        StagingError::UpgradeLocked { .. } => (Precondition, ReasonCode::UpgradeLocked),
        StagingError::InvalidVersion(_) => (Validation, ReasonCode::InvalidVersion),
        StagingError::ArtifactExists { .. } => (Precondition, ReasonCode::ArtifactExists),
        StagingError::StageFailed { failure, .. } => (Pipeline, pipeline_code(*failure)),
        StagingError::State(e) => state(e),
        StagingError::Approval(e) => approval(e),
        StagingError::Store(e) => store(e),
        StagingError::FileOps(e) => fileops(e),
        StagingError::Audit(e) => audit(e),
    }
}

fn pipeline_code(failure: PipelineFailure) -> ReasonCode {
    match failure {
        PipelineFailure::FetchFailed => ReasonCode::FetchFailed,
        PipelineFailure::CommitMismatch => ReasonCode::CommitMismatch,
        PipelineFailure::UpstreamUnavailable => ReasonCode::UpstreamUnavailable,
        PipelineFailure::BuildFailed => ReasonCode::BuildFailed,
        PipelineFailure::ChecksumFailed => ReasonCode::ChecksumFailed,
        PipelineFailure::FinalizeFailed => ReasonCode::FinalizeFailed,
        PipelineFailure::Internal => ReasonCode::Internal,
    }
}

fn validator(e: &ValidatorError) -> (ErrorClass, ReasonCode) {
    match e {
        ValidatorError::Authority { .. } => {
            (ErrorClass::Authority, ReasonCode::AuthorityInsufficient)
        }
        ValidatorError::InvalidVersion(_) => (ErrorClass::Validation, ReasonCode::InvalidVersion),
        ValidatorError::VersionMismatch { .. } => {
            (ErrorClass::Precondition, ReasonCode::VersionMismatch)
        }
        ValidatorError::State(e) => state(e),
        ValidatorError::FileOps(e) => fileops(e),
        ValidatorError::Audit(e) => audit(e),
    }
}
