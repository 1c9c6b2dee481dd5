//! Error types for the command surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy. Every rejection belongs to exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Malformed input or schema violation on write; no state change
    Validation,
    /// Actor lacks the required authority level
    Authority,
    /// Wrong state, missing approval, existing artifact, lock held
    Precondition,
    /// Fetch/build/checksum/finalize failure; state moved to FAILED
    Pipeline,
    /// A persisted document failed validation on read; state forced to FAILED_HARD
    Corruption,
    /// Filesystem or environment failure outside the taxonomy above
    Internal,
}

/// Stable reason codes returned to front-ends.
///
/// These codes are used for automation and must not be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    InvalidVersion,
    InvalidRequest,
    SchemaViolation,
    AuthorityInsufficient,
    WrongState,
    EdgeNotAllowed,
    TerminalState,
    OperationInFlight,
    ReleaseNotFound,
    ReleaseNotEligible,
    NotAnUpgrade,
    PendingExists,
    PendingMissing,
    VersionMismatch,
    ApprovalMissing,
    ApprovalExpired,
    ApprovalDrift,
    ArtifactExists,
    ArtifactMissing,
    UpgradeLocked,
    RollbackLocked,
    NoKnownGood,
    FetchFailed,
    CommitMismatch,
    BuildFailed,
    ChecksumFailed,
    FinalizeFailed,
    ValidationFailed,
    DocumentCorrupt,
    UpstreamUnavailable,
    Internal,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidVersion => "INVALID_VERSION",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::AuthorityInsufficient => "AUTHORITY_INSUFFICIENT",
            Self::WrongState => "WRONG_STATE",
            Self::EdgeNotAllowed => "EDGE_NOT_ALLOWED",
            Self::TerminalState => "TERMINAL_STATE",
            Self::OperationInFlight => "OPERATION_IN_FLIGHT",
            Self::ReleaseNotFound => "RELEASE_NOT_FOUND",
            Self::ReleaseNotEligible => "RELEASE_NOT_ELIGIBLE",
            Self::NotAnUpgrade => "NOT_AN_UPGRADE",
            Self::PendingExists => "PENDING_EXISTS",
            Self::PendingMissing => "PENDING_MISSING",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::ApprovalMissing => "APPROVAL_MISSING",
            Self::ApprovalExpired => "APPROVAL_EXPIRED",
            Self::ApprovalDrift => "APPROVAL_DRIFT",
            Self::ArtifactExists => "ARTIFACT_EXISTS",
            Self::ArtifactMissing => "ARTIFACT_MISSING",
            Self::UpgradeLocked => "UPGRADE_LOCKED",
            Self::RollbackLocked => "ROLLBACK_LOCKED",
            Self::NoKnownGood => "NO_KNOWN_GOOD",
            Self::FetchFailed => "FETCH_FAILED",
            Self::CommitMismatch => "COMMIT_MISMATCH",
            Self::BuildFailed => "BUILD_FAILED",
            Self::ChecksumFailed => "CHECKSUM_FAILED",
            Self::FinalizeFailed => "FINALIZE_FAILED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::DocumentCorrupt => "DOCUMENT_CORRUPT",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured rejection returned for every failed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandError {
    /// Taxonomy class
    pub class: ErrorClass,
    /// Stable reason code
    pub code: ReasonCode,
    /// Human-readable, single-line message
    pub message: String,
    /// Optional machine-readable details (expected vs actual values)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandError {
    pub fn new(class: ErrorClass, code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create an AUTHORITY_INSUFFICIENT error.
    pub fn authority(command: &str, required: &str, actual: &str) -> Self {
        Self::new(
            ErrorClass::Authority,
            ReasonCode::AuthorityInsufficient,
            format!("{} requires {} authority, caller has {}", command, required, actual),
        )
        .with_data(serde_json::json!({
            "command": command,
            "required": required,
            "actual": actual,
        }))
    }

    /// Create an INVALID_REQUEST error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, ReasonCode::InvalidRequest, message)
    }

    /// Whether the system is now in an unrecoverable state.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self.class, ErrorClass::Corruption)
            || matches!(self.code, ReasonCode::TerminalState | ReasonCode::NoKnownGood)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_display_matches_serde() {
        for code in [
            ReasonCode::AuthorityInsufficient,
            ReasonCode::OperationInFlight,
            ReasonCode::DocumentCorrupt,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn test_authority_error_data() {
        let err = CommandError::authority("clear-failure", "human", "executor");
        assert_eq!(err.class, ErrorClass::Authority);
        assert_eq!(err.code, ReasonCode::AuthorityInsufficient);
        assert_eq!(err.data.as_ref().unwrap()["required"], "human");
        assert!(err.to_string().starts_with("AUTHORITY_INSUFFICIENT"));
    }

    #[test]
    fn test_unrecoverable() {
        let err = CommandError::new(
            ErrorClass::Corruption,
            ReasonCode::DocumentCorrupt,
            "state.json failed validation",
        );
        assert!(err.is_unrecoverable());
        assert!(!CommandError::invalid_request("bad").is_unrecoverable());
    }
}
