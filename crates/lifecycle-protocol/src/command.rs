//! Lifecycle commands.
//!
//! Every front-end command maps 1:1 onto a variant here. Handlers match
//! exhaustively, so adding a variant without a handler fails to compile.

use serde::{Deserialize, Serialize};

use crate::authority::{Actor, Requirement};

/// Which lock flag a lock/unlock command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    Upgrade,
    Rollback,
}

/// A single lifecycle command.
///
/// Commands without arguments are empty struct variants so that
/// `deny_unknown_fields` applies to them too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Command {
    Status {},
    ExplainState {},
    RequestUpgrade {
        version: String,
        #[serde(default)]
        force_check: bool,
        #[serde(default)]
        allow_prerelease: bool,
    },
    PendingApprovals {},
    ApproveUpgrade {
        version: String,
    },
    DenyUpgrade {
        version: String,
        reason: String,
    },
    BeginStaging {
        version: String,
        #[serde(default)]
        rebuild: bool,
        #[serde(default)]
        dry_run: bool,
    },
    StagingStatus {},
    Validate {
        version: String,
    },
    Report {
        #[serde(default)]
        version: Option<String>,
    },
    ListArtifacts {},
    CleanupArtifacts {
        keep: usize,
        #[serde(default)]
        dry_run: bool,
    },
    ClearFailure {
        #[serde(default)]
        reason: Option<String>,
    },
    Confirm {},
    Promote {},
    Rollback {
        reason: String,
    },
    Lock {
        scope: LockScope,
        reason: String,
    },
    Unlock {
        scope: LockScope,
    },
    Audit {
        #[serde(default = "default_audit_tail")]
        tail: usize,
    },
}

fn default_audit_tail() -> usize {
    50
}

impl Command {
    /// Stable command name (kebab-case, matches the CLI subcommand).
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status {} => "status",
            Command::ExplainState {} => "explain-state",
            Command::RequestUpgrade { .. } => "request-upgrade",
            Command::PendingApprovals {} => "pending-approvals",
            Command::ApproveUpgrade { .. } => "approve-upgrade",
            Command::DenyUpgrade { .. } => "deny-upgrade",
            Command::BeginStaging { .. } => "begin-staging",
            Command::StagingStatus {} => "staging-status",
            Command::Validate { .. } => "validate",
            Command::Report { .. } => "report",
            Command::ListArtifacts {} => "list-artifacts",
            Command::CleanupArtifacts { .. } => "cleanup-artifacts",
            Command::ClearFailure { .. } => "clear-failure",
            Command::Confirm {} => "confirm",
            Command::Promote {} => "promote",
            Command::Rollback { .. } => "rollback",
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::Audit { .. } => "audit",
        }
    }

    /// Authority the caller must hold to run this command.
    pub fn requirement(&self) -> Requirement {
        match self {
            Command::Status {}
            | Command::ExplainState {}
            | Command::PendingApprovals {}
            | Command::StagingStatus {}
            | Command::Report { .. }
            | Command::ListArtifacts {}
            | Command::Audit { .. } => Requirement::Observer,

            Command::RequestUpgrade { .. } => Requirement::Operator,

            Command::BeginStaging { .. }
            | Command::Validate { .. }
            | Command::CleanupArtifacts { .. }
            | Command::Promote {}
            | Command::Rollback { .. } => Requirement::ExecutorForHuman,

            Command::ApproveUpgrade { .. }
            | Command::DenyUpgrade { .. }
            | Command::ClearFailure { .. }
            | Command::Confirm {}
            | Command::Lock { .. }
            | Command::Unlock { .. } => Requirement::Human,
        }
    }

    /// Whether the command only reads state.
    pub fn is_read_only(&self) -> bool {
        self.requirement() == Requirement::Observer
    }
}

/// Command envelope as received from a front-end.
///
/// Unknown keys are rejected by the flattened [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Envelope version
    pub protocol_version: u32,

    /// Caller-chosen correlation id
    pub request_id: String,

    /// Who is issuing the command
    pub actor: Actor,

    /// The command itself
    #[serde(flatten)]
    pub command: Command,
}

impl CommandRequest {
    pub fn new(request_id: impl Into<String>, actor: Actor, command: Command) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            request_id: request_id.into(),
            actor,
            command,
        }
    }
}
