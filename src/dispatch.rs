//! Command dispatcher.
//!
//! Routes a [`CommandRequest`] to its lifecycle operation and wraps the
//! outcome in a [`CommandResponse`]. The match over [`Command`] is
//! exhaustive, so a new command without a handler does not compile.

use lifecycle_protocol::{
    Actor, Command, CommandError, CommandRequest, CommandResponse, ErrorClass, ReasonCode,
    PROTOCOL_VERSION,
};
use serde_json::{json, Value};

use crate::approval::RequestOptions;
use crate::audit::events;
use crate::error::LifecycleError;
use crate::lifecycle::Lifecycle;
use crate::staging::BeginOptions;
use crate::state::LifecycleState;

/// Execute one request. Never panics and never returns a bare error: every
/// outcome is a response envelope.
pub fn dispatch(lifecycle: &Lifecycle, request: CommandRequest) -> CommandResponse {
    let CommandRequest {
        protocol_version,
        request_id,
        actor,
        command,
    } = request;
    let name = command.name();

    if protocol_version != PROTOCOL_VERSION {
        return CommandResponse::error(
            request_id,
            name,
            CommandError::invalid_request(format!(
                "unsupported protocol_version {} (expected {})",
                protocol_version, PROTOCOL_VERSION
            )),
        );
    }

    let requirement = command.requirement();
    if !requirement.permits(&actor) {
        tracing::warn!(command = name, actor = %actor, required = requirement.describe(), "command rejected: authority");
        journal_rejection(lifecycle, &actor, name, "AUTHORITY_INSUFFICIENT");
        return CommandResponse::error(
            request_id,
            name,
            CommandError::authority(name, requirement.describe(), actor.authority.as_str()),
        );
    }

    if !command.is_read_only() {
        if let Ok(record) = lifecycle.state_store().read() {
            if record.current_state.is_terminal() {
                journal_rejection(lifecycle, &actor, name, "TERMINAL_STATE");
                return CommandResponse::error(
                    request_id,
                    name,
                    CommandError::new(
                        ErrorClass::Precondition,
                        ReasonCode::TerminalState,
                        "state is FAILED_HARD; manual out-of-band repair is required",
                    ),
                );
            }
        }
    }

    tracing::debug!(command = name, actor = %actor, %request_id, "dispatching command");
    match execute(lifecycle, &actor, &command) {
        Ok(result) => CommandResponse::success(request_id, name, result),
        Err(err) => {
            if err.is_corruption() {
                tracing::error!(command = name, error = %err, "corrupt document detected");
                if let Err(e) = lifecycle.quarantine(&err.to_string()) {
                    tracing::error!(error = %e, "failed to force FAILED_HARD");
                }
            } else {
                tracing::info!(command = name, error = %err, "command failed");
            }
            CommandResponse::error(request_id, name, err.to_command_error())
        }
    }
}

fn execute(lc: &Lifecycle, actor: &Actor, command: &Command) -> Result<Value, LifecycleError> {
    let value = match command {
        Command::Status {} => serde_json::to_value(lc.status()?)?,
        Command::ExplainState {} => serde_json::to_value(lc.explain_state()?)?,
        Command::RequestUpgrade {
            version,
            force_check,
            allow_prerelease,
        } => {
            let opts = RequestOptions {
                force_check: *force_check,
                allow_prerelease: *allow_prerelease,
            };
            serde_json::to_value(lc.request_upgrade(version, actor, opts)?)?
        }
        Command::PendingApprovals {} => {
            json!({ "pending": lc.pending_approvals()? })
        }
        Command::ApproveUpgrade { version } => serde_json::to_value(lc.approve(version, actor)?)?,
        Command::DenyUpgrade { version, reason } => {
            serde_json::to_value(lc.deny(version, actor, reason)?)?
        }
        Command::BeginStaging {
            version,
            rebuild,
            dry_run,
        } => {
            let opts = BeginOptions {
                rebuild: *rebuild,
                dry_run: *dry_run,
            };
            serde_json::to_value(lc.begin_staging(version, actor, opts)?)?
        }
        Command::StagingStatus {} => json!({ "staging": lc.staging_status()? }),
        Command::Validate { version } => {
            let report = lc.validate(version, actor)?;
            if !report.passed() && report.transitioned_to == Some(LifecycleState::Failed) {
                return Err(LifecycleError::ValidationFailed {
                    report: Box::new(report),
                });
            }
            serde_json::to_value(report)?
        }
        Command::Report { version } => serde_json::to_value(lc.report(version.as_deref())?)?,
        Command::ListArtifacts {} => json!({ "artifacts": lc.list_artifacts()? }),
        Command::CleanupArtifacts { keep, dry_run } => {
            serde_json::to_value(lc.cleanup_artifacts(*keep, *dry_run, actor)?)?
        }
        Command::ClearFailure { reason } => {
            serde_json::to_value(lc.clear_failure(actor, reason.as_deref())?)?
        }
        Command::Confirm {} => serde_json::to_value(lc.confirm(actor)?)?,
        Command::Promote {} => serde_json::to_value(lc.promote(actor)?)?,
        Command::Rollback { reason } => serde_json::to_value(lc.rollback(actor, reason)?)?,
        Command::Lock { scope, reason } => {
            json!({ "locks": lc.lock(actor, *scope, reason)? })
        }
        Command::Unlock { scope } => json!({ "locks": lc.unlock(actor, *scope)? }),
        Command::Audit { tail } => json!({ "events": lc.audit_tail(*tail)? }),
    };
    Ok(value)
}

fn journal_rejection(lc: &Lifecycle, actor: &Actor, command: &str, code: &str) {
    let result = lc.audit_log().record(
        events::COMMAND_REJECTED,
        &actor.id,
        json!({ "command": command, "actor": actor.to_string(), "reason_code": code }),
    );
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to journal command rejection");
    }
}
