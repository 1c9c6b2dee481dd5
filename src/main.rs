//! Billy Lifecycle CLI
//!
//! Entry point for the `billy-lifecycle` command-line tool. Every
//! subcommand maps 1:1 onto a protocol [`Command`]; the JSON response
//! envelope is printed to stdout and the exit code follows it.

use std::path::PathBuf;
use std::process;

use billy_lifecycle::config::RetentionConfig;
use billy_lifecycle::{dispatch, telemetry, Lifecycle, LifecycleConfig, LifecycleError};
use clap::{Parser, Subcommand, ValueEnum};
use lifecycle_protocol::{
    Actor, Authority, Command, CommandError, CommandRequest, CommandResponse, LockScope,
};
use serde_json::json;

#[derive(Parser)]
#[command(name = "billy-lifecycle")]
#[command(about = "Governed fetch/build/validate/promote lifecycle for Billy's vendored package", version)]
struct Cli {
    /// Path to config file (default: ./lifecycle.toml if present)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Override paths.root
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Identifier of the caller
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    /// Authority level claimed by the caller
    #[arg(long, global = true, default_value = "observer")]
    authority: Authority,

    /// Human principal an executor acts for
    #[arg(long, global = true)]
    on_behalf_of: Option<String>,

    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Upgrade,
    Rollback,
}

impl From<ScopeArg> for LockScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Upgrade => LockScope::Upgrade,
            ScopeArg::Rollback => LockScope::Rollback,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show state, installed versions, approvals and staging progress
    Status,

    /// Explain the current state and what can happen next
    ExplainState,

    /// Request an upgrade to a released version
    RequestUpgrade {
        version: String,

        /// Replace a pending request for another version
        #[arg(long)]
        force_check: bool,

        /// Accept prerelease versions
        #[arg(long)]
        allow_prerelease: bool,
    },

    /// Show the pending upgrade request, if any
    PendingApprovals,

    /// Approve the pending upgrade (human only)
    ApproveUpgrade { version: String },

    /// Deny the pending upgrade (human only)
    DenyUpgrade {
        version: String,

        #[arg(long)]
        reason: String,
    },

    /// Fetch, build and checksum an approved version
    BeginStaging {
        version: String,

        /// Replace an existing artifact
        #[arg(long)]
        rebuild: bool,

        /// Check preconditions only
        #[arg(long)]
        dry_run: bool,
    },

    /// Show progress of the most recent staging run
    StagingStatus,

    /// Run the validation suite against a staged artifact
    Validate { version: String },

    /// Show the latest validation report
    Report {
        #[arg(long)]
        version: Option<String>,
    },

    /// List staged artifacts
    ListArtifacts,

    /// Remove old artifacts (current and known-good are always kept)
    CleanupArtifacts {
        /// Newest unprotected artifacts to keep (default: retention.default_keep)
        #[arg(long)]
        keep: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Clear a failure and return to IDLE (human only)
    ClearFailure {
        #[arg(long)]
        reason: Option<String>,
    },

    /// Confirm a completed promotion (human only)
    Confirm,

    /// Record promotion of the validated artifact
    Promote,

    /// Abandon the promotion and restore the known-good version
    Rollback {
        #[arg(long)]
        reason: String,
    },

    /// Lock upgrades or rollbacks (human only)
    Lock {
        #[arg(value_enum)]
        scope: ScopeArg,

        #[arg(long)]
        reason: String,
    },

    /// Release a lock (human only)
    Unlock {
        #[arg(value_enum)]
        scope: ScopeArg,
    },

    /// Show the most recent audit events
    Audit {
        #[arg(long, default_value_t = 50)]
        tail: usize,
    },
}

impl Commands {
    fn to_command(&self, default_keep: usize) -> Command {
        match self {
            Commands::Status => Command::Status {},
            Commands::ExplainState => Command::ExplainState {},
            Commands::RequestUpgrade {
                version,
                force_check,
                allow_prerelease,
            } => Command::RequestUpgrade {
                version: version.clone(),
                force_check: *force_check,
                allow_prerelease: *allow_prerelease,
            },
            Commands::PendingApprovals => Command::PendingApprovals {},
            Commands::ApproveUpgrade { version } => Command::ApproveUpgrade {
                version: version.clone(),
            },
            Commands::DenyUpgrade { version, reason } => Command::DenyUpgrade {
                version: version.clone(),
                reason: reason.clone(),
            },
            Commands::BeginStaging {
                version,
                rebuild,
                dry_run,
            } => Command::BeginStaging {
                version: version.clone(),
                rebuild: *rebuild,
                dry_run: *dry_run,
            },
            Commands::StagingStatus => Command::StagingStatus {},
            Commands::Validate { version } => Command::Validate {
                version: version.clone(),
            },
            Commands::Report { version } => Command::Report {
                version: version.clone(),
            },
            Commands::ListArtifacts => Command::ListArtifacts {},
            Commands::CleanupArtifacts { keep, dry_run } => Command::CleanupArtifacts {
                keep: keep.unwrap_or(default_keep),
                dry_run: *dry_run,
            },
            Commands::ClearFailure { reason } => Command::ClearFailure {
                reason: reason.clone(),
            },
            Commands::Confirm => Command::Confirm {},
            Commands::Promote => Command::Promote {},
            Commands::Rollback { reason } => Command::Rollback {
                reason: reason.clone(),
            },
            Commands::Lock { scope, reason } => Command::Lock {
                scope: (*scope).into(),
                reason: reason.clone(),
            },
            Commands::Unlock { scope } => Command::Unlock {
                scope: (*scope).into(),
            },
            Commands::Audit { tail } => Command::Audit { tail: *tail },
        }
    }
}

fn main() {
    let cli = Cli::parse();
    telemetry::init_logging(cli.json_logs);

    let request_id = telemetry::generate_request_id();
    let name = cli
        .command
        .to_command(RetentionConfig::default().default_keep)
        .name();

    let response = match run(&cli, &request_id) {
        Ok(response) => response,
        Err(err) => CommandResponse::error(request_id, name, err),
    };

    match serde_json::to_string_pretty(&response) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("Error serializing response: {}", e);
            process::exit(1);
        }
    }
    process::exit(response.exit_code());
}

/// Everything before dispatch that can fail: actor, config, wiring.
fn run(cli: &Cli, request_id: &str) -> Result<CommandResponse, CommandError> {
    let mut actor = Actor::new(cli.actor.clone(), cli.authority)
        .map_err(|e| CommandError::invalid_request(e.to_string()))?;
    if let Some(human) = &cli.on_behalf_of {
        actor = actor
            .on_behalf_of(human.clone())
            .map_err(|e| CommandError::invalid_request(e.to_string()))?;
    }

    let overrides = cli
        .root
        .as_ref()
        .map(|root| json!({ "paths": { "root": root.display().to_string() } }));
    let loaded = LifecycleConfig::load(cli.config.as_deref(), overrides)
        .map_err(|e| LifecycleError::from(e).to_command_error())?;
    for source in &loaded.sources {
        tracing::debug!(origin = ?source.origin, path = ?source.path, "config layer");
    }

    let command = cli
        .command
        .to_command(loaded.config.retention.default_keep);
    let lifecycle =
        Lifecycle::open_default(loaded.config).map_err(|e| e.to_command_error())?;

    Ok(dispatch(
        &lifecycle,
        CommandRequest::new(request_id, actor, command),
    ))
}
