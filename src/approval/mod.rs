//! Human-gated upgrade approval.
//!
//! A request records intent as `pending.json`. A human decision consumes
//! it: `approve` turns it into a time-limited grant in
//! `approvals/granted.json`, `deny` discards it. Nothing here touches the
//! lifecycle state; a grant only makes a later IDLE -> STAGING transition
//! admissible.

mod record;

pub use record::{
    compute_approval_id, ApprovalGrant, PendingApproval, SourceReference, GRANT_SCHEMA_ID,
    PENDING_SCHEMA_ID,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lifecycle_protocol::{Actor, Authority};
use serde_json::json;

use crate::audit::{events, AuditError, AuditLog};
use crate::fileops::{self, FileOpsError};
use crate::github::{GitHubError, ReleaseSource};
use crate::state::OperationGuard;
use crate::version::{PackageVersion, VersionError};

/// Errors from the approval workflow
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error(transparent)]
    InvalidVersion(#[from] VersionError),

    #[error("{requested} is not an upgrade from installed version {current}")]
    NotAnUpgrade {
        requested: PackageVersion,
        current: PackageVersion,
    },

    #[error("upgrades are locked: {reason}")]
    UpgradeLocked { reason: String },

    #[error("no release found for tag {tag}")]
    ReleaseNotFound { tag: String },

    #[error("release {tag} is not eligible: {reason}")]
    ReleaseNotEligible { tag: String, reason: String },

    #[error("release lookup failed: {0}")]
    Upstream(#[from] GitHubError),

    #[error("a pending approval for {existing} already exists (use force_check to replace it)")]
    PendingExists { existing: PackageVersion },

    #[error("no pending approval")]
    PendingMissing,

    #[error("pending approval is for {pending}, not {requested}")]
    VersionMismatch {
        pending: PackageVersion,
        requested: PackageVersion,
    },

    #[error("{actor} is not a human; approval decisions require human authority")]
    NotHuman { actor: String },

    #[error("no approval grant for {version}")]
    ApprovalMissing { version: PackageVersion },

    #[error("approval for {version} expired at {expired_at}")]
    ApprovalExpired {
        version: PackageVersion,
        expired_at: DateTime<Utc>,
    },

    #[error("approval {approval_id} no longer matches its request fields")]
    ApprovalDrift { approval_id: String },

    #[error("cannot compute approval id: {0}")]
    Hash(#[from] serde_json::Error),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl ApprovalError {
    pub fn is_corruption(&self) -> bool {
        match self {
            ApprovalError::FileOps(e) => e.is_corruption(),
            ApprovalError::Audit(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Options for `request_upgrade`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Replace a pending request for a different version
    pub force_check: bool,
    /// Accept prerelease versions and releases flagged as prerelease
    pub allow_prerelease: bool,
}

/// State the workflow consults but does not own.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub current_version: Option<PackageVersion>,
    /// `Some(reason)` when upgrades are locked
    pub upgrade_lock: Option<String>,
}

/// Request/approve/deny over the approvals directory.
pub struct ApprovalWorkflow {
    pending_path: PathBuf,
    grant_path: PathBuf,
    audit: AuditLog,
    releases: Arc<dyn ReleaseSource>,
    tag_prefix: String,
    ttl: chrono::Duration,
}

impl ApprovalWorkflow {
    pub fn new(
        approvals_dir: &Path,
        audit: AuditLog,
        releases: Arc<dyn ReleaseSource>,
        tag_prefix: &str,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            pending_path: approvals_dir.join("pending.json"),
            grant_path: approvals_dir.join("granted.json"),
            audit,
            releases,
            tag_prefix: tag_prefix.to_string(),
            ttl,
        }
    }

    /// The outstanding request, if any.
    pub fn get_pending(&self) -> Result<Option<PendingApproval>, ApprovalError> {
        Ok(fileops::read_document(&self.pending_path)?)
    }

    /// The unconsumed grant, if any.
    pub fn get_grant(&self) -> Result<Option<ApprovalGrant>, ApprovalError> {
        Ok(fileops::read_document(&self.grant_path)?)
    }

    /// Record a request to upgrade to `version`.
    pub fn request_upgrade(
        &self,
        _guard: &OperationGuard,
        version: &str,
        actor: &Actor,
        opts: RequestOptions,
        context: &RequestContext,
    ) -> Result<PendingApproval, ApprovalError> {
        if let Some(reason) = &context.upgrade_lock {
            return Err(ApprovalError::UpgradeLocked {
                reason: reason.clone(),
            });
        }

        let requested = PackageVersion::parse(version)?;
        if let Some(current) = &context.current_version {
            if !requested.is_upgrade_from(current) {
                return Err(ApprovalError::NotAnUpgrade {
                    requested,
                    current: current.clone(),
                });
            }
        }

        let existing = self.get_pending()?;
        if let Some(pending) = &existing {
            if !opts.force_check {
                if pending.version == requested {
                    tracing::info!(version = %requested, "upgrade already pending");
                    return Ok(pending.clone());
                }
                return Err(ApprovalError::PendingExists {
                    existing: pending.version.clone(),
                });
            }
        }

        let tag = requested.tag(&self.tag_prefix);
        let release = self
            .releases
            .release_by_tag(&tag)?
            .ok_or_else(|| ApprovalError::ReleaseNotFound { tag: tag.clone() })?;
        if release.draft {
            return Err(ApprovalError::ReleaseNotEligible {
                tag,
                reason: "release is a draft".to_string(),
            });
        }
        if (release.prerelease || requested.is_prerelease()) && !opts.allow_prerelease {
            return Err(ApprovalError::ReleaseNotEligible {
                tag,
                reason: "prerelease (pass allow_prerelease to accept)".to_string(),
            });
        }

        let pending = PendingApproval::new(
            requested.clone(),
            &actor.id,
            SourceReference {
                tag,
                release_url: release.html_url,
            },
        )?;
        fileops::write_document(&self.pending_path, &pending)?;

        let mut replaced = None;
        if let Some(previous) = existing.filter(|p| p.version != requested) {
            replaced = Some(previous.version.to_string());
        }
        let removed_grant = self.remove_grant_unless(&requested)?;

        self.audit.record(
            events::UPGRADE_REQUESTED,
            &actor.id,
            json!({
                "version": requested,
                "approval_id": pending.approval_id,
                "source_reference": pending.source_reference,
                "force_check": opts.force_check,
                "allow_prerelease": opts.allow_prerelease,
                "replaced": replaced,
                "stale_grant_removed": removed_grant,
            }),
        )?;
        tracing::info!(version = %requested, actor = %actor, "upgrade requested");
        Ok(pending)
    }

    /// Human approval: consume the pending request into a grant.
    pub fn approve(
        &self,
        _guard: &OperationGuard,
        version: &str,
        actor: &Actor,
    ) -> Result<ApprovalGrant, ApprovalError> {
        let pending = self.decidable_pending(version, actor)?;
        let grant = ApprovalGrant::from_pending(&pending, &actor.id, self.ttl);
        fileops::write_document(&self.grant_path, &grant)?;
        fileops::remove_if_exists(&self.pending_path)?;

        self.audit.record(
            events::APPROVAL_GRANTED,
            &actor.id,
            json!({
                "version": grant.version,
                "approval_id": grant.approval_id,
                "requested_by": grant.requested_by,
                "expires_at": grant.expires_at,
            }),
        )?;
        tracing::info!(version = %grant.version, actor = %actor, "upgrade approved");
        Ok(grant)
    }

    /// Human denial: discard the pending request.
    pub fn deny(
        &self,
        _guard: &OperationGuard,
        version: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<PendingApproval, ApprovalError> {
        let pending = self.decidable_pending(version, actor)?;
        fileops::remove_if_exists(&self.pending_path)?;
        let grant_removed = match self.get_grant()? {
            Some(grant) if grant.version == pending.version => {
                fileops::remove_if_exists(&self.grant_path)?
            }
            _ => false,
        };

        self.audit.record(
            events::APPROVAL_DENIED,
            &actor.id,
            json!({
                "version": pending.version,
                "approval_id": pending.approval_id,
                "reason": reason,
                "grant_removed": grant_removed,
            }),
        )?;
        tracing::info!(version = %pending.version, actor = %actor, "upgrade denied");
        Ok(pending)
    }

    /// Verify that a usable grant exists for `version`.
    pub fn check_grant(
        &self,
        version: &PackageVersion,
        now: DateTime<Utc>,
    ) -> Result<ApprovalGrant, ApprovalError> {
        let grant = self
            .get_grant()?
            .filter(|g| &g.version == version)
            .ok_or_else(|| ApprovalError::ApprovalMissing {
                version: version.clone(),
            })?;
        if grant.is_expired(now) {
            return Err(ApprovalError::ApprovalExpired {
                version: version.clone(),
                expired_at: grant.expires_at,
            });
        }
        if !grant.is_intact() {
            return Err(ApprovalError::ApprovalDrift {
                approval_id: grant.approval_id,
            });
        }
        Ok(grant)
    }

    /// Delete a grant once staging has started from it.
    pub fn consume_grant(
        &self,
        _guard: &OperationGuard,
        grant: &ApprovalGrant,
        actor: &Actor,
        build_id: &str,
    ) -> Result<(), ApprovalError> {
        fileops::remove_if_exists(&self.grant_path)?;
        self.audit.record(
            events::APPROVAL_CONSUMED,
            &actor.id,
            json!({
                "version": grant.version,
                "approval_id": grant.approval_id,
                "build_id": build_id,
            }),
        )?;
        Ok(())
    }

    fn decidable_pending(
        &self,
        version: &str,
        actor: &Actor,
    ) -> Result<PendingApproval, ApprovalError> {
        if actor.authority != Authority::Human {
            return Err(ApprovalError::NotHuman {
                actor: actor.to_string(),
            });
        }
        let requested = PackageVersion::parse(version)?;
        let pending = self.get_pending()?.ok_or(ApprovalError::PendingMissing)?;
        if pending.version != requested {
            return Err(ApprovalError::VersionMismatch {
                pending: pending.version,
                requested,
            });
        }
        if !pending.is_intact() {
            return Err(ApprovalError::ApprovalDrift {
                approval_id: pending.approval_id,
            });
        }
        Ok(pending)
    }

    fn remove_grant_unless(&self, keep: &PackageVersion) -> Result<bool, ApprovalError> {
        match self.get_grant()? {
            Some(grant) if &grant.version != keep => {
                Ok(fileops::remove_if_exists(&self.grant_path)?)
            }
            _ => Ok(false),
        }
    }
}
