//! End-to-end lifecycle scenarios.
//!
//! Each test drives a `Lifecycle` over a temp root with in-memory release,
//! fetch and build collaborators, and checks state, documents and the audit
//! journal after every step.

mod fixtures;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use billy_lifecycle::approval::{ApprovalError, RequestOptions};
use billy_lifecycle::audit::events;
use billy_lifecycle::dispatch;
use billy_lifecycle::error::LifecycleError;
use billy_lifecycle::mock::{FailureConfig, ScriptedBuilder};
use billy_lifecycle::staging::status::StagingStage;
use billy_lifecycle::staging::{BeginOptions, PipelineFailure, StagingError};
use billy_lifecycle::state::{LifecycleState, StateError};
use billy_lifecycle::validator::report::ValidationStatus;
use billy_lifecycle::PackageVersion;
use fixtures::{alice, bot, viewer, Fixture};
use lifecycle_protocol::{Command, CommandRequest, LockScope, ReasonCode};

fn v(s: &str) -> PackageVersion {
    PackageVersion::parse(s).unwrap()
}

// =============================================================================
// Request and approval
// =============================================================================

#[test]
fn test_request_and_approve_leave_state_idle() {
    let fx = Fixture::new();

    let pending = fx
        .lifecycle
        .request_upgrade("1.2.0", &alice(), RequestOptions::default())
        .unwrap();
    assert_eq!(pending.version, v("1.2.0"));
    assert_eq!(
        fx.lifecycle.pending_approvals().unwrap().map(|p| p.version),
        Some(v("1.2.0"))
    );
    assert_eq!(fx.state(), LifecycleState::Idle);

    fx.lifecycle.approve("1.2.0", &alice()).unwrap();
    assert!(
        fx.lifecycle.pending_approvals().unwrap().is_none(),
        "approval should consume the pending request"
    );
    assert_eq!(fx.state(), LifecycleState::Idle, "approval never transitions");

    let audit = fx.lifecycle.audit_log();
    assert_eq!(audit.events_of_type(events::UPGRADE_REQUESTED).unwrap().len(), 1);
    assert_eq!(audit.events_of_type(events::APPROVAL_GRANTED).unwrap().len(), 1);
}

#[test]
fn test_downgrade_request_is_rejected_and_journaled() {
    let fx = Fixture::builder().release("v1.0.0", false, false).build();

    let err = fx
        .lifecycle
        .request_upgrade("1.0.0", &alice(), RequestOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Approval(ApprovalError::NotAnUpgrade { .. })
    ));

    let rejected = fx
        .lifecycle
        .audit_log()
        .events_of_type(events::UPGRADE_REQUEST_REJECTED)
        .unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].details["reason_code"], "NOT_AN_UPGRADE");
}

#[test]
fn test_draft_release_is_not_eligible() {
    let fx = Fixture::builder().release("v2.0.0", true, false).build();
    let err = fx
        .lifecycle
        .request_upgrade("2.0.0", &alice(), RequestOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::ReleaseNotEligible);
}

#[test]
fn test_upgrade_lock_blocks_requests_until_unlocked() {
    let fx = Fixture::new();
    fx.lifecycle
        .lock(&alice(), LockScope::Upgrade, "release freeze")
        .unwrap();

    let err = fx
        .lifecycle
        .request_upgrade("1.2.0", &alice(), RequestOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::UpgradeLocked);

    let locks = fx.lifecycle.unlock(&alice(), LockScope::Upgrade).unwrap();
    assert!(!locks.upgrade_locked);
    assert!(locks.lock_reason.is_none());
    fx.lifecycle
        .request_upgrade("1.2.0", &alice(), RequestOptions::default())
        .unwrap();
}

#[test]
fn test_only_humans_may_lock() {
    let fx = Fixture::new();
    let err = fx
        .lifecycle
        .lock(&bot(), LockScope::Rollback, "nope")
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Unauthorized { .. }));
    let locks = fx.lifecycle.state_store().read().unwrap().locks;
    assert!(!locks.rollback_locked);
}

// =============================================================================
// Staging
// =============================================================================

#[test]
fn test_staging_with_approval_ends_in_validating() {
    let fx = Fixture::new();
    let outcome = fx.stage("1.2.0");

    assert_eq!(outcome.state, LifecycleState::Validating);
    let tree_hash = outcome.tree_hash.clone().unwrap();
    assert_eq!(tree_hash.len(), 64);

    let manifest = fx
        .lifecycle
        .artifact_store()
        .read_manifest(&v("1.2.0"))
        .unwrap()
        .unwrap();
    assert_eq!(manifest.checksums.tree_hash, tree_hash);
    assert_eq!(manifest.tag, "v1.2.0");
    assert!(manifest.checksums.files.contains_key("setup.py"));

    let record = fx.lifecycle.state_store().read().unwrap();
    let op = record.active_operation.unwrap();
    assert_eq!(op.target_version, "1.2.0");
    assert_eq!(op.build_id, outcome.build_id);

    assert!(fx.scratch_entries().is_empty(), "scratch should be moved into place");
    assert_eq!(fx.builder.builds(), vec!["1.2.0".to_string()]);
}

#[test]
fn test_staging_without_approval_is_refused() {
    let fx = Fixture::new();
    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::ApprovalMissing);
    assert_eq!(fx.state(), LifecycleState::Idle);
    assert!(fx.fetcher.fetches().is_empty());
}

#[test]
fn test_dry_run_touches_nothing() {
    let fx = Fixture::new();
    fx.approve("1.2.0");
    let outcome = fx
        .lifecycle
        .begin_staging(
            "1.2.0",
            &bot(),
            BeginOptions {
                rebuild: false,
                dry_run: true,
            },
        )
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(fx.state(), LifecycleState::Idle);
    assert!(fx.fetcher.fetches().is_empty());
    assert!(!fx.lifecycle.artifact_store().exists(&v("1.2.0")));

    // The grant is still usable.
    let real = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap();
    assert_eq!(real.state, LifecycleState::Validating);
}

#[test]
fn test_build_failure_ends_in_failed_without_scratch() {
    let fx = Fixture::new();
    fx.builder.inject(FailureConfig::error("make: *** [all] Error 2"));
    fx.approve("1.2.0");

    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    match err {
        LifecycleError::Staging(StagingError::StageFailed { stage, failure, .. }) => {
            assert_eq!(stage, StagingStage::Build);
            assert_eq!(failure, PipelineFailure::BuildFailed);
        }
        other => panic!("unexpected error: {other}"),
    }

    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.current_state, LifecycleState::Failed);
    assert!(record.active_operation.is_none());
    let failure = record.last_failure.unwrap();
    assert_eq!(failure.state, Some(LifecycleState::Staging));
    assert!(!failure.cleared);

    assert!(fx.scratch_entries().is_empty(), "scratch left behind");
    assert!(!fx.lifecycle.artifact_store().exists(&v("1.2.0")));
}

#[test]
fn test_fetch_failure_is_reported_at_fetch_stage() {
    let fx = Fixture::new();
    fx.fetcher.inject(FailureConfig::error("connection reset"));
    fx.approve("1.2.0");

    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Staging(StagingError::StageFailed {
            stage: StagingStage::Fetch,
            ..
        })
    ));
    assert_eq!(fx.state(), LifecycleState::Failed);
    assert!(fx.scratch_entries().is_empty());
    assert!(fx.builder.builds().is_empty());
}

#[test]
fn test_moved_tag_fails_commit_check() {
    let fx = Fixture::new();
    fx.fetcher.report_commit("0000000000000000000000000000000000000000");
    fx.approve("1.2.0");

    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::CommitMismatch);
    assert_eq!(fx.state(), LifecycleState::Failed);
}

#[test]
fn test_existing_artifact_requires_rebuild() {
    let fx = Fixture::new();
    fx.install("1.2.0");
    fx.stage("1.3.0");
    fx.lifecycle.validate("1.3.0", &bot()).unwrap();
    fx.lifecycle.rollback(&bot(), "abandon").unwrap();
    assert!(fx.lifecycle.artifact_store().exists(&v("1.3.0")));

    fx.approve("1.3.0");
    let err = fx
        .lifecycle
        .begin_staging("1.3.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::ArtifactExists);
    assert_eq!(fx.state(), LifecycleState::Idle);

    let outcome = fx
        .lifecycle
        .begin_staging(
            "1.3.0",
            &bot(),
            BeginOptions {
                rebuild: true,
                dry_run: false,
            },
        )
        .unwrap();
    assert_eq!(outcome.state, LifecycleState::Validating);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validation_pass_moves_to_promoting() {
    let fx = Fixture::new();
    fx.stage("1.2.0");

    let report = fx.lifecycle.validate("1.2.0", &bot()).unwrap();
    assert_eq!(report.status, ValidationStatus::Passed);
    assert!(report.failed_checks.is_empty());
    assert_eq!(report.transitioned_to, Some(LifecycleState::Promoting));
    assert_eq!(fx.state(), LifecycleState::Promoting);

    let view = fx.lifecycle.report(Some("1.2.0")).unwrap();
    assert_eq!(view.report.map(|r| r.report_id), Some(report.report_id));
    assert_eq!(view.history.len(), 1);
}

#[test]
fn test_missing_required_file_fails_validation() {
    let fx = Fixture::builder().require("source/README.md").build();
    fx.stage("1.2.0");

    let report = fx.lifecycle.validate("1.2.0", &bot()).unwrap();
    assert_eq!(report.status, ValidationStatus::Failed);
    let structural = report.check("structural_integrity").unwrap();
    assert!(!structural.passed);
    assert!(structural.error.as_deref().unwrap().contains("README.md"));
    assert_eq!(report.transitioned_to, Some(LifecycleState::Failed));

    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.current_state, LifecycleState::Failed);
    assert_eq!(record.previous_state, Some(LifecycleState::Validating));
    assert_eq!(
        record.last_failure.unwrap().state,
        Some(LifecycleState::Validating)
    );
}

#[test]
fn test_failed_validation_via_dispatch_carries_report() {
    let fx = Fixture::builder().require("source/README.md").build();
    fx.stage("1.2.0");

    let resp = dispatch(
        &fx.lifecycle,
        CommandRequest::new(
            "req-validate",
            bot(),
            Command::Validate {
                version: "1.2.0".into(),
            },
        ),
    );
    assert!(!resp.ok);
    assert_eq!(resp.exit_code(), 1);
    let err = resp.error.unwrap();
    assert_eq!(err.code, ReasonCode::ValidationFailed);
    let data = err.data.unwrap();
    assert_eq!(data["failed_checks"][0], "structural_integrity");
    assert_eq!(data["report"]["status"], "FAILED");
}

#[test]
fn test_validate_wrong_version_is_refused() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    let err = fx.lifecycle.validate("1.3.0", &bot()).unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::VersionMismatch);
    assert_eq!(fx.state(), LifecycleState::Validating);
}

#[test]
fn test_humans_cannot_validate_directly() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    let err = fx.lifecycle.validate("1.2.0", &alice()).unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::AuthorityInsufficient);
}

// =============================================================================
// Promotion, confirmation, rollback
// =============================================================================

#[test]
fn test_promote_and_confirm_update_versions() {
    let fx = Fixture::new();
    fx.promote("1.2.0");

    assert_eq!(fx.state(), LifecycleState::Complete);
    let versions = fx.lifecycle.versions().unwrap();
    assert_eq!(versions.current_version, Some(v("1.2.0")));
    assert_eq!(versions.known_good_version, Some(v("1.1.0")));

    let outcome = fx.lifecycle.confirm(&alice()).unwrap();
    assert_eq!(outcome.state, LifecycleState::Idle);
    assert_eq!(outcome.versions.known_good_version, Some(v("1.2.0")));

    let record = fx.lifecycle.state_store().read().unwrap();
    assert!(record.active_operation.is_none());
    assert_eq!(
        fx.lifecycle
            .audit_log()
            .events_of_type(events::VERSIONS_UPDATED)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn test_confirm_requires_human() {
    let fx = Fixture::new();
    fx.promote("1.2.0");

    let resp = dispatch(
        &fx.lifecycle,
        CommandRequest::new("req-confirm", bot(), Command::Confirm {}),
    );
    assert_eq!(resp.error.unwrap().code, ReasonCode::AuthorityInsufficient);
    assert_eq!(fx.state(), LifecycleState::Complete);
}

#[test]
fn test_rollback_restores_known_good() {
    let fx = Fixture::new();
    fx.install("1.2.0");

    fx.stage("1.3.0");
    fx.lifecycle.validate("1.3.0", &bot()).unwrap();
    assert_eq!(fx.state(), LifecycleState::Promoting);

    let outcome = fx.lifecycle.rollback(&bot(), "smoke test failed").unwrap();
    assert_eq!(outcome.state, LifecycleState::Idle);
    assert_eq!(outcome.versions.current_version, Some(v("1.2.0")));
    assert_eq!(outcome.versions.known_good_version, Some(v("1.2.0")));

    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.previous_state, Some(LifecycleState::RollingBack));
    assert_eq!(record.reason_code, "ROLLBACK_COMPLETE");
    assert!(record.active_operation.is_none());
}

#[test]
fn test_rollback_without_known_good_artifact_is_terminal() {
    // 1.1.0 was vendored by hand, so there is no artifact to restore.
    let fx = Fixture::new();
    fx.stage("1.2.0");
    fx.lifecycle.validate("1.2.0", &bot()).unwrap();

    let err = fx.lifecycle.rollback(&bot(), "bad release").unwrap_err();
    assert!(matches!(err, LifecycleError::NoKnownGood));
    assert!(err.to_command_error().is_unrecoverable());
    assert_eq!(fx.state(), LifecycleState::FailedHard);

    let again = fx
        .lifecycle
        .request_upgrade("1.3.0", &alice(), RequestOptions::default())
        .unwrap_err();
    assert!(matches!(
        again,
        LifecycleError::State(StateError::TerminalState)
    ));
}

#[test]
fn test_rollback_lock_blocks_rollback() {
    let fx = Fixture::new();
    fx.install("1.2.0");
    fx.lifecycle
        .lock(&alice(), LockScope::Rollback, "investigating")
        .unwrap();
    fx.stage("1.3.0");
    fx.lifecycle.validate("1.3.0", &bot()).unwrap();

    let err = fx.lifecycle.rollback(&bot(), "try").unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::RollbackLocked);
    assert_eq!(fx.state(), LifecycleState::Promoting);
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_corrupt_state_document_forces_failed_hard() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    std::fs::write(fx.root().join("state.json"), b"{\"current_state\": ").unwrap();

    let resp = dispatch(
        &fx.lifecycle,
        CommandRequest::new(
            "req-validate",
            bot(),
            Command::Validate {
                version: "1.2.0".into(),
            },
        ),
    );
    assert_eq!(resp.exit_code(), 2);
    assert_eq!(fx.state(), LifecycleState::FailedHard);
    assert_eq!(
        fx.lifecycle
            .audit_log()
            .events_of_type(events::STATE_CORRUPTION)
            .unwrap()
            .len(),
        1
    );

    let status = dispatch(
        &fx.lifecycle,
        CommandRequest::new("req-status", viewer(), Command::Status {}),
    );
    assert!(status.ok);
}

#[test]
fn test_clear_failure_requires_human() {
    let fx = Fixture::new();
    fx.builder.inject(FailureConfig::error("exit 1"));
    fx.approve("1.2.0");
    fx.lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert_eq!(fx.state(), LifecycleState::Failed);

    let resp = dispatch(
        &fx.lifecycle,
        CommandRequest::new("req-1", bot(), Command::ClearFailure { reason: None }),
    );
    assert_eq!(resp.error.unwrap().code, ReasonCode::AuthorityInsufficient);
    assert_eq!(fx.state(), LifecycleState::Failed);

    let resp = dispatch(
        &fx.lifecycle,
        CommandRequest::new(
            "req-2",
            alice(),
            Command::ClearFailure {
                reason: Some("flaky build host".into()),
            },
        ),
    );
    assert!(resp.ok, "{:?}", resp.error);
    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.current_state, LifecycleState::Idle);
    let failure = record.last_failure.unwrap();
    assert!(failure.cleared);
    assert_eq!(failure.cleared_by.as_deref(), Some("alice"));
}

#[test]
fn test_retry_after_clearing_failure() {
    let fx = Fixture::new();
    fx.builder
        .inject(FailureConfig::error("exit 1").with_fail_count(1));
    fx.approve("1.2.0");
    fx.lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    fx.lifecycle.clear_failure(&alice(), None).unwrap();

    // The grant was consumed by the failed run.
    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert_eq!(err.classify().1, ReasonCode::ApprovalMissing);

    let outcome = fx.stage("1.2.0");
    assert_eq!(outcome.state, LifecycleState::Validating);
}

// =============================================================================
// Journal failures
// =============================================================================

/// Swap `audit.jsonl` for a directory so that every append fails.
fn break_journal(root: &Path) {
    let journal = root.join("audit.jsonl");
    fs::rename(&journal, root.join("audit.jsonl.held")).unwrap();
    fs::create_dir(&journal).unwrap();
}

fn restore_journal(root: &Path) {
    let journal = root.join("audit.jsonl");
    fs::remove_dir(&journal).unwrap();
    fs::rename(root.join("audit.jsonl.held"), &journal).unwrap();
}

#[test]
fn test_unjournaled_staging_start_leaves_state_idle() {
    let fx = Fixture::new();
    fx.approve("1.2.0");
    break_journal(fx.root());

    let result = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default());
    assert!(result.is_err());
    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.current_state, LifecycleState::Idle);
    assert!(record.active_operation.is_none());
    assert!(fx.scratch_entries().is_empty(), "scratch left behind");

    // The grant was not consumed, so the same approval stages once the
    // journal is writable again.
    restore_journal(fx.root());
    let outcome = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap();
    assert_eq!(outcome.state, LifecycleState::Validating);
}

#[test]
fn test_journal_lost_mid_staging_does_not_park_in_staging() {
    let root: Arc<OnceLock<PathBuf>> = Arc::new(OnceLock::new());
    let hook_root = root.clone();
    let fx = Fixture::builder()
        .builder(ScriptedBuilder::new().on_build(move |_| {
            if let Some(root) = hook_root.get() {
                break_journal(root);
            }
        }))
        .build();
    root.set(fx.root().to_path_buf()).unwrap();
    fx.approve("1.2.0");

    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    match err {
        LifecycleError::Staging(StagingError::StageFailed { stage, failure, .. }) => {
            assert_eq!(stage, StagingStage::Build);
            assert_eq!(failure, PipelineFailure::Internal);
        }
        other => panic!("unexpected error: {other}"),
    }

    // FAILED cannot be journaled, so the run ends in FAILED_HARD.
    let record = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(record.current_state, LifecycleState::FailedHard);
    assert_eq!(record.reason_code, "JOURNAL_UNAVAILABLE");
    assert_eq!(
        record.last_failure.as_ref().unwrap().state,
        Some(LifecycleState::Staging)
    );
    assert!(fx.scratch_entries().is_empty(), "scratch left behind");

    restore_journal(fx.root());
    let err = fx
        .lifecycle
        .begin_staging("1.2.0", &bot(), BeginOptions::default())
        .unwrap_err();
    assert!(
        matches!(err, LifecycleError::Staging(StagingError::State(StateError::TerminalState))),
        "{err}"
    );
}

#[test]
fn test_unjournaled_promotion_keeps_versions_and_state() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    let report = fx.lifecycle.validate("1.2.0", &bot()).unwrap();
    assert!(report.passed(), "{:?}", report.failed_checks);
    let before = fx.lifecycle.versions().unwrap();

    break_journal(fx.root());
    assert!(fx.lifecycle.promote(&bot()).is_err());
    assert_eq!(
        fx.lifecycle.state_store().read().unwrap().current_state,
        LifecycleState::Promoting
    );
    let after = fx.lifecycle.versions().unwrap();
    assert_eq!(after.current_version, before.current_version);
    assert_eq!(after.known_good_version, before.known_good_version);

    restore_journal(fx.root());
    let outcome = fx.lifecycle.promote(&bot()).unwrap();
    assert_eq!(outcome.state, LifecycleState::Complete);
    assert_eq!(outcome.versions.current_version, Some(v("1.2.0")));
}

// =============================================================================
// Read-only views
// =============================================================================

#[test]
fn test_explain_state_lists_next_steps() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    let explanation = fx.lifecycle.explain_state().unwrap();
    assert_eq!(explanation.state, LifecycleState::Validating);
    let targets: Vec<_> = explanation.allowed_transitions.iter().map(|t| t.to).collect();
    assert!(targets.contains(&LifecycleState::Promoting));
    assert!(targets.contains(&LifecycleState::Failed));
    assert!(!explanation.next_commands.is_empty());
}

#[test]
fn test_list_artifacts_marks_current_and_known_good() {
    let fx = Fixture::new();
    fx.install("1.2.0");
    let artifacts = fx.lifecycle.list_artifacts().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].current);
    assert!(artifacts[0].known_good);
}

#[test]
fn test_status_reports_staging_progress() {
    let fx = Fixture::new();
    fx.stage("1.2.0");
    let status = fx.lifecycle.status().unwrap();
    assert_eq!(status.state.current_state, LifecycleState::Validating);
    let staging = status.staging.unwrap();
    assert_eq!(staging.version, "1.2.0");
}
