//! Properties that must hold across arbitrary command sequences.

mod fixtures;

use std::fs;

use billy_lifecycle::audit::events;
use billy_lifecycle::dispatch;
use billy_lifecycle::mock::FailureConfig;
use billy_lifecycle::staging::checksum::compute_checksums;
use billy_lifecycle::state::LifecycleState;
use billy_lifecycle::PackageVersion;
use fixtures::{alice, bot, viewer, Fixture};
use lifecycle_protocol::{Actor, Command, CommandRequest, LockScope};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn v(s: &str) -> PackageVersion {
    PackageVersion::parse(s).unwrap()
}

// =============================================================================
// Random command sequences
// =============================================================================

const VERSIONS: [&str; 3] = ["1.2.0", "1.3.0", "1.4.0"];

/// One random step. `None` means "arm a one-shot build failure".
fn random_step(rng: &mut StdRng) -> Option<(Actor, Command)> {
    let version = VERSIONS[rng.gen_range(0..VERSIONS.len())].to_string();
    let step = match rng.gen_range(0..15) {
        0 | 1 => (
            alice(),
            Command::RequestUpgrade {
                version,
                force_check: rng.gen_bool(0.5),
                allow_prerelease: false,
            },
        ),
        2 | 3 => (alice(), Command::ApproveUpgrade { version }),
        4 => (
            alice(),
            Command::DenyUpgrade {
                version,
                reason: "not now".into(),
            },
        ),
        5 | 6 => (
            bot(),
            Command::BeginStaging {
                version,
                rebuild: rng.gen_bool(0.3),
                dry_run: rng.gen_bool(0.1),
            },
        ),
        7 => (bot(), Command::Validate { version }),
        8 => (bot(), Command::Promote {}),
        9 => (alice(), Command::Confirm {}),
        10 => (bot(), Command::Rollback { reason: "random".into() }),
        11 => (alice(), Command::ClearFailure { reason: None }),
        12 => {
            let scope = if rng.gen_bool(0.5) {
                LockScope::Upgrade
            } else {
                LockScope::Rollback
            };
            if rng.gen_bool(0.5) {
                (
                    alice(),
                    Command::Lock {
                        scope,
                        reason: "hold".into(),
                    },
                )
            } else {
                (alice(), Command::Unlock { scope })
            }
        }
        13 => {
            // Wrong actor for a human-only command.
            let actor = if rng.gen_bool(0.5) { bot() } else { viewer() };
            (actor, Command::Confirm {})
        }
        _ => return None,
    };
    Some(step)
}

fn assert_allowed_edges(fx: &Fixture, seed: u64) {
    let transitions = fx
        .lifecycle
        .audit_log()
        .events_of_type(events::STATE_TRANSITION)
        .unwrap();
    for event in transitions {
        let from: LifecycleState = serde_json::from_value(event.details["from"].clone()).unwrap();
        let to: LifecycleState = serde_json::from_value(event.details["to"].clone()).unwrap();
        assert!(
            from.edge_authority(to).is_some(),
            "seed {seed}: disallowed edge {from} -> {to} was journaled"
        );
    }
}

#[test]
fn test_random_sequences_preserve_invariants() {
    for seed in 0..12u64 {
        let fx = Fixture::builder().release("v1.4.0", false, false).build();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut last_seq = 0;

        for step in 0..80 {
            let Some((actor, command)) = random_step(&mut rng) else {
                fx.builder
                    .inject(FailureConfig::error("exit status 2").with_fail_count(1));
                continue;
            };
            let name = command.name();
            let resp = dispatch(
                &fx.lifecycle,
                CommandRequest::new(format!("{seed}-{step}"), actor, command),
            );

            let record = fx.lifecycle.state_store().read().unwrap_or_else(|e| {
                panic!("seed {seed} step {step} ({name}): state unreadable: {e}")
            });
            record.check_invariants().unwrap_or_else(|e| {
                panic!("seed {seed} step {step} ({name}): {e}")
            });
            assert!(record.seq >= last_seq, "seed {seed}: seq went backwards");
            last_seq = record.seq;

            if resp.exit_code() == 2 {
                assert_eq!(
                    record.current_state,
                    LifecycleState::FailedHard,
                    "seed {seed} step {step} ({name}): unrecoverable error outside FAILED_HARD"
                );
            }
            if !record.current_state.is_active() {
                assert!(
                    fx.scratch_entries().is_empty(),
                    "seed {seed} step {step} ({name}): scratch left behind in {}",
                    record.current_state
                );
            }
            if record.current_state.is_terminal() {
                break;
            }
        }

        assert_allowed_edges(&fx, seed);
    }
}

#[test]
fn test_failed_hard_refuses_every_mutation() {
    let fx = Fixture::new();
    fx.lifecycle.quarantine("simulated corruption").unwrap();
    let before = fx.lifecycle.state_store().read().unwrap();

    let mutations = vec![
        (
            alice(),
            Command::RequestUpgrade {
                version: "1.2.0".into(),
                force_check: false,
                allow_prerelease: false,
            },
        ),
        (alice(), Command::ClearFailure { reason: None }),
        (alice(), Command::Confirm {}),
        (bot(), Command::Promote {}),
        (bot(), Command::Rollback { reason: "x".into() }),
        (
            alice(),
            Command::Unlock {
                scope: LockScope::Upgrade,
            },
        ),
    ];
    for (actor, command) in mutations {
        let name = command.name();
        let resp = dispatch(&fx.lifecycle, CommandRequest::new("r", actor, command));
        assert!(!resp.ok, "{name} succeeded in FAILED_HARD");
        assert_eq!(resp.exit_code(), 2, "{name}");
    }

    let after = fx.lifecycle.state_store().read().unwrap();
    assert_eq!(before, after, "FAILED_HARD record must not change");
}

// =============================================================================
// Checksums
// =============================================================================

fn write_tree(root: &std::path::Path, files: &[(&str, &str)]) {
    for (rel, body) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }
}

#[test]
fn test_tree_hash_ignores_creation_order() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let files = [
        ("setup.py", "setup()\n"),
        ("billy/__init__.py", ""),
        ("billy/core/engine.py", "RUN = True\n"),
        ("config/default.yaml", "port: 1\n"),
    ];
    write_tree(a.path(), &files);
    let mut reversed = files;
    reversed.reverse();
    write_tree(b.path(), &reversed);

    let left = compute_checksums(a.path()).unwrap();
    let right = compute_checksums(b.path()).unwrap();
    assert_eq!(left, right);
    assert_eq!(left.files.len(), 4);
}

#[test]
fn test_staging_twice_yields_same_tree_hash() {
    let first = Fixture::new();
    let second = Fixture::new();
    let a = first.stage("1.2.0").tree_hash.unwrap();
    let b = second.stage("1.2.0").tree_hash.unwrap();
    assert_eq!(a, b);

    let tampered = Fixture::builder()
        .fetcher(billy_lifecycle::mock::MockFetcher::new(&[
            ("setup.py", "from setuptools import setup\nsetup(name='billy2')\n"),
            ("billy/__init__.py", "__version__ = '0'\n"),
        ]))
        .build();
    let c = tampered.stage("1.2.0").tree_hash.unwrap();
    assert_ne!(a, c);
}

// =============================================================================
// Retention
// =============================================================================

#[test]
fn test_cleanup_never_removes_protected_versions() {
    let fx = Fixture::builder().release("v1.4.0", false, false).build();
    fx.install("1.2.0");
    fx.install("1.3.0");
    fx.stage("1.4.0");

    let store = fx.lifecycle.artifact_store();
    for version in ["1.2.0", "1.3.0", "1.4.0"] {
        assert!(store.exists(&v(version)), "{version} should be staged");
    }

    let preview = fx.lifecycle.cleanup_artifacts(0, true, &bot()).unwrap();
    assert_eq!(preview.removed, vec!["1.2.0".to_string()]);
    assert!(store.exists(&v("1.2.0")), "dry run must not delete");

    let report = fx.lifecycle.cleanup_artifacts(0, false, &bot()).unwrap();
    assert_eq!(report.removed, vec!["1.2.0".to_string()]);
    assert!(!store.exists(&v("1.2.0")));
    assert!(store.exists(&v("1.3.0")), "current and known-good must survive");
    assert!(store.exists(&v("1.4.0")), "in-flight target must survive");

    let removed = fx
        .lifecycle
        .audit_log()
        .events_of_type(events::ARTIFACT_REMOVED)
        .unwrap();
    assert_eq!(removed.len(), 1);
}

#[test]
fn test_cleanup_keeps_newest_unprotected() {
    let fx = Fixture::builder().release("v1.4.0", false, false).build();
    fx.install("1.2.0");
    fx.install("1.3.0");
    fx.install("1.4.0");

    let report = fx.lifecycle.cleanup_artifacts(2, false, &bot()).unwrap();
    assert!(report.removed.is_empty(), "{:?}", report.removed);
    assert_eq!(report.protected, vec!["1.4.0".to_string()]);

    let report = fx.lifecycle.cleanup_artifacts(1, false, &bot()).unwrap();
    assert_eq!(report.kept, vec!["1.3.0".to_string()]);
    assert_eq!(report.removed, vec!["1.2.0".to_string()]);

    let report = fx.lifecycle.cleanup_artifacts(0, false, &bot()).unwrap();
    assert_eq!(report.removed, vec!["1.3.0".to_string()]);
    assert_eq!(fx.lifecycle.list_artifacts().unwrap().len(), 1);
}
