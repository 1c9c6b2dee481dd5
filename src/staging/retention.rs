//! Artifact retention.
//!
//! - keep the N newest artifacts (by manifest `built_at`)
//! - MUST NOT delete protected versions (current, known-good, active target)
//! - MUST NOT delete artifacts whose manifest cannot be read; report them

use std::collections::HashSet;

use serde::Serialize;

use super::store::{ArtifactStore, StoreError};
use crate::version::PackageVersion;

/// Retention policy for artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Newest unprotected artifacts to keep
    pub keep: usize,
    /// Dry-run mode (report but don't delete)
    pub dry_run: bool,
}

impl RetentionPolicy {
    /// Create a count-based retention policy.
    pub fn keep_last_n(keep: usize) -> Self {
        Self {
            keep,
            dry_run: false,
        }
    }

    /// Set dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub kept: Vec<String>,
    pub protected: Vec<String>,
    /// Removed, or would be removed in dry-run mode
    pub removed: Vec<String>,
    /// Artifacts skipped because their manifest could not be read
    pub unreadable: Vec<String>,
    pub bytes_reclaimed: u64,
    /// Non-fatal deletion errors
    pub errors: Vec<String>,
}

/// Apply `policy` to the store, never touching `protected` versions.
pub fn cleanup(
    store: &ArtifactStore,
    policy: RetentionPolicy,
    protected: &[PackageVersion],
) -> Result<CleanupReport, StoreError> {
    let protected: HashSet<&PackageVersion> = protected.iter().collect();
    let mut report = CleanupReport {
        dry_run: policy.dry_run,
        ..CleanupReport::default()
    };

    let mut readable = Vec::new();
    for artifact in store.list()? {
        report.scanned += 1;
        match artifact.manifest {
            Some(manifest) => readable.push((manifest, artifact.size_bytes)),
            None => {
                tracing::warn!(
                    artifact = %artifact.name,
                    error = artifact.error.as_deref().unwrap_or("unknown"),
                    "skipping unreadable artifact"
                );
                report.unreadable.push(artifact.name);
            }
        }
    }

    // Newest first
    readable.sort_by(|(a, _), (b, _)| b.built_at.cmp(&a.built_at));

    let mut kept = 0;
    for (manifest, size) in readable {
        let name = manifest.version.to_string();
        if protected.contains(&manifest.version) {
            report.protected.push(name);
            continue;
        }
        if kept < policy.keep {
            kept += 1;
            report.kept.push(name);
            continue;
        }

        if !policy.dry_run {
            if let Err(e) = store.remove(&manifest.version) {
                tracing::error!(version = %manifest.version, error = %e, "failed to remove artifact");
                report.errors.push(format!("{}: {}", name, e));
                continue;
            }
            tracing::info!(version = %manifest.version, bytes = size, "artifact removed");
        }
        report.bytes_reclaimed += size;
        report.removed.push(name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::checksum::compute_checksums;
    use crate::staging::manifest::ArtifactManifest;
    use chrono::{Duration, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn add(store: &ArtifactStore, version: &str, age_hours: i64) {
        let build_id = format!("b-{}", version);
        let scratch = store.create_scratch(&build_id).unwrap();
        fs::write(scratch.source_dir().join("f.txt"), version).unwrap();
        let mut manifest = ArtifactManifest::new(
            PackageVersion::parse(version).unwrap(),
            "https://example.invalid/pkg.git",
            version,
            &"b".repeat(40),
            compute_checksums(&scratch.source_dir()).unwrap(),
            &build_id,
        );
        manifest.built_at = Utc::now() - Duration::hours(age_hours);
        store.finalize(scratch, &manifest, false).unwrap();
    }

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn test_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"), dir.path().join("scratch"));
        add(&store, "1.0.0", 30);
        add(&store, "1.1.0", 20);
        add(&store, "1.2.0", 10);

        let report = cleanup(&store, RetentionPolicy::keep_last_n(1), &[]).unwrap();
        assert_eq!(report.kept, vec!["1.2.0"]);
        assert_eq!(report.removed.len(), 2);
        assert!(store.exists(&v("1.2.0")));
        assert!(!store.exists(&v("1.0.0")));
    }

    #[test]
    fn test_protected_survive_keep_zero() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"), dir.path().join("scratch"));
        add(&store, "1.0.0", 30);
        add(&store, "1.1.0", 20);
        add(&store, "1.2.0", 10);

        let report = cleanup(&store, RetentionPolicy::keep_last_n(0), &[v("1.0.0"), v("1.1.0")]).unwrap();
        assert_eq!(report.removed, vec!["1.2.0"]);
        assert!(store.exists(&v("1.0.0")));
        assert!(store.exists(&v("1.1.0")));
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"), dir.path().join("scratch"));
        add(&store, "1.0.0", 30);
        add(&store, "1.1.0", 20);

        let report = cleanup(
            &store,
            RetentionPolicy::keep_last_n(0).with_dry_run(true),
            &[],
        )
        .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.removed.len(), 2);
        assert!(store.exists(&v("1.0.0")));
        assert!(store.exists(&v("1.1.0")));
    }

    #[test]
    fn test_unreadable_never_deleted() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"), dir.path().join("scratch"));
        add(&store, "1.0.0", 30);
        let broken = store.artifacts_dir().join("1.5.0");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("manifest.json"), "{").unwrap();

        let report = cleanup(&store, RetentionPolicy::keep_last_n(0), &[]).unwrap();
        assert_eq!(report.unreadable, vec!["1.5.0"]);
        assert!(broken.exists());
        assert_eq!(report.removed, vec!["1.0.0"]);
    }
}
