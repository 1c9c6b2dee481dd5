//! On-disk artifact store.
//!
//! Layout under the lifecycle root:
//!
//! ```text
//! artifacts/<version>/source/         fetched tree
//! artifacts/<version>/env/            isolated build environment
//! artifacts/<version>/manifest.json
//! scratch/<build_id>/                 in-progress staging (same filesystem)
//! ```
//!
//! An artifact becomes visible by a single `rename` of its complete scratch
//! directory, so readers either see a finished artifact or nothing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::manifest::{ArtifactManifest, MANIFEST_FILE};
use crate::fileops::{self, FileOpsError};
use crate::version::PackageVersion;

/// Fetched tree directory inside an artifact
pub const SOURCE_DIR: &str = "source";

/// Build environment directory inside an artifact
pub const ENV_DIR: &str = "env";

/// Errors from the artifact store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact for {version} already exists (use rebuild to replace it)")]
    ArtifactExists { version: PackageVersion },

    #[error("no artifact for {version}")]
    ArtifactMissing { version: PackageVersion },

    #[error("scratch directory {0} already exists")]
    ScratchExists(PathBuf),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::FileOps(e) if e.is_corruption())
    }
}

/// An exclusive scratch directory, removed on drop unless finalized.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    armed: bool,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_dir(&self) -> PathBuf {
        self.path.join(SOURCE_DIR)
    }

    pub fn env_dir(&self) -> PathBuf {
        self.path.join(ENV_DIR)
    }

    /// Remove the directory now, reporting failure.
    pub fn discard(mut self) -> io::Result<()> {
        self.armed = false;
        remove_tree(&self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = remove_tree(&self.path) {
                tracing::error!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
            }
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// One directory in the artifact store.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub path: PathBuf,
    pub version: Option<PackageVersion>,
    pub manifest: Option<ArtifactManifest>,
    /// Why the manifest could not be read, if it could not
    pub error: Option<String>,
    pub size_bytes: u64,
}

/// Handle on `artifacts/` and `scratch/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    artifacts_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(artifacts_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn artifact_dir(&self, version: &PackageVersion) -> PathBuf {
        self.artifacts_dir.join(version.to_string())
    }

    pub fn exists(&self, version: &PackageVersion) -> bool {
        self.artifact_dir(version).is_dir()
    }

    /// Manifest of a finalized artifact; `Ok(None)` when there is no artifact.
    pub fn read_manifest(
        &self,
        version: &PackageVersion,
    ) -> Result<Option<ArtifactManifest>, StoreError> {
        Ok(fileops::read_document(
            &self.artifact_dir(version).join(MANIFEST_FILE),
        )?)
    }

    /// Create `scratch/<build_id>` exclusively.
    pub fn create_scratch(&self, build_id: &str) -> Result<ScratchDir, StoreError> {
        fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| FileOpsError::io(&self.scratch_dir, e))?;
        let path = self.scratch_dir.join(build_id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::ScratchExists(path))
            }
            Err(e) => return Err(FileOpsError::io(&path, e).into()),
        }
        for sub in [SOURCE_DIR, ENV_DIR] {
            let dir = path.join(sub);
            fs::create_dir(&dir).map_err(|e| FileOpsError::io(&dir, e))?;
        }
        tracing::debug!(path = %path.display(), "scratch directory created");
        Ok(ScratchDir { path, armed: true })
    }

    /// Scratch directories currently on disk.
    pub fn scratch_entries(&self) -> Result<Vec<PathBuf>, StoreError> {
        list_dirs(&self.scratch_dir)
    }

    /// Write the manifest into the scratch tree and move it into place.
    ///
    /// With `rebuild`, an existing artifact is moved aside first and only
    /// deleted once the new one is in place.
    pub fn finalize(
        &self,
        mut scratch: ScratchDir,
        manifest: &ArtifactManifest,
        rebuild: bool,
    ) -> Result<PathBuf, StoreError> {
        fileops::write_document(&scratch.path.join(MANIFEST_FILE), manifest)?;
        fs::create_dir_all(&self.artifacts_dir)
            .map_err(|e| FileOpsError::io(&self.artifacts_dir, e))?;

        let target = self.artifact_dir(&manifest.version);
        let mut trash = None;
        if target.exists() {
            if !rebuild {
                return Err(StoreError::ArtifactExists {
                    version: manifest.version.clone(),
                });
            }
            let aside = self
                .artifacts_dir
                .join(format!(".trash-{}", manifest.build_id));
            fs::rename(&target, &aside).map_err(|e| FileOpsError::io(&target, e))?;
            trash = Some(aside);
        }

        if let Err(e) = fs::rename(&scratch.path, &target) {
            if let Some(aside) = &trash {
                if let Err(restore) = fs::rename(aside, &target) {
                    tracing::error!(error = %restore, "failed to restore previous artifact");
                }
            }
            return Err(FileOpsError::io(&target, e).into());
        }
        scratch.armed = false;
        fileops::sync_dir(&self.artifacts_dir)?;

        if let Some(aside) = trash {
            if let Err(e) = remove_tree(&aside) {
                tracing::warn!(path = %aside.display(), error = %e, "failed to remove replaced artifact");
            }
        }

        tracing::info!(version = %manifest.version, path = %target.display(), "artifact finalized");
        Ok(target)
    }

    /// Every artifact directory with its manifest (or the reason it is unreadable).
    pub fn list(&self) -> Result<Vec<StoredArtifact>, StoreError> {
        let mut out = Vec::new();
        for path in list_dirs(&self.artifacts_dir)? {
            let name = match path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            let version = PackageVersion::parse(&name).ok();
            let (manifest, error) =
                match fileops::read_document::<ArtifactManifest>(&path.join(MANIFEST_FILE)) {
                    Ok(Some(m)) if Some(&m.version) == version.as_ref() => (Some(m), None),
                    Ok(Some(m)) => (
                        None,
                        Some(format!("manifest names version {}", m.version)),
                    ),
                    Ok(None) => (None, Some("manifest missing".to_string())),
                    Err(e) => (None, Some(e.to_string())),
                };
            out.push(StoredArtifact {
                size_bytes: dir_size(&path),
                name,
                path,
                version,
                manifest,
                error,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Delete an artifact directory. Returns bytes reclaimed.
    pub fn remove(&self, version: &PackageVersion) -> Result<u64, StoreError> {
        let path = self.artifact_dir(version);
        if !path.is_dir() {
            return Err(StoreError::ArtifactMissing {
                version: version.clone(),
            });
        }
        let size = dir_size(&path);
        fs::remove_dir_all(&path).map_err(|e| FileOpsError::io(&path, e))?;
        fileops::sync_dir(&self.artifacts_dir)?;
        Ok(size)
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FileOpsError::io(dir, e).into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FileOpsError::io(dir, e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Calculate directory size recursively.
fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::checksum::compute_checksums;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path().join("artifacts"), dir.path().join("scratch"))
    }

    fn staged(store: &ArtifactStore, version: &str, build_id: &str, body: &str) -> (ScratchDir, ArtifactManifest) {
        let scratch = store.create_scratch(build_id).unwrap();
        fs::write(scratch.source_dir().join("setup.py"), body).unwrap();
        let checksums = compute_checksums(&scratch.source_dir()).unwrap();
        let manifest = ArtifactManifest::new(
            PackageVersion::parse(version).unwrap(),
            "https://example.invalid/pkg.git",
            &format!("v{}", version),
            &"a".repeat(40),
            checksums,
            build_id,
        );
        (scratch, manifest)
    }

    #[test]
    fn test_scratch_is_exclusive_and_cleaned_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let scratch = store.create_scratch("b1").unwrap();
        assert!(matches!(
            store.create_scratch("b1"),
            Err(StoreError::ScratchExists(_))
        ));
        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
        assert!(store.scratch_entries().unwrap().is_empty());
    }

    #[test]
    fn test_finalize_moves_scratch_into_place() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (scratch, manifest) = staged(&store, "1.2.0", "b1", "one");
        let scratch_path = scratch.path().to_path_buf();

        let target = store.finalize(scratch, &manifest, false).unwrap();
        assert!(!scratch_path.exists());
        assert!(target.join("source/setup.py").exists());
        assert_eq!(
            store.read_manifest(&manifest.version).unwrap().unwrap(),
            manifest
        );
    }

    #[test]
    fn test_finalize_refuses_existing_without_rebuild() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (scratch, manifest) = staged(&store, "1.2.0", "b1", "one");
        store.finalize(scratch, &manifest, false).unwrap();

        let (scratch, second) = staged(&store, "1.2.0", "b2", "two");
        let scratch_path = scratch.path().to_path_buf();
        assert!(matches!(
            store.finalize(scratch, &second, false),
            Err(StoreError::ArtifactExists { .. })
        ));
        assert!(!scratch_path.exists());

        let (scratch, third) = staged(&store, "1.2.0", "b3", "three");
        store.finalize(scratch, &third, true).unwrap();
        let read = store.read_manifest(&third.version).unwrap().unwrap();
        assert_eq!(read.build_id, "b3");
        let hidden: Vec<_> = fs::read_dir(store.artifacts_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
    }

    #[test]
    fn test_list_reports_unreadable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (scratch, manifest) = staged(&store, "1.2.0", "b1", "one");
        store.finalize(scratch, &manifest, false).unwrap();
        fs::create_dir_all(store.artifacts_dir().join("1.3.0")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].manifest.is_some());
        assert!(listed[0].size_bytes > 0);
        assert_eq!(listed[1].error.as_deref(), Some("manifest missing"));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (scratch, manifest) = staged(&store, "1.2.0", "b1", "one");
        store.finalize(scratch, &manifest, false).unwrap();
        assert!(store.remove(&manifest.version).unwrap() > 0);
        assert!(!store.exists(&manifest.version));
        assert!(matches!(
            store.remove(&manifest.version),
            Err(StoreError::ArtifactMissing { .. })
        ));
    }
}
