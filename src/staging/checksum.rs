//! Per-file and tree checksums over a fetched source tree.
//!
//! The tree hash is SHA-256 over `"<path>\0<sha256>\n"` lines in byte
//! order of the relative paths, so it does not depend on the order in
//! which the filesystem yields entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::fileops::{self, FileOpsError};

/// Directories never included in checksums.
pub const EXCLUDED_DIRS: &[&str] = &[".git"];

/// Errors computing checksums
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("path is not within tree root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("non UTF-8 path in tree: {0}")]
    NonUtf8Path(PathBuf),

    #[error("tree {0} contains no files")]
    EmptyTree(PathBuf),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),
}

/// Checksums recorded in the artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeChecksums {
    /// Relative path (`/`-separated) to lowercase hex SHA-256
    pub files: BTreeMap<String, String>,
    pub tree_hash: String,
}

/// Compute the tree hash from per-file digests.
pub fn tree_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, digest) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Walk `root` and checksum every regular file. Symlinks are skipped.
pub fn compute_checksums(root: &Path) -> Result<TreeChecksums, ChecksumError> {
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && EXCLUDED_DIRS
                        .iter()
                        .any(|d| e.file_name().to_str() == Some(*d)))
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| ChecksumError::PathNotInRoot(entry.path().to_path_buf()))?;
        let key = rel
            .components()
            .map(|c| {
                c.as_os_str()
                    .to_str()
                    .ok_or_else(|| ChecksumError::NonUtf8Path(entry.path().to_path_buf()))
            })
            .collect::<Result<Vec<_>, _>>()?
            .join("/");
        files.insert(key, fileops::sha256_file(entry.path())?);
    }

    if files.is_empty() {
        return Err(ChecksumError::EmptyTree(root.to_path_buf()));
    }

    let tree_hash = tree_hash(&files);
    Ok(TreeChecksums { files, tree_hash })
}
