//! Atomic file primitives.
//!
//! All persisted-document writes go through [`write_document`]: validate
//! against the document schema, write to a sibling temp file, fsync, rename
//! over the target, fsync the parent directory. A crash mid-write leaves
//! either the old document or the new one, never a torn file.
//!
//! Reads go through [`read_document`]: any parse or schema failure is
//! reported as [`FileOpsError::Corrupt`], never repaired.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::schema::{self, Document, SchemaError};

/// Errors from file operations.
#[derive(Debug, thiserror::Error)]
pub enum FileOpsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt document {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("refusing to write invalid document {path}: {source}")]
    InvalidDocument {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}

impl FileOpsError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, FileOpsError::Corrupt { .. })
    }
}

pub type FileOpsResult<T> = Result<T, FileOpsError>;

/// Write bytes atomically (write-to-temp, fsync, rename, fsync dir).
pub fn atomic_write(path: &Path, contents: &[u8]) -> FileOpsResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| FileOpsError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let temp_path = parent.join(format!(
        ".{}.tmp-{}",
        file_name,
        ulid::Ulid::new().to_string().to_lowercase()
    ));

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|e| FileOpsError::io(&temp_path, e))?;
        file.write_all(contents)
            .map_err(|e| FileOpsError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| FileOpsError::io(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| FileOpsError::io(path, e))?;
        sync_dir(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Fsync a directory so a preceding rename is durable.
pub fn sync_dir(dir: &Path) -> FileOpsResult<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| FileOpsError::io(dir, e))?;
        handle.sync_all().map_err(|e| FileOpsError::io(dir, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Append a single line (a trailing newline is added) and fsync.
///
/// The line is written with one `write_all` on an `O_APPEND` handle so
/// concurrent appenders never interleave within a line.
pub fn append_line(path: &Path, line: &str) -> FileOpsResult<()> {
    if line.contains('\n') {
        return Err(FileOpsError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "line contains a newline"),
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| FileOpsError::io(parent, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FileOpsError::io(path, e))?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .map_err(|e| FileOpsError::io(path, e))?;
    file.sync_data().map_err(|e| FileOpsError::io(path, e))?;
    Ok(())
}

/// Validate and atomically persist a document.
pub fn write_document<D: Document>(path: &Path, doc: &D) -> FileOpsResult<()> {
    let value = schema::to_validated_value(doc).map_err(|source| FileOpsError::InvalidDocument {
        path: path.to_path_buf(),
        source,
    })?;
    let mut json = serde_json::to_vec_pretty(&value).map_err(|e| FileOpsError::InvalidDocument {
        path: path.to_path_buf(),
        source: SchemaError::Violation {
            schema_id: D::SCHEMA_ID.to_string(),
            errors: vec![e.to_string()],
        },
    })?;
    json.push(b'\n');
    atomic_write(path, &json)
}

/// Read and validate a document. A missing file yields `Ok(None)`.
pub fn read_document<D: Document>(path: &Path) -> FileOpsResult<Option<D>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FileOpsError::io(path, e)),
    };
    parse_document(path, &raw).map(Some)
}

/// Parse and validate document bytes already read from `path`.
pub fn parse_document<D: Document>(path: &Path, raw: &[u8]) -> FileOpsResult<D> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| FileOpsError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("invalid JSON: {}", e),
    })?;
    schema::from_validated_value(value).map_err(|e| FileOpsError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> FileOpsResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                sync_dir(parent)?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FileOpsError::io(path, e)),
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> FileOpsResult<String> {
    let file = File::open(path).map_err(|e| FileOpsError::io(path, e))?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| FileOpsError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of in-memory bytes, lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
