//! Single-writer locking for lifecycle operations.
//!
//! Only one lifecycle operation may be in flight system-wide. The state
//! store acquires an exclusive lock through an injected [`LockStrategy`]
//! before any transition and holds it until the operation completes or
//! fails. The default strategy is an advisory `flock(2)` on a lock file
//! next to the state document.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} is held by another operation (waited {waited:?})")]
    Contended { path: PathBuf, waited: Duration },

    #[error("I/O error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A held lock. Dropping it releases the lock.
pub trait LockGuard: Send {
    fn path(&self) -> &Path;
}

/// Strategy for acquiring the exclusive operation lock.
pub trait LockStrategy: Send + Sync {
    /// Acquire an exclusive lock on `path`, waiting at most `timeout`.
    fn acquire(&self, path: &Path, timeout: Duration) -> LockResult<Box<dyn LockGuard>>;
}

/// Advisory file lock (`flock(2)` on unix, create-exclusive elsewhere).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLockStrategy;

impl LockStrategy for FileLockStrategy {
    fn acquire(&self, path: &Path, timeout: Duration) -> LockResult<Box<dyn LockGuard>> {
        FileLock::acquire(path, timeout).map(|lock| Box::new(lock) as Box<dyn LockGuard>)
    }
}

/// Exclusive advisory lock held on an open file.
pub struct FileLock {
    lock_path: PathBuf,
    #[allow(dead_code)]
    lock_file: File,
}

impl FileLock {
    /// Acquire the lock, polling until `timeout` elapses.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> LockResult<Self> {
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(lock_path) {
                Ok(file) => {
                    if warned {
                        tracing::info!(
                            lock = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        tracing::warn!(lock = %lock_path.display(), "lock contention, waiting");
                        warned = true;
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: lock_path.to_path_buf(),
                        source,
                    })
                }
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Contended {
                    path: lock_path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            std::thread::sleep(poll_interval);
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        // SAFETY: fd is a valid open descriptor owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }
}

impl LockGuard for FileLock {
    fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is still owned by `lock_file`.
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
