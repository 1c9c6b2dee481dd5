//! Tag-pinned source checkout.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::github::is_commit_sha;
use crate::process::{self, ProcessError, ProcessSpec};

/// Errors fetching source
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{command} failed: {reason}")]
    Failed { command: String, reason: String },

    #[error("could not resolve checked-out commit: '{output}'")]
    UnresolvedCommit { output: String },
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub repo_url: String,
    pub tag: String,
    pub timeout: Duration,
}

/// Result of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    /// Lowercase 40-hex commit the working tree is at
    pub commit_sha: String,
}

/// Source checkout strategy.
pub trait SourceFetcher: Send + Sync {
    /// Populate the empty directory `dest` with the tree at `request.tag`.
    fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<FetchedSource, FetchError>;
}

/// Shallow clone through the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git: String,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
        }
    }
}

impl GitFetcher {
    pub fn with_binary(git: &str) -> Self {
        Self {
            git: git.to_string(),
        }
    }

    fn git(&self, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            program: self.git.clone(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
        .env("GIT_TERMINAL_PROMPT", "0")
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<FetchedSource, FetchError> {
        let dest_str = dest.to_string_lossy();
        let clone = self.git(&[
            "clone",
            "--quiet",
            "--depth",
            "1",
            "--single-branch",
            "--branch",
            &request.tag,
            "-c",
            "advice.detachedHead=false",
            "--",
            &request.repo_url,
            &dest_str,
        ]);
        tracing::info!(repo = %request.repo_url, tag = %request.tag, "fetching source");
        let out = process::run(&clone, request.timeout)?;
        if !out.success() {
            return Err(FetchError::Failed {
                command: "git clone".to_string(),
                reason: out.describe_failure(),
            });
        }

        let rev_parse = self.git(&["rev-parse", "HEAD"]).cwd(dest);
        let out = process::run(&rev_parse, Duration::from_secs(30))?;
        if !out.success() {
            return Err(FetchError::Failed {
                command: "git rev-parse".to_string(),
                reason: out.describe_failure(),
            });
        }
        let sha = out.stdout.trim().to_lowercase();
        if !is_commit_sha(&sha) {
            return Err(FetchError::UnresolvedCommit { output: sha });
        }
        Ok(FetchedSource { commit_sha: sha })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_git_binary_is_process_error() {
        let dir = TempDir::new().unwrap();
        let fetcher = GitFetcher::with_binary("/nonexistent/git");
        let request = FetchRequest {
            repo_url: "https://example.invalid/repo.git".into(),
            tag: "v1.0.0".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            fetcher.fetch(&request, dir.path()),
            Err(FetchError::Process(ProcessError::Spawn { .. }))
        ));
    }

    #[test]
    fn test_failing_clone_reports_command() {
        let dir = TempDir::new().unwrap();
        // `false` ignores its arguments and exits 1.
        let fetcher = GitFetcher::with_binary("false");
        let request = FetchRequest {
            repo_url: "https://example.invalid/repo.git".into(),
            tag: "v1.0.0".into(),
            timeout: Duration::from_secs(5),
        };
        match fetcher.fetch(&request, dir.path()) {
            Err(FetchError::Failed { command, .. }) => assert_eq!(command, "git clone"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
