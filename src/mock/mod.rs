//! In-memory collaborators for tests and demos.
//!
//! - [`MockReleaseSource`]: releases and tag commits held in memory
//! - [`MockFetcher`]: writes a fixed file tree instead of cloning
//! - [`ScriptedBuilder`]: records build requests, succeeds or fails on cue
//!
//! All three share [`FailureInjector`] for error paths.

mod failure;

pub use failure::{FailureConfig, FailureInjector, MockOp};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::github::{GitHubError, ReleaseInfo, ReleaseSource};
use crate::staging::build::{BuildError, BuildRequest, BuildStep, EnvironmentBuilder};
use crate::staging::fetch::{FetchError, FetchRequest, FetchedSource, SourceFetcher};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic fake commit for a tag.
pub fn commit_for(tag: &str) -> String {
    crate::fileops::sha256_bytes(tag.as_bytes())[..40].to_string()
}

/// Release source backed by a map.
#[derive(Debug, Default)]
pub struct MockReleaseSource {
    releases: Mutex<HashMap<String, ReleaseInfo>>,
    commits: Mutex<HashMap<String, String>>,
    failures: Mutex<FailureInjector>,
    lookups: AtomicUsize,
}

impl MockReleaseSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release; its tag resolves to [`commit_for`] unless
    /// overridden with [`set_commit`](Self::set_commit).
    pub fn add_release(&self, tag: &str, draft: bool, prerelease: bool) {
        lock(&self.releases).insert(
            tag.to_string(),
            ReleaseInfo {
                tag_name: tag.to_string(),
                html_url: format!("https://github.com/acme/billy/releases/tag/{}", tag),
                draft,
                prerelease,
                published_at: None,
            },
        );
        lock(&self.commits)
            .entry(tag.to_string())
            .or_insert_with(|| commit_for(tag));
    }

    pub fn set_commit(&self, tag: &str, sha: &str) {
        lock(&self.commits).insert(tag.to_string(), sha.to_string());
    }

    pub fn inject(&self, op: MockOp, config: FailureConfig) {
        lock(&self.failures).inject(op, config);
    }

    /// Number of `release_by_tag` calls so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ReleaseSource for MockReleaseSource {
    fn release_by_tag(&self, tag: &str) -> Result<Option<ReleaseInfo>, GitHubError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.failures).trip(MockOp::ReleaseLookup) {
            return Err(GitHubError::Http {
                status: Some(503),
                message,
            });
        }
        Ok(lock(&self.releases).get(tag).cloned())
    }

    fn tag_commit(&self, tag: &str) -> Result<Option<String>, GitHubError> {
        if let Some(message) = lock(&self.failures).trip(MockOp::TagCommit) {
            return Err(GitHubError::Http {
                status: Some(503),
                message,
            });
        }
        Ok(lock(&self.commits).get(tag).cloned())
    }
}

/// Writes a fixed tree into the destination.
#[derive(Debug)]
pub struct MockFetcher {
    files: BTreeMap<String, String>,
    /// Commit reported for every fetch; None reports [`commit_for`] the tag
    commit: Mutex<Option<String>>,
    failures: Mutex<FailureInjector>,
    fetches: Mutex<Vec<FetchRequest>>,
}

impl MockFetcher {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            commit: Mutex::new(None),
            failures: Mutex::new(FailureInjector::new()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// A small package tree: setup.py, a module, a config file, a plugin
    /// and a template.
    pub fn sample_package() -> Self {
        Self::new(&[
            ("setup.py", "from setuptools import setup\nsetup(name='billy')\n"),
            ("billy/__init__.py", "__version__ = '0'\n"),
            ("config/default.yaml", "name: billy\nport: 8080\n"),
            ("plugins/weather.py", "PLUGIN = 'weather'\n"),
            ("templates/prompt.txt", "You are Billy.\n"),
        ])
    }

    /// Report `sha` regardless of tag (to simulate tag mutation).
    pub fn report_commit(&self, sha: &str) {
        *lock(&self.commit) = Some(sha.to_string());
    }

    pub fn inject(&self, config: FailureConfig) {
        lock(&self.failures).inject(MockOp::Fetch, config);
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        lock(&self.fetches).clone()
    }
}

impl SourceFetcher for MockFetcher {
    fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<FetchedSource, FetchError> {
        lock(&self.fetches).push(request.clone());
        if let Some(reason) = lock(&self.failures).trip(MockOp::Fetch) {
            return Err(FetchError::Failed {
                command: "mock fetch".to_string(),
                reason,
            });
        }
        for (rel, contents) in &self.files {
            let path = dest.join(rel);
            let written = path
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|()| fs::write(&path, contents));
            if let Err(e) = written {
                return Err(FetchError::Failed {
                    command: "mock fetch".to_string(),
                    reason: format!("{}: {}", path.display(), e),
                });
            }
        }
        let commit_sha = lock(&self.commit)
            .clone()
            .unwrap_or_else(|| commit_for(&request.tag));
        Ok(FetchedSource { commit_sha })
    }
}

type BuildHook = Box<dyn Fn(&BuildRequest<'_>) + Send + Sync>;

/// Builder that writes a marker into the env dir, or fails when told to.
#[derive(Default)]
pub struct ScriptedBuilder {
    failures: Mutex<FailureInjector>,
    builds: Mutex<Vec<String>>,
    on_build: Option<BuildHook>,
}

impl std::fmt::Debug for ScriptedBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBuilder")
            .field("builds", &self.builds())
            .field("on_build", &self.on_build.is_some())
            .finish()
    }
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build fails as if the first step exited non-zero.
    pub fn failing(message: &str) -> Self {
        let builder = Self::default();
        builder.inject(FailureConfig::error(message));
        builder
    }

    pub fn inject(&self, config: FailureConfig) {
        lock(&self.failures).inject(MockOp::Build, config);
    }

    /// Run `hook` at the start of every build, before any injected failure.
    pub fn on_build(mut self, hook: impl Fn(&BuildRequest<'_>) + Send + Sync + 'static) -> Self {
        self.on_build = Some(Box::new(hook));
        self
    }

    /// Versions built so far.
    pub fn builds(&self) -> Vec<String> {
        lock(&self.builds).clone()
    }
}

impl EnvironmentBuilder for ScriptedBuilder {
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<BuildStep>, BuildError> {
        lock(&self.builds).push(request.version.to_string());
        if let Some(hook) = &self.on_build {
            hook(request);
        }
        if let Some(reason) = lock(&self.failures).trip(MockOp::Build) {
            return Err(BuildError::StepFailed {
                index: 0,
                command: "scripted build".to_string(),
                reason,
            });
        }
        let marker = request.env_dir.join("BUILT");
        fs::write(&marker, request.version).map_err(|e| BuildError::StepFailed {
            index: 0,
            command: "scripted build".to_string(),
            reason: e.to_string(),
        })?;
        Ok(vec![BuildStep {
            command: "scripted build".to_string(),
            duration_ms: 0,
        }])
    }
}
