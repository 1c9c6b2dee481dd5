//! Shared fixture: a `Lifecycle` over a temp root with in-memory
//! collaborators.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use billy_lifecycle::approval::RequestOptions;
use billy_lifecycle::config::LifecycleConfig;
use billy_lifecycle::lifecycle::{Collaborators, Lifecycle};
use billy_lifecycle::mock::{MockFetcher, MockReleaseSource, ScriptedBuilder};
use billy_lifecycle::staging::{BeginOptions, StagingOutcome};
use billy_lifecycle::state::LifecycleState;
use lifecycle_protocol::Actor;
use tempfile::TempDir;

pub fn alice() -> Actor {
    Actor::human("alice")
}

pub fn bot() -> Actor {
    Actor::executor_for("ci-bot", "alice")
}

pub fn viewer() -> Actor {
    Actor::observer("viewer")
}

pub struct FixtureBuilder {
    installed: Option<String>,
    releases: Vec<(&'static str, bool, bool)>,
    required_paths: Vec<String>,
    fetcher: MockFetcher,
    builder: ScriptedBuilder,
    history_limit: usize,
}

impl FixtureBuilder {
    pub fn installed(mut self, version: Option<&str>) -> Self {
        self.installed = version.map(str::to_string);
        self
    }

    pub fn release(mut self, tag: &'static str, draft: bool, prerelease: bool) -> Self {
        self.releases.push((tag, draft, prerelease));
        self
    }

    pub fn require(mut self, path: &str) -> Self {
        self.required_paths.push(path.to_string());
        self
    }

    pub fn fetcher(mut self, fetcher: MockFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn builder(mut self, builder: ScriptedBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn build(self) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("lifecycle");

        let mut config = LifecycleConfig::default();
        config.paths.root = root.clone();
        config.package.repo_url = "https://github.com/acme/billy.git".to_string();
        config.package.installed_version = self.installed;
        config.github.owner = "acme".to_string();
        config.github.repo = "billy".to_string();
        config.validation.required_paths = self.required_paths;
        config.validation.primary_module = Some("billy".to_string());
        config.validation.import_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "test -f {source}/{module}/__init__.py".to_string(),
        ];
        config.validation.config_files = vec!["source/config/default.yaml".to_string()];
        config.validation.plugin_dir = Some("source/plugins".to_string());
        config.validation.templates = vec!["source/templates/prompt.txt".to_string()];
        config.validation.check_timeout_seconds = 10;
        config.validation.suite_timeout_seconds = 60;
        config.validation.history_limit = self.history_limit;

        let releases = Arc::new(MockReleaseSource::new());
        for (tag, draft, prerelease) in self.releases {
            releases.add_release(tag, draft, prerelease);
        }
        let fetcher = Arc::new(self.fetcher);
        let builder = Arc::new(self.builder);
        let lifecycle = Lifecycle::open(
            config,
            Collaborators {
                releases: releases.clone(),
                fetcher: fetcher.clone(),
                builder: builder.clone(),
            },
        )
        .unwrap();

        Fixture {
            dir,
            root,
            lifecycle,
            releases,
            fetcher,
            builder,
        }
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub lifecycle: Lifecycle,
    pub releases: Arc<MockReleaseSource>,
    pub fetcher: Arc<MockFetcher>,
    pub builder: Arc<ScriptedBuilder>,
}

impl Fixture {
    /// Installed 1.1.0; releases v1.2.0 and v1.3.0 published.
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder {
            installed: Some("1.1.0".to_string()),
            releases: vec![("v1.2.0", false, false), ("v1.3.0", false, false)],
            required_paths: vec!["source/setup.py".to_string()],
            fetcher: MockFetcher::sample_package(),
            builder: ScriptedBuilder::new(),
            history_limit: 10,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state_store().read().unwrap().current_state
    }

    /// Request and approve `version`.
    pub fn approve(&self, version: &str) {
        self.lifecycle
            .request_upgrade(version, &alice(), RequestOptions::default())
            .unwrap();
        self.lifecycle.approve(version, &alice()).unwrap();
    }

    /// Approve and stage `version`; ends in VALIDATING.
    pub fn stage(&self, version: &str) -> StagingOutcome {
        self.approve(version);
        self.lifecycle
            .begin_staging(version, &bot(), BeginOptions::default())
            .unwrap()
    }

    /// Stage, validate and promote `version`; ends in COMPLETE.
    pub fn promote(&self, version: &str) {
        self.stage(version);
        let report = self.lifecycle.validate(version, &bot()).unwrap();
        assert!(report.passed(), "validation failed: {:?}", report.failed_checks);
        self.lifecycle.promote(&bot()).unwrap();
    }

    /// Full cycle through confirmation; ends in IDLE with `version` known-good.
    pub fn install(&self, version: &str) {
        self.promote(version);
        self.lifecycle.confirm(&alice()).unwrap();
    }

    pub fn scratch_entries(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.root.join("scratch")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
