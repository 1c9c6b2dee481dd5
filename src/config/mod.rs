//! Configuration loading.
//!
//! Four layers, merged in order with [`deep_merge`]:
//! 1. Built-in defaults
//! 2. Config file (`lifecycle.toml`)
//! 3. Environment (`BILLY_LIFECYCLE_ROOT`)
//! 4. CLI flags
//!
//! The merged value is then deserialized into [`LifecycleConfig`], which
//! rejects unknown keys.

mod defaults;
mod merge;

pub use defaults::{
    ApprovalConfig, GitHubConfig, PackageConfig, PathsConfig, RetentionConfig, StagingConfig,
    ValidationConfig,
};
pub use merge::{deep_merge, merge_layers, toml_to_json};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::timeout::{TimeoutConfig, TimeoutValidationError};
use crate::validator::ValidationSettings;
use crate::version::{PackageVersion, VersionError};

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "lifecycle.toml";

/// Environment variable overriding `paths.root`
pub const ROOT_ENV: &str = "BILLY_LIFECYCLE_ROOT";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Timeout(#[from] TimeoutValidationError),

    #[error("package.installed_version: {0}")]
    InstalledVersion(#[from] VersionError),
}

/// Origin of a configuration layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Fully merged configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub paths: PathsConfig,
    pub package: PackageConfig,
    pub github: GitHubConfig,
    pub staging: StagingConfig,
    pub approval: ApprovalConfig,
    pub validation: ValidationConfig,
    pub retention: RetentionConfig,
}

/// Merged configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: LifecycleConfig,
    pub sources: Vec<ConfigSource>,
}

impl LifecycleConfig {
    /// Load from the process environment. A missing file is only an error
    /// when `path` was given explicitly.
    pub fn load(path: Option<&Path>, cli: Option<Value>) -> Result<LoadedConfig, ConfigError> {
        Self::load_with_env(path, cli, |key| std::env::var(key).ok())
    }

    /// As [`load`](Self::load), reading environment variables through `env`.
    pub fn load_with_env(
        path: Option<&Path>,
        cli: Option<Value>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let defaults = serde_json::to_value(LifecycleConfig::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut layers = vec![defaults];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if required || file.exists() {
            let (value, digest) = load_toml_file(&file)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(file.display().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(root) = env(ROOT_ENV).filter(|r| !r.trim().is_empty()) {
            layers.push(json!({ "paths": { "root": root } }));
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
            });
        }

        if let Some(cli) = cli {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let config: LifecycleConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
                path: file.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(layers = sources.len(), root = %config.paths.root.display(), "configuration loaded");
        Ok(LoadedConfig { config, sources })
    }

    /// Bounds-check timeouts and reject empty identity fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("package.name", &self.package.name),
            ("package.repo_url", &self.package.repo_url),
            ("github.owner", &self.github.owner),
            ("github.repo", &self.github.repo),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }
        if self.paths.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("paths.root must not be empty".into()));
        }

        self.timeouts().validate()?;

        if self.approval.ttl_hours == 0 || self.approval.ttl_hours > 720 {
            return Err(ConfigError::Invalid(format!(
                "approval.ttl_hours must be in (0, 720], got {}",
                self.approval.ttl_hours
            )));
        }
        if self.validation.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "validation.history_limit must be at least 1".into(),
            ));
        }
        if self.validation.import_command.is_empty() {
            return Err(ConfigError::Invalid(
                "validation.import_command must not be empty".into(),
            ));
        }
        if self
            .staging
            .build_commands
            .iter()
            .chain(self.validation.subsystem_command.iter())
            .any(|argv| argv.is_empty())
        {
            return Err(ConfigError::Invalid("command templates must not be empty".into()));
        }
        self.installed_version()?;
        Ok(())
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig::from_config(
            Some(self.staging.fetch_timeout_seconds),
            Some(self.staging.build_timeout_seconds),
            Some(self.validation.check_timeout_seconds),
            Some(self.validation.suite_timeout_seconds),
        )
    }

    pub fn installed_version(&self) -> Result<Option<PackageVersion>, ConfigError> {
        Ok(self
            .package
            .installed_version
            .as_deref()
            .map(PackageVersion::parse)
            .transpose()?)
    }

    pub fn approval_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.approval.ttl_hours as i64)
    }

    pub fn validation_settings(&self) -> ValidationSettings {
        let timeouts = self.timeouts();
        let v = &self.validation;
        ValidationSettings {
            required_paths: v.required_paths.clone(),
            primary_module: v.primary_module.clone(),
            import_command: v.import_command.clone(),
            config_files: v.config_files.clone(),
            plugin_dir: v.plugin_dir.clone(),
            templates: v.templates.clone(),
            subsystem_command: v.subsystem_command.clone(),
            check_timeout: timeouts.check(),
            suite_timeout: timeouts.suite(),
        }
    }
}

fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));
    let text = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    let parsed: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok((toml_to_json(parsed), digest))
}
