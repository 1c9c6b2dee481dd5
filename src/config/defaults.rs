//! Configuration sections and their built-in defaults (layer 1).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory holding every lifecycle document
    pub root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".billy-lifecycle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageConfig {
    pub name: String,
    /// Clone URL of the managed package
    pub repo_url: String,
    pub tag_prefix: String,
    /// Version installed before this tool first ran
    pub installed_version: Option<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: "billy".to_string(),
            repo_url: String::new(),
            tag_prefix: "v".to_string(),
            installed_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub api_base_url: Option<String>,
    /// Name of the environment variable holding an API token (never the
    /// token itself)
    pub token_env: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            api_base_url: None,
            token_env: Some("GITHUB_TOKEN".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingConfig {
    /// argv templates run in order; see `staging::build`
    pub build_commands: Vec<Vec<String>>,
    pub fetch_timeout_seconds: u64,
    pub build_timeout_seconds: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            build_commands: vec![
                vec![
                    "python3".to_string(),
                    "-m".to_string(),
                    "venv".to_string(),
                    "{env}".to_string(),
                ],
                vec![
                    "{env}/bin/pip".to_string(),
                    "install".to_string(),
                    "--no-input".to_string(),
                    "{tree}".to_string(),
                ],
            ],
            fetch_timeout_seconds: 300,
            build_timeout_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalConfig {
    pub ttl_hours: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { ttl_hours: 72 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    pub required_paths: Vec<String>,
    pub primary_module: Option<String>,
    pub import_command: Vec<String>,
    pub config_files: Vec<String>,
    pub plugin_dir: Option<String>,
    pub templates: Vec<String>,
    pub subsystem_command: Option<Vec<String>>,
    pub check_timeout_seconds: u64,
    pub suite_timeout_seconds: u64,
    pub history_limit: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_paths: Vec::new(),
            primary_module: None,
            import_command: vec![
                "{env}/bin/python".to_string(),
                "-c".to_string(),
                "import {module}".to_string(),
            ],
            config_files: Vec::new(),
            plugin_dir: None,
            templates: Vec::new(),
            subsystem_command: None,
            check_timeout_seconds: 60,
            suite_timeout_seconds: 300,
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    pub default_keep: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { default_keep: 3 }
    }
}
