//! Isolated build environment construction.
//!
//! Each configured command is an argv template. `{tree}` expands to the
//! fetched source tree, `{env}` to the artifact's environment directory and
//! `{version}` to the version being staged. Commands run in order; any
//! non-zero exit aborts the build.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::process::{self, ProcessError, ProcessSpec};

/// Errors building an environment
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("build step {index} ({command}) failed: {reason}")]
    StepFailed {
        index: usize,
        command: String,
        reason: String,
    },
}

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub version: &'a str,
    pub tree: &'a Path,
    pub env_dir: &'a Path,
}

/// One completed step.
#[derive(Debug, Clone, Serialize)]
pub struct BuildStep {
    pub command: String,
    pub duration_ms: u64,
}

/// Environment builder strategy.
pub trait EnvironmentBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<BuildStep>, BuildError>;
}

/// Runs configured command templates as child processes.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    commands: Vec<Vec<String>>,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(commands: Vec<Vec<String>>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }
}

impl EnvironmentBuilder for CommandBuilder {
    fn build(&self, request: &BuildRequest<'_>) -> Result<Vec<BuildStep>, BuildError> {
        let mut vars = BTreeMap::new();
        vars.insert("tree", request.tree.to_string_lossy().into_owned());
        vars.insert("env", request.env_dir.to_string_lossy().into_owned());
        vars.insert("version", request.version.to_string());

        if self.commands.is_empty() {
            tracing::warn!(version = request.version, "no build commands configured");
        }

        let mut steps = Vec::with_capacity(self.commands.len());
        for (index, template) in self.commands.iter().enumerate() {
            let spec = ProcessSpec::from_template(template, &vars)?.cwd(request.tree);
            let command = spec.display();
            tracing::info!(step = index, %command, "build step");

            let out = process::run(&spec, self.timeout)?;
            if !out.success() {
                return Err(BuildError::StepFailed {
                    index,
                    command,
                    reason: out.describe_failure(),
                });
            }
            steps.push(BuildStep {
                command,
                duration_ms: out.duration.as_millis() as u64,
            });
        }
        Ok(steps)
    }
}
