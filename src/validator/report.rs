//! Validation reports: `reports/latest.json` plus a rotating per-version
//! history under `reports/history/<version>/`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fileops::{self, FileOpsError};
use crate::schema::{self, Document};
use crate::state::LifecycleState;
use crate::version::PackageVersion;

/// Schema identifier
pub const SCHEMA_ID: &str = "billy-lifecycle/validation_report@1";

/// Aggregate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub details: Value,
}

impl CheckResult {
    pub fn pass(name: &str, details: Value) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            duration_ms: 0,
            error: None,
            details,
        }
    }

    pub fn fail(name: &str, error: impl Into<String>, details: Value) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration_ms: 0,
            error: Some(error.into()),
            details,
        }
    }
}

/// One validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationReport {
    pub schema_version: u32,
    pub schema_id: String,
    pub report_id: String,
    pub version: PackageVersion,
    pub timestamp: DateTime<Utc>,
    pub status: ValidationStatus,
    pub checks: Vec<CheckResult>,
    pub failed_checks: Vec<String>,
    /// Tree hash from the artifact manifest, when readable
    pub artifact_hash: Option<String>,
    pub elapsed_ms: u64,
    /// State entered as a result of this run (None for inspection-only runs)
    pub transitioned_to: Option<LifecycleState>,
}

impl ValidationReport {
    pub fn new(
        version: PackageVersion,
        checks: Vec<CheckResult>,
        artifact_hash: Option<String>,
        elapsed_ms: u64,
    ) -> Self {
        let failed_checks: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect();
        Self {
            schema_version: 1,
            schema_id: SCHEMA_ID.to_string(),
            report_id: ulid::Ulid::new().to_string().to_lowercase(),
            version,
            timestamp: Utc::now(),
            status: if failed_checks.is_empty() {
                ValidationStatus::Passed
            } else {
                ValidationStatus::Failed
            },
            checks,
            failed_checks,
            artifact_hash,
            elapsed_ms,
            transitioned_to: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Passed
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl Document for ValidationReport {
    const SCHEMA_ID: &'static str = SCHEMA_ID;

    fn json_schema() -> Value {
        let check = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["name", "passed", "duration_ms", "error", "details"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "passed": { "type": "boolean" },
                "duration_ms": { "type": "integer", "minimum": 0 },
                "error": schema::nullable(json!({ "type": "string" })),
                "details": { "type": "object" },
            }
        });
        let mut props = schema::header_properties(SCHEMA_ID);
        props.insert("report_id".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("version".into(), json!({ "type": "string", "minLength": 5 }));
        props.insert("timestamp".into(), schema::timestamp());
        props.insert("status".into(), json!({ "enum": ["PASSED", "FAILED"] }));
        props.insert("checks".into(), json!({ "type": "array", "items": check }));
        props.insert(
            "failed_checks".into(),
            json!({ "type": "array", "items": { "type": "string" } }),
        );
        props.insert("artifact_hash".into(), schema::nullable(schema::sha256_hex()));
        props.insert("elapsed_ms".into(), json!({ "type": "integer", "minimum": 0 }));
        props.insert(
            "transitioned_to".into(),
            schema::nullable(json!({ "enum": ["PROMOTING", "FAILED"] })),
        );
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "report_id", "version", "timestamp",
                         "status", "checks", "failed_checks", "artifact_hash", "elapsed_ms",
                         "transitioned_to"],
            "properties": props,
        })
    }
}

/// Handle on the reports directory.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
    history_limit: usize,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            history_limit: history_limit.max(1),
        }
    }

    fn latest_path(&self) -> PathBuf {
        self.dir.join("latest.json")
    }

    fn history_dir(&self, version: &PackageVersion) -> PathBuf {
        self.dir.join("history").join(version.to_string())
    }

    /// Write `latest.json`, append to history and rotate it.
    pub fn persist(&self, report: &ValidationReport) -> Result<PathBuf, FileOpsError> {
        let history = self.history_dir(&report.version);
        fs::create_dir_all(&history).map_err(|e| FileOpsError::io(&history, e))?;
        let entry = history.join(format!("{}.json", report.report_id));
        fileops::write_document(&entry, report)?;
        fileops::write_document(&self.latest_path(), report)?;
        self.rotate(&history)?;
        Ok(entry)
    }

    /// Most recent report overall.
    pub fn latest(&self) -> Result<Option<ValidationReport>, FileOpsError> {
        fileops::read_document(&self.latest_path())
    }

    /// Most recent report for `version`.
    pub fn latest_for(
        &self,
        version: &PackageVersion,
    ) -> Result<Option<ValidationReport>, FileOpsError> {
        match self.history(version)?.last() {
            Some(path) => fileops::read_document(path),
            None => Ok(None),
        }
    }

    /// History entries for `version`, oldest first.
    pub fn history(&self, version: &PackageVersion) -> Result<Vec<PathBuf>, FileOpsError> {
        history_entries(&self.history_dir(version))
    }

    fn rotate(&self, history: &Path) -> Result<(), FileOpsError> {
        let entries = history_entries(history)?;
        let excess = entries.len().saturating_sub(self.history_limit);
        for old in entries.into_iter().take(excess) {
            fileops::remove_if_exists(&old)?;
            tracing::debug!(path = %old.display(), "rotated validation report");
        }
        Ok(())
    }
}

/// Report ids are ULIDs, so lexical order is creation order.
fn history_entries(dir: &Path) -> Result<Vec<PathBuf>, FileOpsError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FileOpsError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in read {
        let path = entry.map_err(|e| FileOpsError::io(dir, e))?.path();
        let is_report = path.extension().map(|e| e == "json").unwrap_or(false)
            && !path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
        if is_report {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
