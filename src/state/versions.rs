//! Installed-version bookkeeping (versions.json).
//!
//! Tracks which version is currently installed and which was last
//! confirmed good. Promotion updates the former, human confirmation the
//! latter, rollback restores one from the other.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{OperationGuard, StateError};
use crate::fileops;
use crate::schema::{self, Document};
use crate::version::PackageVersion;

/// Schema identifier
pub const VERSIONS_SCHEMA_ID: &str = "billy-lifecycle/versions@1";

/// versions.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstalledVersions {
    pub schema_version: u32,
    pub schema_id: String,
    pub current_version: Option<PackageVersion>,
    pub known_good_version: Option<PackageVersion>,
    pub updated_at: DateTime<Utc>,
}

impl InstalledVersions {
    /// Record seeded from the configured installed version. A freshly
    /// vendored version counts as known-good.
    pub fn seeded(installed: Option<PackageVersion>) -> Self {
        Self {
            schema_version: 1,
            schema_id: VERSIONS_SCHEMA_ID.to_string(),
            known_good_version: installed.clone(),
            current_version: installed,
            updated_at: Utc::now(),
        }
    }

    /// Versions that retention must never remove.
    pub fn protected(&self) -> Vec<&PackageVersion> {
        let mut out: Vec<&PackageVersion> = self
            .current_version
            .iter()
            .chain(self.known_good_version.iter())
            .collect();
        out.dedup();
        out
    }
}

impl Document for InstalledVersions {
    const SCHEMA_ID: &'static str = VERSIONS_SCHEMA_ID;

    fn json_schema() -> Value {
        let version = schema::nullable(json!({ "type": "string", "minLength": 5 }));
        let mut props = schema::header_properties(VERSIONS_SCHEMA_ID);
        props.insert("current_version".into(), version.clone());
        props.insert("known_good_version".into(), version);
        props.insert("updated_at".into(), schema::timestamp());
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "current_version",
                         "known_good_version", "updated_at"],
            "properties": props,
        })
    }
}

/// Handle on versions.json.
#[derive(Debug, Clone)]
pub struct VersionsStore {
    path: PathBuf,
    seed: Option<PackageVersion>,
}

impl VersionsStore {
    pub fn new(path: impl Into<PathBuf>, seed: Option<PackageVersion>) -> Self {
        Self {
            path: path.into(),
            seed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record; the seeded record when none has been written yet.
    pub fn load(&self) -> Result<InstalledVersions, StateError> {
        Ok(fileops::read_document::<InstalledVersions>(&self.path)?
            .unwrap_or_else(|| InstalledVersions::seeded(self.seed.clone())))
    }

    /// Persist a modified record.
    pub fn save(
        &self,
        _guard: &OperationGuard,
        mut versions: InstalledVersions,
    ) -> Result<InstalledVersions, StateError> {
        versions.updated_at = Utc::now();
        fileops::write_document(&self.path, &versions)?;
        Ok(versions)
    }
}
