//! Artifact manifest (manifest.json)
//!
//! Provenance and checksums for one staged version. Written into the
//! scratch tree before finalize, so it becomes visible together with the
//! artifact it describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::checksum::TreeChecksums;
use crate::schema::{self, Document};
use crate::version::PackageVersion;

/// Schema version for manifest.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "billy-lifecycle/manifest@1";

/// Manifest file name inside an artifact directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Artifact manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub schema_id: String,

    pub version: PackageVersion,

    pub built_at: DateTime<Utc>,

    /// Repository the source was fetched from
    pub source_url: String,

    /// Tag that was checked out
    pub tag: String,

    /// Commit the tag resolved to, verified against the release source
    pub commit_sha: String,

    /// Checksums over the fetched source tree
    pub checksums: TreeChecksums,

    pub build_id: String,
}

impl ArtifactManifest {
    pub fn new(
        version: PackageVersion,
        source_url: &str,
        tag: &str,
        commit_sha: &str,
        checksums: TreeChecksums,
        build_id: &str,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            version,
            built_at: Utc::now(),
            source_url: source_url.to_string(),
            tag: tag.to_string(),
            commit_sha: commit_sha.to_string(),
            checksums,
            build_id: build_id.to_string(),
        }
    }
}

impl Document for ArtifactManifest {
    const SCHEMA_ID: &'static str = SCHEMA_ID;

    fn json_schema() -> Value {
        let mut props = schema::header_properties(SCHEMA_ID);
        props.insert("version".into(), json!({ "type": "string", "minLength": 5 }));
        props.insert("built_at".into(), schema::timestamp());
        props.insert("source_url".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("tag".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert(
            "commit_sha".into(),
            json!({ "type": "string", "pattern": "^[0-9a-f]{40}$" }),
        );
        props.insert(
            "checksums".into(),
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["files", "tree_hash"],
                "properties": {
                    "files": {
                        "type": "object",
                        "minProperties": 1,
                        "additionalProperties": schema::sha256_hex(),
                    },
                    "tree_hash": schema::sha256_hex(),
                }
            }),
        );
        props.insert("build_id".into(), json!({ "type": "string", "minLength": 1 }));
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "version", "built_at", "source_url",
                         "tag", "commit_sha", "checksums", "build_id"],
            "properties": props,
        })
    }
}
