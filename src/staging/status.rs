//! Pollable staging status (staging_status.json).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::schema::{self, Document};

/// Schema identifier
pub const SCHEMA_ID: &str = "billy-lifecycle/staging_status@1";

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStage {
    Initialize,
    Fetch,
    Build,
    Checksum,
    Finalize,
    Transition,
}

impl StagingStage {
    pub const ALL: [StagingStage; 6] = [
        StagingStage::Initialize,
        StagingStage::Fetch,
        StagingStage::Build,
        StagingStage::Checksum,
        StagingStage::Finalize,
        StagingStage::Transition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStage::Initialize => "initialize",
            StagingStage::Fetch => "fetch",
            StagingStage::Build => "build",
            StagingStage::Checksum => "checksum",
            StagingStage::Finalize => "finalize",
            StagingStage::Transition => "transition",
        }
    }
}

impl std::fmt::Display for StagingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingRunStatus {
    Running,
    Succeeded,
    Failed,
}

/// staging_status.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingStatus {
    pub schema_version: u32,
    pub schema_id: String,
    pub build_id: String,
    pub version: String,
    pub stage: StagingStage,
    pub status: StagingRunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl StagingStatus {
    pub fn started(build_id: &str, version: &str) -> Self {
        let now = Utc::now();
        Self {
            schema_version: 1,
            schema_id: SCHEMA_ID.to_string(),
            build_id: build_id.to_string(),
            version: version.to_string(),
            stage: StagingStage::Initialize,
            status: StagingRunStatus::Running,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn at_stage(&mut self, stage: StagingStage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.status = if error.is_some() {
            StagingRunStatus::Failed
        } else {
            StagingRunStatus::Succeeded
        };
        self.error = error;
        self.updated_at = Utc::now();
    }
}

impl Document for StagingStatus {
    const SCHEMA_ID: &'static str = SCHEMA_ID;

    fn json_schema() -> Value {
        let mut props = schema::header_properties(SCHEMA_ID);
        props.insert("build_id".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("version".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert(
            "stage".into(),
            json!({ "enum": ["initialize", "fetch", "build", "checksum", "finalize", "transition"] }),
        );
        props.insert(
            "status".into(),
            json!({ "enum": ["RUNNING", "SUCCEEDED", "FAILED"] }),
        );
        props.insert("started_at".into(), schema::timestamp());
        props.insert("updated_at".into(), schema::timestamp());
        props.insert("error".into(), schema::nullable(json!({ "type": "string" })));
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "build_id", "version", "stage",
                         "status", "started_at", "updated_at", "error"],
            "properties": props,
            "if": { "properties": { "status": { "const": "FAILED" } } },
            "then": { "properties": { "error": { "type": "string" } } },
        })
    }
}
