//! Pending-approval and approval-grant documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fileops;
use crate::schema::{self, Document};
use crate::version::PackageVersion;

/// Schema identifier for pending.json
pub const PENDING_SCHEMA_ID: &str = "billy-lifecycle/pending_approval@1";

/// Schema identifier for granted.json
pub const GRANT_SCHEMA_ID: &str = "billy-lifecycle/approval_grant@1";

/// Where the requested version lives on the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceReference {
    pub tag: String,
    pub release_url: String,
}

/// Identity fields that the approval id is computed over.
#[derive(Serialize)]
struct ApprovalIdInputs<'a> {
    version: &'a PackageVersion,
    requested_at: &'a DateTime<Utc>,
    requested_by: &'a str,
    source_reference: &'a SourceReference,
}

/// Compute the approval id
///
/// approval_id = SHA-256 hex digest of JCS(identity fields)
pub fn compute_approval_id(
    version: &PackageVersion,
    requested_at: &DateTime<Utc>,
    requested_by: &str,
    source_reference: &SourceReference,
) -> Result<String, serde_json::Error> {
    let inputs = ApprovalIdInputs {
        version,
        requested_at,
        requested_by,
        source_reference,
    };
    let jcs_bytes = serde_json_canonicalizer::to_vec(&inputs)?;
    Ok(fileops::sha256_bytes(&jcs_bytes))
}

/// pending.json: at most one outstanding upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PendingApproval {
    pub schema_version: u32,
    pub schema_id: String,
    pub version: PackageVersion,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    pub source_reference: SourceReference,
    pub approval_id: String,
}

impl PendingApproval {
    pub fn new(
        version: PackageVersion,
        requested_by: &str,
        source_reference: SourceReference,
    ) -> Result<Self, serde_json::Error> {
        let requested_at = Utc::now();
        let approval_id =
            compute_approval_id(&version, &requested_at, requested_by, &source_reference)?;
        Ok(Self {
            schema_version: 1,
            schema_id: PENDING_SCHEMA_ID.to_string(),
            version,
            requested_at,
            requested_by: requested_by.to_string(),
            source_reference,
            approval_id,
        })
    }

    /// Whether the stored id still matches the fields.
    pub fn is_intact(&self) -> bool {
        compute_approval_id(
            &self.version,
            &self.requested_at,
            &self.requested_by,
            &self.source_reference,
        )
        .map(|id| id == self.approval_id)
        .unwrap_or(false)
    }
}

/// approvals/granted.json: a human decision awaiting consumption by staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalGrant {
    pub schema_version: u32,
    pub schema_id: String,
    pub approval_id: String,
    pub version: PackageVersion,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    pub source_reference: SourceReference,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalGrant {
    pub fn from_pending(
        pending: &PendingApproval,
        approved_by: &str,
        ttl: chrono::Duration,
    ) -> Self {
        let approved_at = Utc::now();
        Self {
            schema_version: 1,
            schema_id: GRANT_SCHEMA_ID.to_string(),
            approval_id: pending.approval_id.clone(),
            version: pending.version.clone(),
            requested_at: pending.requested_at,
            requested_by: pending.requested_by.clone(),
            source_reference: pending.source_reference.clone(),
            approved_by: approved_by.to_string(),
            approved_at,
            expires_at: approved_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the approval id still matches the request fields.
    pub fn is_intact(&self) -> bool {
        compute_approval_id(
            &self.version,
            &self.requested_at,
            &self.requested_by,
            &self.source_reference,
        )
        .map(|id| id == self.approval_id)
        .unwrap_or(false)
    }
}

fn source_reference_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["tag", "release_url"],
        "properties": {
            "tag": { "type": "string", "minLength": 1 },
            "release_url": { "type": "string" },
        }
    })
}

impl Document for PendingApproval {
    const SCHEMA_ID: &'static str = PENDING_SCHEMA_ID;

    fn json_schema() -> Value {
        let mut props = schema::header_properties(PENDING_SCHEMA_ID);
        props.insert("version".into(), json!({ "type": "string", "minLength": 5 }));
        props.insert("requested_at".into(), schema::timestamp());
        props.insert("requested_by".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("source_reference".into(), source_reference_schema());
        props.insert("approval_id".into(), schema::sha256_hex());
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "version", "requested_at",
                         "requested_by", "source_reference", "approval_id"],
            "properties": props,
        })
    }
}

impl Document for ApprovalGrant {
    const SCHEMA_ID: &'static str = GRANT_SCHEMA_ID;

    fn json_schema() -> Value {
        let mut props = schema::header_properties(GRANT_SCHEMA_ID);
        props.insert("approval_id".into(), schema::sha256_hex());
        props.insert("version".into(), json!({ "type": "string", "minLength": 5 }));
        props.insert("requested_at".into(), schema::timestamp());
        props.insert("requested_by".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("source_reference".into(), source_reference_schema());
        props.insert("approved_by".into(), json!({ "type": "string", "minLength": 1 }));
        props.insert("approved_at".into(), schema::timestamp());
        props.insert("expires_at".into(), schema::timestamp());
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["schema_version", "schema_id", "approval_id", "version",
                         "requested_at", "requested_by", "source_reference",
                         "approved_by", "approved_at", "expires_at"],
            "properties": props,
        })
    }
}
