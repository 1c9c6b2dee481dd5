//! Schema identifiers and JSON Schema validation for persisted documents.
//!
//! Every persisted document carries `schema_version` and `schema_id`
//! (`billy-lifecycle/<document>@<major>`). Documents are validated against
//! their JSON Schema on every write and every read. A document that fails
//! on read is corrupt; there is no forward-compatible partial parse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Prefix shared by every schema identifier in this crate.
pub const SCHEMA_PREFIX: &str = "billy-lifecycle";

/// Error type for schema validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The schema_id format is invalid (missing @, invalid major version).
    #[error("invalid schema_id '{schema_id}': {reason}")]
    InvalidFormat { schema_id: String, reason: String },

    /// The schema_id type prefix doesn't match expected.
    #[error("schema type mismatch: expected prefix '{expected_prefix}', got '{actual_prefix}' in schema_id '{schema_id}'")]
    TypeMismatch {
        expected_prefix: String,
        actual_prefix: String,
        schema_id: String,
    },

    /// The schema_id major version differs from expected.
    #[error("schema major version mismatch: expected {expected} ({expected_schema_id}), got {actual} ({actual_schema_id})")]
    MajorVersionMismatch {
        expected: u32,
        actual: u32,
        expected_schema_id: String,
        actual_schema_id: String,
    },

    /// The document does not satisfy its JSON Schema.
    #[error("{schema_id} violation: {}", .errors.join("; "))]
    Violation {
        schema_id: String,
        errors: Vec<String>,
    },

    /// The embedded schema itself failed to compile.
    #[error("schema {schema_id} failed to compile: {reason}")]
    Compile { schema_id: String, reason: String },
}

/// Parsed schema identifier components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaId {
    /// Full schema_id string (e.g., "billy-lifecycle/state@1")
    pub full: String,
    /// Prefix/type portion (e.g., "billy-lifecycle/state")
    pub prefix: String,
    /// Major version number extracted from the @N suffix
    pub major_version: u32,
}

impl SchemaId {
    /// Parse a schema_id string into its components.
    ///
    /// Expected format: `<prefix>@<major-version>`
    pub fn parse(schema_id: &str) -> Result<Self, SchemaError> {
        let at_pos = schema_id.rfind('@').ok_or_else(|| SchemaError::InvalidFormat {
            schema_id: schema_id.to_string(),
            reason: "missing '@' delimiter before version number".to_string(),
        })?;

        let prefix = &schema_id[..at_pos];
        let version_str = &schema_id[at_pos + 1..];

        if prefix.is_empty() {
            return Err(SchemaError::InvalidFormat {
                schema_id: schema_id.to_string(),
                reason: "empty prefix before '@'".to_string(),
            });
        }

        let major_version: u32 = version_str.parse().map_err(|_| SchemaError::InvalidFormat {
            schema_id: schema_id.to_string(),
            reason: format!("invalid major version '{}', expected integer", version_str),
        })?;

        Ok(Self {
            full: schema_id.to_string(),
            prefix: prefix.to_string(),
            major_version,
        })
    }
}

/// Check that a document's schema_id names the same document type and
/// major version the reader expects.
pub fn validate_schema_compatibility(
    expected_schema_id: &str,
    actual_schema_id: &str,
) -> Result<(), SchemaError> {
    let expected = SchemaId::parse(expected_schema_id)?;
    let actual = SchemaId::parse(actual_schema_id)?;

    if expected.prefix != actual.prefix {
        return Err(SchemaError::TypeMismatch {
            expected_prefix: expected.prefix,
            actual_prefix: actual.prefix,
            schema_id: actual_schema_id.to_string(),
        });
    }

    if expected.major_version != actual.major_version {
        return Err(SchemaError::MajorVersionMismatch {
            expected: expected.major_version,
            actual: actual.major_version,
            expected_schema_id: expected_schema_id.to_string(),
            actual_schema_id: actual_schema_id.to_string(),
        });
    }

    Ok(())
}

/// A persisted, schema-validated JSON document.
pub trait Document: Serialize + DeserializeOwned {
    /// Schema identifier written into every instance.
    const SCHEMA_ID: &'static str;

    /// JSON Schema (draft 2020-12) describing one instance.
    fn json_schema() -> Value;
}

fn validator_cache() -> &'static Mutex<HashMap<&'static str, Arc<Validator>>> {
    static CACHE: OnceLock<Mutex<HashMap<&'static str, Arc<Validator>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn compiled_validator<D: Document>() -> Result<Arc<Validator>, SchemaError> {
    let mut cache = validator_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(validator) = cache.get(D::SCHEMA_ID) {
        return Ok(Arc::clone(validator));
    }

    let validator = jsonschema::validator_for(&D::json_schema()).map_err(|e| {
        SchemaError::Compile {
            schema_id: D::SCHEMA_ID.to_string(),
            reason: e.to_string(),
        }
    })?;
    let validator = Arc::new(validator);
    cache.insert(D::SCHEMA_ID, Arc::clone(&validator));
    Ok(validator)
}

/// Validate a JSON value against the schema of document type `D`.
pub fn validate_value<D: Document>(value: &Value) -> Result<(), SchemaError> {
    match value.get("schema_id").and_then(Value::as_str) {
        Some(actual) => validate_schema_compatibility(D::SCHEMA_ID, actual)?,
        None => {
            return Err(SchemaError::Violation {
                schema_id: D::SCHEMA_ID.to_string(),
                errors: vec!["missing string field 'schema_id'".to_string()],
            })
        }
    }

    let validator = compiled_validator::<D>()?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Violation {
            schema_id: D::SCHEMA_ID.to_string(),
            errors,
        })
    }
}

/// Validate and serialize a document in one step.
pub fn to_validated_value<D: Document>(doc: &D) -> Result<Value, SchemaError> {
    let value = serde_json::to_value(doc).map_err(|e| SchemaError::Violation {
        schema_id: D::SCHEMA_ID.to_string(),
        errors: vec![format!("serialization failed: {}", e)],
    })?;
    validate_value::<D>(&value)?;
    Ok(value)
}

/// Validate and deserialize a document from a JSON value.
pub fn from_validated_value<D: Document>(value: Value) -> Result<D, SchemaError> {
    validate_value::<D>(&value)?;
    serde_json::from_value(value).map_err(|e| SchemaError::Violation {
        schema_id: D::SCHEMA_ID.to_string(),
        errors: vec![e.to_string()],
    })
}

/// Schema fragment for an RFC 3339 timestamp string.
pub(crate) fn timestamp() -> Value {
    serde_json::json!({ "type": "string", "minLength": 1 })
}

/// Schema fragment for a nullable value of the given fragment.
pub(crate) fn nullable(inner: Value) -> Value {
    serde_json::json!({ "anyOf": [ { "type": "null" }, inner ] })
}

/// Schema fragment for a lowercase hex SHA-256 digest.
pub(crate) fn sha256_hex() -> Value {
    serde_json::json!({ "type": "string", "pattern": "^[0-9a-f]{64}$" })
}

/// Schema fragment for the common `schema_version` / `schema_id` header.
pub(crate) fn header_properties(schema_id: &str) -> serde_json::Map<String, Value> {
    let mut props = serde_json::Map::new();
    props.insert(
        "schema_version".to_string(),
        serde_json::json!({ "type": "integer", "minimum": 1 }),
    );
    props.insert(
        "schema_id".to_string(),
        serde_json::json!({ "const": schema_id }),
    );
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        schema_version: u32,
        schema_id: String,
        name: String,
    }

    impl Document for Sample {
        const SCHEMA_ID: &'static str = "billy-lifecycle/sample@1";

        fn json_schema() -> Value {
            let mut props = header_properties(Self::SCHEMA_ID);
            props.insert("name".into(), json!({ "type": "string", "minLength": 1 }));
            json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["schema_version", "schema_id", "name"],
                "properties": props,
            })
        }
    }

    #[test]
    fn test_parse_schema_id() {
        let schema = SchemaId::parse("billy-lifecycle/state@1").unwrap();
        assert_eq!(schema.prefix, "billy-lifecycle/state");
        assert_eq!(schema.major_version, 1);
    }

    #[test]
    fn test_parse_schema_id_invalid() {
        assert!(matches!(
            SchemaId::parse("billy-lifecycle/state"),
            Err(SchemaError::InvalidFormat { .. })
        ));
        assert!(matches!(
            SchemaId::parse("@1"),
            Err(SchemaError::InvalidFormat { .. })
        ));
        assert!(matches!(
            SchemaId::parse("billy-lifecycle/state@x"),
            Err(SchemaError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_compatibility_rules() {
        assert!(validate_schema_compatibility(
            "billy-lifecycle/state@1",
            "billy-lifecycle/state@1"
        )
        .is_ok());
        assert!(matches!(
            validate_schema_compatibility("billy-lifecycle/state@1", "billy-lifecycle/state@2"),
            Err(SchemaError::MajorVersionMismatch { .. })
        ));
        assert!(matches!(
            validate_schema_compatibility("billy-lifecycle/state@1", "billy-lifecycle/manifest@1"),
            Err(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_valid_document_passes() {
        let value = json!({
            "schema_version": 1,
            "schema_id": "billy-lifecycle/sample@1",
            "name": "ok",
        });
        let sample: Sample = from_validated_value(value).unwrap();
        assert_eq!(sample.name, "ok");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let value = json!({
            "schema_version": 1,
            "schema_id": "billy-lifecycle/sample@1",
            "name": "ok",
            "extra": true,
        });
        assert!(matches!(
            validate_value::<Sample>(&value),
            Err(SchemaError::Violation { .. })
        ));
    }

    #[test]
    fn test_missing_schema_id_rejected() {
        let value = json!({ "schema_version": 1, "name": "ok" });
        let err = validate_value::<Sample>(&value).unwrap_err();
        assert!(err.to_string().contains("schema_id"));
    }

    #[test]
    fn test_wrong_major_version_rejected() {
        let value = json!({
            "schema_version": 2,
            "schema_id": "billy-lifecycle/sample@2",
            "name": "ok",
        });
        assert!(matches!(
            validate_value::<Sample>(&value),
            Err(SchemaError::MajorVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_write_side_validation() {
        let sample = Sample {
            schema_version: 1,
            schema_id: Sample::SCHEMA_ID.to_string(),
            name: String::new(),
        };
        assert!(to_validated_value(&sample).is_err());
    }
}
