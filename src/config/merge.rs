//! Layer merge for configuration values.
//!
//! - Objects: deep-merge by key
//! - Arrays: replace (last wins)
//! - Scalars and null: override (last wins)

use serde_json::Value;

/// Merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        // Build command lists are never concatenated.
        (Value::Array(_), overlay @ Value::Array(_)) => overlay,
        (_, overlay) => overlay,
    }
}

/// Fold layers in order; the last has highest precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Convert a parsed TOML document into a JSON value for merging.
pub fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sections_merge_by_key() {
        let base = json!({ "staging": { "fetch_timeout_seconds": 300, "build_timeout_seconds": 1800 } });
        let overlay = json!({ "staging": { "fetch_timeout_seconds": 60 } });
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["staging"]["fetch_timeout_seconds"], 60);
        assert_eq!(merged["staging"]["build_timeout_seconds"], 1800);
    }

    #[test]
    fn test_arrays_replace() {
        let base = json!({ "validation": { "templates": ["a.txt", "b.txt", "c.txt"] } });
        let overlay = json!({ "validation": { "templates": ["z.txt"] } });
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["validation"]["templates"], json!(["z.txt"]));
    }

    #[test]
    fn test_null_overrides() {
        let merged = deep_merge(json!({ "plugin_dir": "plugins" }), json!({ "plugin_dir": null }));
        assert!(merged["plugin_dir"].is_null());
    }

    #[test]
    fn test_layer_precedence() {
        let merged = merge_layers(vec![
            json!({ "paths": { "root": "/builtin" }, "retention": { "default_keep": 3 } }),
            json!({ "paths": { "root": "/file" } }),
            json!({ "paths": { "root": "/env" } }),
            json!({ "retention": { "default_keep": 1 } }),
        ]);
        assert_eq!(merged["paths"]["root"], "/env");
        assert_eq!(merged["retention"]["default_keep"], 1);
    }

    #[test]
    fn test_toml_conversion() {
        let parsed: toml::Value = toml::from_str(
            "[staging]\nbuild_commands = [[\"make\", \"{tree}\"]]\n[approval]\nttl_hours = 12\n",
        )
        .unwrap();
        let value = toml_to_json(parsed);
        assert_eq!(value["staging"]["build_commands"][0][1], "{tree}");
        assert_eq!(value["approval"]["ttl_hours"], 12);
    }
}
