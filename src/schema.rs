//! # Tag schemas
//!
//! Validation of record tags against a protocol's tag schema fragments. A
//! constrained JSON-Schema subset is accepted: scalar tag types plus arrays
//! of scalars, with the usual bounds keywords. Fragments are checked for
//! subset conformance when the protocol is configured; record tags are
//! validated against the assembled schema on every protocol-bound write.

use serde_json::{Map, Value, json};

use crate::Error;
use crate::protocols::Tags;
use crate::{Result, unexpected};

const SCALAR_TYPES: [&str; 4] = ["string", "number", "integer", "boolean"];
const ARRAY_ITEM_TYPES: [&str; 3] = ["string", "number", "integer"];

/// Check a protocol's tag schema fragments stay within the accepted subset.
/// Called at protocol-configure time so a bad fragment is rejected before
/// any record depends on it.
///
/// # Errors
///
/// Returns an error naming the offending `<protocol>/<protocolPath>/$tags/<name>`
/// path when a fragment falls outside the subset or does not compile.
pub(crate) fn verify_schema(protocol: &str, protocol_path: &str, tags: &Tags) -> Result<()> {
    for (name, fragment) in &tags.properties {
        let path = format!("{protocol}/{protocol_path}/$tags/{name}");

        let Some(object) = fragment.as_object() else {
            return Err(unexpected!("tag schema at {path} must be an object"));
        };

        if let Some(type_name) = object.get("type").and_then(Value::as_str) {
            if type_name == "array" {
                let item_type = object
                    .get("items")
                    .and_then(|items| items.get("type"))
                    .and_then(Value::as_str);
                let Some(item_type) = item_type else {
                    return Err(unexpected!("tag schema at {path} must declare items.type"));
                };
                if !ARRAY_ITEM_TYPES.contains(&item_type) {
                    return Err(unexpected!(
                        "tag schema at {path} has unsupported array item type {item_type}"
                    ));
                }
            } else if !SCALAR_TYPES.contains(&type_name) {
                return Err(unexpected!("tag schema at {path} has unsupported type {type_name}"));
            }
        }

        jsonschema::validator_for(fragment)
            .map_err(|e| unexpected!("tag schema at {path} does not compile: {e}"))?;
    }

    Ok(())
}

/// Validate a record's tags against the rule set's tag schema.
///
/// # Errors
///
/// Returns a 401 `ProtocolAuthorizationTagsInvalidSchema` error describing
/// every violated constraint, with the failing
/// `<protocol>/<protocolPath>/$tags/<name>` path.
pub(crate) fn validate_tags(
    protocol: &str, protocol_path: &str, rules: &Tags, tags: Option<&Map<String, Value>>,
) -> Result<()> {
    let empty = Vec::new();
    let required = rules.required_tags.as_ref().unwrap_or(&empty);
    let additional_properties = rules.allow_undefined_tags.unwrap_or_default();

    let schema = json!({
        "type": "object",
        "properties": rules.properties,
        "required": required,
        "additionalProperties": additional_properties,
    });

    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| unexpected!("issue compiling tag schema: {e}"))?;
    let instance = tags.map_or_else(|| json!({}), |tags| Value::Object(tags.clone()));

    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| {
            let instance_path = e.instance_path.to_string();
            let name = instance_path.trim_start_matches('/');
            let mut message = e.to_string();
            if message.contains("Additional properties") {
                message = "must NOT have additional properties".to_string();
            }
            if name.is_empty() {
                format!("{protocol}/{protocol_path}/$tags: {message}")
            } else {
                format!("{protocol}/{protocol_path}/$tags/{name}: {message}")
            }
        })
        .collect();

    if !errors.is_empty() {
        return Err(Error::Forbidden(format!(
            "ProtocolAuthorizationTagsInvalidSchema: {}",
            errors.join("; ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Tags {
        Tags {
            required_tags: Some(vec!["status".to_string()]),
            allow_undefined_tags: Some(false),
            properties: [
                ("status".to_string(), json!({"type": "string", "enum": ["draft", "final"]})),
                ("score".to_string(), json!({"type": "number", "minimum": 0, "maximum": 100})),
            ]
            .into(),
        }
    }

    #[test]
    fn accepts_conforming_tags() {
        let mut tags = Map::new();
        tags.insert("status".to_string(), json!("draft"));
        tags.insert("score".to_string(), json!(85));
        validate_tags("http://example.com/p", "post", &rules(), Some(&tags))
            .expect("tags should validate");
    }

    #[test]
    fn rejects_missing_required_tag() {
        let mut tags = Map::new();
        tags.insert("score".to_string(), json!(85));
        let err = validate_tags("http://example.com/p", "post", &rules(), Some(&tags))
            .expect_err("should fail");
        assert!(err.detail().starts_with("ProtocolAuthorizationTagsInvalidSchema"));
    }

    #[test]
    fn rejects_undefined_tag() {
        let mut tags = Map::new();
        tags.insert("status".to_string(), json!("draft"));
        tags.insert("rogue".to_string(), json!(1));
        let err = validate_tags("http://example.com/p", "post", &rules(), Some(&tags))
            .expect_err("should fail");
        assert!(err.detail().contains("NOT have additional properties"));
    }

    #[test]
    fn rejects_out_of_range_value() {
        let mut tags = Map::new();
        tags.insert("status".to_string(), json!("draft"));
        tags.insert("score".to_string(), json!(101));
        let err = validate_tags("http://example.com/p", "post", &rules(), Some(&tags))
            .expect_err("should fail");
        assert!(err.detail().contains("$tags/score"));
    }

    #[test]
    fn subset_rejects_object_tags() {
        let tags = Tags {
            properties: [("meta".to_string(), json!({"type": "object"}))].into(),
            ..Tags::default()
        };
        assert!(verify_schema("http://example.com/p", "post", &tags).is_err());
    }

    #[test]
    fn subset_rejects_boolean_arrays() {
        let tags = Tags {
            properties: [(
                "flags".to_string(),
                json!({"type": "array", "items": {"type": "boolean"}}),
            )]
            .into(),
            ..Tags::default()
        };
        assert!(verify_schema("http://example.com/p", "post", &tags).is_err());
    }
}
