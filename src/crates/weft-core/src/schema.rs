//! JSON Schema validation and structural compatibility
//!
//! Two concerns live here:
//!
//! 1. **Runtime validation** ([`validate`]) - payloads are checked against the
//!    schemas steps declare (input, output, resume, suspend) at the moments
//!    the engine crosses those boundaries. A failure is a
//!    [`WorkflowError::Validation`] - fatal to the node, never retried.
//! 2. **Build-time compatibility** ([`accepts`]) - `commit()` walks `then()`
//!    chains and checks that each producer's output schema structurally
//!    satisfies the next consumer's input schema, so a mismatched pipeline is
//!    rejected before anything runs.
//!
//! The structural check is deliberately permissive where schemas are open: an
//! empty schema (`{}`) accepts and produces anything, and a property without a
//! declared type is compatible with any type. What it does catch is the common
//! case: a required property the producer provably does not emit, or emits
//! with a provably different type.

use crate::error::{Result, WorkflowError};
use jsonschema::JSONSchema;
use serde_json::Value;

/// Whether a schema places no constraints on instances
pub fn is_permissive(schema: &Value) -> bool {
    match schema {
        Value::Object(map) => map.is_empty(),
        Value::Bool(true) => true,
        _ => false,
    }
}

/// Validate `data` against `schema`, labeling failures with `what`
pub fn validate(schema: &Value, data: &Value, what: &str) -> Result<()> {
    if is_permissive(schema) {
        return Ok(());
    }

    let compiled = JSONSchema::compile(schema)
        .map_err(|e| WorkflowError::validation(format!("invalid {what} schema: {e}")))?;

    if let Err(errors) = compiled.validate(data) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(WorkflowError::validation(format!(
            "{what} did not match schema: {}",
            details.join("; ")
        )));
    }
    Ok(())
}

/// Whether data conforming to `producer` structurally satisfies `consumer`
///
/// Used at commit time on `then()` links. Returns `Ok(())` or a validation
/// error naming the first incompatibility found.
pub fn accepts(producer: &Value, consumer: &Value) -> Result<()> {
    if is_permissive(consumer) || is_permissive(producer) {
        return Ok(());
    }

    let producer_type = schema_type(producer);
    let consumer_type = schema_type(consumer);

    if let (Some(p), Some(c)) = (producer_type, consumer_type) {
        if !types_compatible(p, c) {
            return Err(WorkflowError::validation(format!(
                "producer emits '{p}' but consumer expects '{c}'"
            )));
        }
    }

    // Object schemas: every required consumer property must be provably
    // emitted by the producer with a compatible type.
    if consumer_type == Some("object") {
        let required = consumer
            .get("required")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let producer_props = producer.get("properties").and_then(Value::as_object);
        let consumer_props = consumer.get("properties").and_then(Value::as_object);

        for name in required {
            let Some(props) = producer_props else {
                // Producer is an object with unspecified properties; nothing
                // provable either way.
                break;
            };
            let Some(produced) = props.get(name) else {
                return Err(WorkflowError::validation(format!(
                    "consumer requires property '{name}' which the producer does not emit"
                )));
            };
            if let Some(expected) = consumer_props.and_then(|p| p.get(name)) {
                if let (Some(p), Some(c)) = (schema_type(produced), schema_type(expected)) {
                    if !types_compatible(p, c) {
                        return Err(WorkflowError::validation(format!(
                            "property '{name}' is '{p}' but consumer expects '{c}'"
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

fn schema_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(Value::as_str)
}

fn types_compatible(producer: &str, consumer: &str) -> bool {
    producer == consumer || (producer == "integer" && consumer == "number")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_schema(props: Value, required: &[&str]) -> Value {
        json!({"type": "object", "properties": props, "required": required})
    }

    #[test]
    fn test_validate_accepts_conforming_data() {
        let schema = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(validate(&schema, &json!({"value": 3}), "input").is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let schema = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        let err = validate(&schema, &json!({}), "input").unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let schema = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(validate(&schema, &json!({"value": "three"}), "input").is_err());
    }

    #[test]
    fn test_permissive_schema_accepts_anything() {
        assert!(validate(&json!({}), &json!([1, 2, 3]), "input").is_ok());
        assert!(is_permissive(&json!({})));
        assert!(!is_permissive(&json!({"type": "object"})));
    }

    #[test]
    fn test_accepts_matching_objects() {
        let producer = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        let consumer = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(accepts(&producer, &consumer).is_ok());
    }

    #[test]
    fn test_accepts_rejects_missing_property() {
        let producer = object_schema(json!({"other": {"type": "string"}}), &["other"]);
        let consumer = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(accepts(&producer, &consumer).is_err());
    }

    #[test]
    fn test_accepts_rejects_type_mismatch() {
        let producer = object_schema(json!({"value": {"type": "string"}}), &["value"]);
        let consumer = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(accepts(&producer, &consumer).is_err());
    }

    #[test]
    fn test_integer_satisfies_number() {
        let producer = object_schema(json!({"value": {"type": "integer"}}), &["value"]);
        let consumer = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(accepts(&producer, &consumer).is_ok());
    }

    #[test]
    fn test_permissive_sides_are_compatible() {
        let concrete = object_schema(json!({"value": {"type": "number"}}), &["value"]);
        assert!(accepts(&json!({}), &concrete).is_ok());
        assert!(accepts(&concrete, &json!({})).is_ok());
    }
}
