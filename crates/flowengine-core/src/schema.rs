// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! JSON Schema validation for a step's `input_schema`/`output_schema` (spec §4.7
//! common preamble, step 6: "validate against `outputSchema` if present").

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::EngineError;

/// Validates `instance` against `schema`, returning [`EngineError::Schema`] naming
/// the offending step on the first violation. Compiling the schema itself is folded
/// into the same error variant -- a malformed `outputSchema` is a config mistake, not
/// a different failure class from the violation it would have caught.
pub fn validate(step_id: &str, schema: &Value, instance: &Value) -> Result<(), EngineError> {
    let compiled = JSONSchema::compile(schema).map_err(|e| EngineError::Schema {
        step_id: Some(step_id.to_string()),
        message: format!("invalid output schema: {e}"),
    })?;
    if let Err(mut errors) = compiled.validate(instance) {
        let first = errors.next().map(|e| e.to_string()).unwrap_or_else(|| "schema violation".to_string());
        return Err(EngineError::Schema {
            step_id: Some(step_id.to_string()),
            message: format!("output schema violation: {first}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matching_output_passes() {
        let schema = json!({"type": "object", "required": ["ok"], "properties": {"ok": {"type": "boolean"}}});
        assert!(validate("s1", &schema, &json!({"ok": true})).is_ok());
    }

    #[test]
    fn missing_required_field_is_a_schema_error() {
        let schema = json!({"type": "object", "required": ["ok"]});
        let err = validate("s1", &schema, &json!({})).unwrap_err();
        assert!(matches!(err, EngineError::Schema { .. }));
    }

    #[test]
    fn wrong_type_is_a_schema_error() {
        let schema = json!({"type": "string"});
        assert!(validate("s1", &schema, &json!(42)).is_err());
    }
}
