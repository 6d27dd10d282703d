//! Structural argument validation: types and required fields only.

use serde_json::Value;

use super::schema::{SchemaKind, SchemaNode};

/// Checks `args` against `schema`, returning a reason on the first mismatch.
///
/// A `null` argument value against an object schema is treated as `{}`.
pub fn validate_arguments(schema: &SchemaNode, args: &Value) -> Result<(), String> {
    if args.is_null() && matches!(schema.kind, SchemaKind::Object { .. }) {
        return check(schema, &Value::Object(Default::default()), "");
    }
    check(schema, args, "")
}

fn check(schema: &SchemaNode, value: &Value, path: &str) -> Result<(), String> {
    let matches = match &schema.kind {
        SchemaKind::String => value.is_string(),
        SchemaKind::Number => value.is_number(),
        SchemaKind::Integer => is_integer(value),
        SchemaKind::Boolean => value.is_boolean(),
        SchemaKind::Object { fields } => {
            let Some(obj) = value.as_object() else {
                return Err(mismatch(path, "object", value));
            };
            for field in fields {
                let field_path = join(path, &field.name);
                match obj.get(&field.name) {
                    Some(v) => check(&field.schema, v, &field_path)?,
                    None if field.required => {
                        return Err(format!("missing required field '{field_path}'"));
                    }
                    None => {}
                }
            }
            true
        }
        SchemaKind::Array { items } => {
            let Some(values) = value.as_array() else {
                return Err(mismatch(path, "array", value));
            };
            for (i, item) in values.iter().enumerate() {
                check(items, item, &format!("{path}[{i}]"))?;
            }
            true
        }
    };

    if matches {
        Ok(())
    } else {
        Err(mismatch(path, kind_name(&schema.kind), value))
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn kind_name(kind: &SchemaKind) -> &'static str {
    match kind {
        SchemaKind::String => "string",
        SchemaKind::Number => "number",
        SchemaKind::Integer => "integer",
        SchemaKind::Boolean => "boolean",
        SchemaKind::Object { .. } => "object",
        SchemaKind::Array { .. } => "array",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, expected: &str, value: &Value) -> String {
    let at = if path.is_empty() { "arguments" } else { path };
    format!("'{at}' must be {expected}, got {}", json_type(value))
}
