//! Conversion of server tool schemas into [`ToolDefinition`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::SchemaError;
use crate::protocol::MCPToolInfo;

/// Normalized parameter schema node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub kind: SchemaKind,
    /// Description, preserved verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed values, when the server declared an `enum`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

/// Shape of a [`SchemaNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaKind {
    String,
    Number,
    Integer,
    Boolean,
    Object { fields: Vec<Field> },
    Array { items: Box<SchemaNode> },
}

/// One named property of an object node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: SchemaNode,
    pub required: bool,
}

impl SchemaNode {
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            allowed: None,
        }
    }

    /// An object node with no fields.
    pub fn empty_object() -> Self {
        Self::new(SchemaKind::Object { fields: Vec::new() })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Fields of an object node; empty for every other kind.
    pub fn fields(&self) -> &[Field] {
        match &self.kind {
            SchemaKind::Object { fields } => fields,
            _ => &[],
        }
    }

    /// Renders the node back to JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        match &self.kind {
            SchemaKind::String => {
                out.insert("type".into(), json!("string"));
            }
            SchemaKind::Number => {
                out.insert("type".into(), json!("number"));
            }
            SchemaKind::Integer => {
                out.insert("type".into(), json!("integer"));
            }
            SchemaKind::Boolean => {
                out.insert("type".into(), json!("boolean"));
            }
            SchemaKind::Object { fields } => {
                out.insert("type".into(), json!("object"));
                let properties: Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.name.clone(), f.schema.to_json_schema()))
                    .collect();
                out.insert("properties".into(), Value::Object(properties));
                let required: Vec<Value> = fields
                    .iter()
                    .filter(|f| f.required)
                    .map(|f| json!(f.name))
                    .collect();
                if !required.is_empty() {
                    out.insert("required".into(), Value::Array(required));
                }
            }
            SchemaKind::Array { items } => {
                out.insert("type".into(), json!("array"));
                out.insert("items".into(), items.to_json_schema());
            }
        }
        if let Some(description) = &self.description {
            out.insert("description".into(), json!(description));
        }
        if let Some(allowed) = &self.allowed {
            out.insert("enum".into(), Value::Array(allowed.clone()));
        }
        Value::Object(out)
    }
}

/// A tool offered by a server, in the client's own schema format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, unique per server
    pub name: String,
    /// What the tool does
    pub description: String,
    /// Parameter schema; always an object node
    pub parameters: SchemaNode,
}

impl ToolDefinition {
    /// JSON Schema of the tool's parameters.
    pub fn input_schema(&self) -> Value {
        self.parameters.to_json_schema()
    }

    /// Renders the definition back to the server's wire shape.
    pub fn to_tool_info(&self) -> MCPToolInfo {
        MCPToolInfo {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: self.input_schema(),
        }
    }
}

const UNSUPPORTED_KEYWORDS: &[&str] = &["$ref", "oneOf", "anyOf", "allOf", "not"];

/// Converts one advertised tool.
pub fn convert_tool(tool: &MCPToolInfo) -> Result<ToolDefinition, SchemaError> {
    if tool.name.trim().is_empty() {
        return Err(SchemaError::new("", "tool name must not be empty"));
    }

    let parameters = convert_parameters(&tool.input_schema)?;
    Ok(ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        parameters,
    })
}

/// Converts a tool's top-level input schema, which must describe an object.
pub fn convert_parameters(schema: &Value) -> Result<SchemaNode, SchemaError> {
    let obj = schema
        .as_object()
        .ok_or_else(|| SchemaError::new("#", "input schema must be a JSON object"))?;

    // `{}` and `{"description": ..}` mean "no parameters" at the top level.
    if !obj.contains_key("type") && !obj.contains_key("properties") {
        check_keywords(obj, "#")?;
        let mut node = SchemaNode::empty_object();
        node.description = description_of(obj);
        return Ok(node);
    }

    let node = convert_node(schema, "#")?;
    if !matches!(node.kind, SchemaKind::Object { .. }) {
        return Err(SchemaError::new("#", "input schema must describe an object"));
    }
    Ok(node)
}

fn convert_node(schema: &Value, path: &str) -> Result<SchemaNode, SchemaError> {
    let obj = schema
        .as_object()
        .ok_or_else(|| SchemaError::new(path, "schema node must be a JSON object"))?;
    check_keywords(obj, path)?;

    let type_name = match obj.get("type") {
        Some(Value::String(name)) => name.as_str(),
        Some(Value::Array(_)) => return Err(SchemaError::new(path, "union types are not supported")),
        Some(other) => return Err(SchemaError::new(path, format!("invalid type {other}"))),
        None if obj.contains_key("properties") => "object",
        None => return Err(SchemaError::new(path, "missing type")),
    };

    let kind = match type_name {
        "string" => SchemaKind::String,
        "number" => SchemaKind::Number,
        "integer" => SchemaKind::Integer,
        "boolean" => SchemaKind::Boolean,
        "object" => SchemaKind::Object {
            fields: convert_fields(obj, path)?,
        },
        "array" => {
            let items = obj
                .get("items")
                .ok_or_else(|| SchemaError::new(path, "array without items"))?;
            if items.is_array() {
                return Err(SchemaError::new(path, "tuple arrays are not supported"));
            }
            SchemaKind::Array {
                items: Box::new(convert_node(items, &format!("{path}/items"))?),
            }
        }
        "null" => return Err(SchemaError::new(path, "null type is not supported")),
        other => return Err(SchemaError::new(path, format!("unknown type '{other}'"))),
    };

    let allowed = match obj.get("enum") {
        Some(Value::Array(values)) => Some(values.clone()),
        Some(_) => return Err(SchemaError::new(path, "enum must be an array")),
        None => None,
    };

    Ok(SchemaNode {
        kind,
        description: description_of(obj),
        allowed,
    })
}

fn convert_fields(obj: &Map<String, Value>, path: &str) -> Result<Vec<Field>, SchemaError> {
    let required: Vec<&str> = match obj.get("required") {
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        Some(_) => return Err(SchemaError::new(path, "required must be an array")),
        None => Vec::new(),
    };

    let empty = Map::new();
    let properties = match obj.get("properties") {
        Some(Value::Object(properties)) => properties,
        Some(_) => return Err(SchemaError::new(path, "properties must be an object")),
        None => &empty,
    };

    if let Some(undeclared) = required.iter().find(|name| !properties.contains_key(**name)) {
        return Err(SchemaError::new(
            format!("{path}/required"),
            format!("required field '{undeclared}' is not a declared property"),
        ));
    }

    properties
        .iter()
        .map(|(name, schema)| {
            Ok(Field {
                name: name.clone(),
                schema: convert_node(schema, &format!("{path}/properties/{name}"))?,
                required: required.contains(&name.as_str()),
            })
        })
        .collect()
}

fn check_keywords(obj: &Map<String, Value>, path: &str) -> Result<(), SchemaError> {
    match UNSUPPORTED_KEYWORDS.iter().find(|k| obj.contains_key(**k)) {
        Some(keyword) => Err(SchemaError::new(path, format!("'{keyword}' is not supported"))),
        None => Ok(()),
    }
}

fn description_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("description").and_then(Value::as_str).map(str::to_string)
}
