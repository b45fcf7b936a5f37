//! Translation of MCP tool input schemas into model function declarations
//!
//! MCP servers describe their tools with free-form JSON Schema, while
//! function-calling model APIs accept only a narrow subset of it. `translate`
//! maps one onto the other and never fails: anything it cannot carry over is
//! coerced, defaulted or dropped, and each such adjustment is reported as a
//! [`SchemaDiagnostic`] so the caller can decide how loudly to surface it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A tool as advertised by a backend service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "string" => Some(SchemaType::String),
            "number" => Some(SchemaType::Number),
            "integer" => Some(SchemaType::Integer),
            "boolean" => Some(SchemaType::Boolean),
            "array" => Some(SchemaType::Array),
            "object" => Some(SchemaType::Object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

impl Default for ParametersSchema {
    fn default() -> Self {
        Self {
            schema_type: SchemaType::Object,
            properties: BTreeMap::new(),
            required: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    DefaultDescription,
    MissingInputSchema,
    MalformedProperties,
    MalformedProperty { property: String },
    CoercedType { property: String, found: String },
    DefaultedArrayItems { property: String },
    DroppedRequired { property: String },
    MalformedRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDiagnostic {
    pub tool: String,
    pub kind: DiagnosticKind,
}

impl fmt::Display for SchemaDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tool = &self.tool;
        match &self.kind {
            DiagnosticKind::DefaultDescription => {
                write!(f, "tool '{}' has a missing or empty description, using default", tool)
            }
            DiagnosticKind::MissingInputSchema => {
                write!(f, "tool '{}' has no usable input schema, declaring no parameters", tool)
            }
            DiagnosticKind::MalformedProperties => {
                write!(f, "tool '{}' has a non-object 'properties' entry, ignoring it", tool)
            }
            DiagnosticKind::MalformedProperty { property } => {
                write!(f, "skipping malformed property '{}' in tool '{}'", property, tool)
            }
            DiagnosticKind::CoercedType { property, found } => write!(
                f,
                "invalid type {} for '{}' in tool '{}', defaulting to string",
                found, property, tool
            ),
            DiagnosticKind::DefaultedArrayItems { property } => write!(
                f,
                "array property '{}' in tool '{}' has missing or invalid 'items', defaulting to string items",
                property, tool
            ),
            DiagnosticKind::DroppedRequired { property } => write!(
                f,
                "required parameter '{}' of tool '{}' is not a declared property, dropping it",
                property, tool
            ),
            DiagnosticKind::MalformedRequired => {
                write!(f, "tool '{}' has a malformed 'required' list, ignoring it", tool)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub declaration: FunctionDeclaration,
    pub diagnostics: Vec<SchemaDiagnostic>,
}

pub fn default_description(tool_name: &str) -> String {
    format!("Tool to perform {}", tool_name)
}

/// Convert one tool descriptor into a function declaration.
pub fn translate(tool: &ToolDescriptor) -> Translation {
    let mut diagnostics = Vec::new();
    let mut report = |kind: DiagnosticKind| {
        diagnostics.push(SchemaDiagnostic {
            tool: tool.name.clone(),
            kind,
        })
    };

    let description = match tool.description.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => tool.description.clone().unwrap_or_default(),
        _ => {
            report(DiagnosticKind::DefaultDescription);
            default_description(&tool.name)
        }
    };

    let mut parameters = ParametersSchema::default();

    match tool.input_schema.as_object() {
        Some(schema) => {
            match schema.get("properties") {
                None | Some(Value::Null) => {}
                Some(Value::Object(props)) => {
                    for (name, raw) in props {
                        match translate_property(name, raw, &mut report) {
                            Some(prop) => {
                                parameters.properties.insert(name.clone(), prop);
                            }
                            None => report(DiagnosticKind::MalformedProperty {
                                property: name.clone(),
                            }),
                        }
                    }
                }
                Some(_) => report(DiagnosticKind::MalformedProperties),
            }

            parameters.required = translate_required(schema.get("required"), &parameters, &mut report);
        }
        None => report(DiagnosticKind::MissingInputSchema),
    }

    Translation {
        declaration: FunctionDeclaration {
            name: tool.name.clone(),
            description,
            parameters,
        },
        diagnostics,
    }
}

fn translate_property(
    name: &str,
    raw: &Value,
    report: &mut impl FnMut(DiagnosticKind),
) -> Option<PropertySchema> {
    let prop = raw.as_object()?;

    let schema_type = match prop.get("type") {
        None | Some(Value::Null) => SchemaType::String,
        Some(Value::String(s)) => SchemaType::parse(s).unwrap_or_else(|| {
            report(DiagnosticKind::CoercedType {
                property: name.to_string(),
                found: s.clone(),
            });
            SchemaType::String
        }),
        // ["integer", "null"] style unions: take the first concrete kind.
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .filter(|k| !k.eq_ignore_ascii_case("null"))
            .find_map(SchemaType::parse)
            .unwrap_or_else(|| {
                report(DiagnosticKind::CoercedType {
                    property: name.to_string(),
                    found: Value::Array(kinds.clone()).to_string(),
                });
                SchemaType::String
            }),
        Some(other) => {
            report(DiagnosticKind::CoercedType {
                property: name.to_string(),
                found: other.to_string(),
            });
            SchemaType::String
        }
    };

    let description = prop
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    let enum_values = prop.get("enum").and_then(Value::as_array).cloned();

    let items = if schema_type == SchemaType::Array {
        match prop.get("items") {
            Some(items @ Value::Object(_)) => Some(items.clone()),
            _ => {
                report(DiagnosticKind::DefaultedArrayItems {
                    property: name.to_string(),
                });
                Some(json!({"type": "string"}))
            }
        }
    } else {
        None
    };

    Some(PropertySchema {
        schema_type,
        description,
        enum_values,
        items,
    })
}

fn translate_required(
    raw: Option<&Value>,
    parameters: &ParametersSchema,
    report: &mut impl FnMut(DiagnosticKind),
) -> Option<Vec<String>> {
    let list = match raw {
        None | Some(Value::Null) => return None,
        Some(Value::Array(list)) => list,
        Some(_) => {
            report(DiagnosticKind::MalformedRequired);
            return None;
        }
    };

    let mut required = Vec::new();
    for entry in list {
        match entry.as_str() {
            Some(name) if parameters.properties.contains_key(name) => {
                if !required.iter().any(|r: &String| r == name) {
                    required.push(name.to_string());
                }
            }
            Some(name) => report(DiagnosticKind::DroppedRequired {
                property: name.to_string(),
            }),
            None => report(DiagnosticKind::MalformedRequired),
        }
    }

    if required.is_empty() {
        None
    } else {
        Some(required)
    }
}

/// Render declarations as the JSON the model API expects.
pub fn declarations_to_value(declarations: &[FunctionDeclaration]) -> Value {
    let list: Vec<Value> = declarations
        .iter()
        .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
        .collect();
    let mut map = Map::new();
    map.insert("functionDeclarations".to_string(), Value::Array(list));
    Value::Object(map)
}
