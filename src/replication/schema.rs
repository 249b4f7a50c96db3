//! Declared field set for replica comparison.
//!
//! Consensus and distance are computed over the declared fields only; any
//! other keys a replica carries are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Number,
    String,
    Boolean,
    /// Any JSON value; compared by equality
    Any,
}

impl FieldKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Any => true,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Number => "number",
            FieldKind::String => "string",
            FieldKind::Boolean => "boolean",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    /// Value of this field in a replica's output, if present and not null
    pub fn extract<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        data.get(&self.name).filter(|value| !value.is_null())
    }
}

/// Validates replica output and declares the fields compared across replicas
pub trait SchemaValidator: Send + Sync {
    fn fields(&self) -> &[FieldSpec];

    /// Validation errors for one replica's output; empty when valid
    fn validate(&self, data: &Value) -> Vec<String> {
        if !data.is_object() {
            return vec!["replica output must be a JSON object".to_string()];
        }

        let mut errors = Vec::new();
        for field in self.fields() {
            match field.extract(data) {
                None if field.required => {
                    errors.push(format!("missing required field '{}'", field.name));
                }
                Some(value) if !field.kind.accepts(value) => errors.push(format!(
                    "field '{}' expected {}, got {}",
                    field.name,
                    field.kind.as_str(),
                    json_type(value)
                )),
                _ => {}
            }
        }
        errors
    }
}

/// Plain field-list schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

impl SchemaValidator for FieldSchema {
    fn fields(&self) -> &[FieldSpec] {
        &self.fields
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
