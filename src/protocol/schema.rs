//! Per-method parameter schemas
//!
//! Schemas are fixed at compile time: a list of named fields, each with a
//! kind and a required flag. Properties not listed are rejected.

use super::frame::quote_list;
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Accepted JSON shape of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    /// String that is non-empty after trimming
    NonEmptyString,
    Bool,
    Integer { min: i64, max: i64 },
    Object,
    StringArray,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::NonEmptyString => matches!(value, Value::String(s) if !s.trim().is_empty()),
            Self::Bool => value.is_boolean(),
            Self::Integer { min, max } => value
                .as_i64()
                .map(|n| n >= *min && n <= *max)
                .unwrap_or(false),
            Self::Object => value.is_object(),
            Self::StringArray => match value {
                Value::Array(items) => items.iter().all(Value::is_string),
                _ => false,
            },
            Self::Any => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "a string".to_string(),
            Self::NonEmptyString => "a non-empty string".to_string(),
            Self::Bool => "a boolean".to_string(),
            Self::Integer { min, max } => format!("an integer in {}..={}", min, max),
            Self::Object => "an object".to_string(),
            Self::StringArray => "an array of strings".to_string(),
            Self::Any => "any value".to_string(),
        }
    }
}

/// One field of a parameter schema
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Parameter schema of one method
#[derive(Debug, Clone, Copy)]
pub struct ParamSchema {
    pub method: &'static str,
    pub fields: &'static [FieldSpec],
}

impl ParamSchema {
    pub const fn new(method: &'static str, fields: &'static [FieldSpec]) -> Self {
        Self { method, fields }
    }

    /// Validate `params`, naming every offending field on failure.
    ///
    /// A missing or `null` params value is treated as an empty object.
    pub fn validate(&self, params: &Value) -> Result<()> {
        let empty = Map::new();
        let obj = match params {
            Value::Null => &empty,
            Value::Object(obj) => obj,
            _ => {
                return Err(Error::InvalidRequest {
                    message: format!("invalid {} params: must be an object", self.method),
                    fields: vec!["params".to_string()],
                })
            }
        };

        let mut problems: Vec<String> = Vec::new();
        let mut fields: Vec<String> = Vec::new();

        let mut unexpected: Vec<String> = obj
            .keys()
            .filter(|k| !self.fields.iter().any(|f| f.name == k.as_str()))
            .cloned()
            .collect();
        unexpected.sort();
        if !unexpected.is_empty() {
            problems.push(format!("unexpected properties {}", quote_list(&unexpected)));
            fields.extend(unexpected);
        }

        for spec in self.fields {
            match obj.get(spec.name) {
                None if spec.required => {
                    problems.push(format!("missing required property '{}'", spec.name));
                    fields.push(spec.name.to_string());
                }
                None => {}
                Some(value) if !spec.kind.accepts(value) => {
                    problems.push(format!(
                        "property '{}' must be {}",
                        spec.name,
                        spec.kind.describe()
                    ));
                    fields.push(spec.name.to_string());
                }
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidRequest {
                message: format!("invalid {} params: {}", self.method, problems.join("; ")),
                fields,
            })
        }
    }
}
