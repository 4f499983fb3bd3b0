//! Action payload schemas and validation.
//!
//! Payloads are JSON objects. Validation reports every violation at once so
//! a client can fix a request in one round trip.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CalibrationError, Result, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Number,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: String,
}

/// Declared fields of an action payload. Unknown fields are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadSchema {
    pub fields: Vec<FieldSpec>,
}

impl PayloadSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required_number(mut self, name: &str, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            kind: FieldKind::Number,
            required: true,
            description: description.to_owned(),
        });
        self
    }

    #[must_use]
    pub fn optional_bool(mut self, name: &str, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            kind: FieldKind::Bool,
            required: false,
            description: description.to_owned(),
        });
        self
    }

    /// Check `payload` against the schema. `null` counts as an empty object.
    pub fn validate(&self, action: &str, payload: &Value) -> Result<Payload> {
        let empty = Map::new();
        let obj = match payload {
            Value::Null => &empty,
            Value::Object(o) => o,
            other => {
                return Err(CalibrationError::Validation {
                    action: action.to_owned(),
                    violations: vec![Violation::new(
                        "<payload>",
                        format!("expected an object, got {}", type_name(other)),
                    )],
                });
            }
        };

        let mut violations = Vec::new();
        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    violations.push(Violation::new(&field.name, "required field is missing"));
                }
                None | Some(Value::Null) => {}
                Some(v) => {
                    let ok = match field.kind {
                        FieldKind::Number => v.as_f64().is_some_and(f64::is_finite),
                        FieldKind::Bool => v.is_boolean(),
                    };
                    if !ok {
                        let want = match field.kind {
                            FieldKind::Number => "a finite number",
                            FieldKind::Bool => "a boolean",
                        };
                        violations.push(Violation::new(
                            &field.name,
                            format!("expected {want}, got {}", type_name(v)),
                        ));
                    }
                }
            }
        }
        for key in obj.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                violations.push(Violation::new(key, "unknown field"));
            }
        }

        if violations.is_empty() {
            Ok(Payload(obj.clone()))
        } else {
            Err(CalibrationError::Validation {
                action: action.to_owned(),
                violations,
            })
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A payload that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn number(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Required number field. Only fails if the schema did not declare it.
    pub(crate) fn require_number(&self, name: &str) -> Result<f64> {
        self.number(name).ok_or_else(|| CalibrationError::Validation {
            action: String::new(),
            violations: vec![Violation::new(name, "required field is missing")],
        })
    }
}
