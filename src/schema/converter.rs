//! Best-effort conversion of raw agent text into schema-typed JSON.
//!
//! Agents frequently wrap their JSON in Markdown fences or prose, quote
//! numbers, or return a bare value where a list was asked for. The helpers
//! here repair those near-misses and collect a [`FieldError`] for anything
//! that cannot be repaired.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{FieldSpec, FieldType};
use crate::utilities::errors::FieldError;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").unwrap());

/// Raised when no JSON value can be recovered from the text.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConverterError {
    pub message: String,
}

impl ConverterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Recover a JSON value from raw agent output.
///
/// Tries, in order: the whole text, each fenced code block, and the span from
/// the first `{` to the last `}`. A whole text that is a JSON string is
/// searched again for an object inside it. A whole text that parses to a
/// non-object is returned only when no object turns up elsewhere.
pub fn extract_json(raw: &str) -> Result<Value, ConverterError> {
    let trimmed = raw.trim();
    let whole = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return Ok(Value::Object(map)),
        Ok(Value::String(inner)) => match extract_json(&inner) {
            Ok(value) if value.is_object() => return Ok(value),
            _ => Some(Value::String(inner)),
        },
        Ok(other) => Some(other),
        Err(_) => None,
    };

    for caps in FENCED_BLOCK.captures_iter(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Ok(value);
        }
    }

    match handle_partial_json(trimmed) {
        Ok(value) => Ok(value),
        Err(e) => whole.ok_or(e),
    }
}

/// Extract the outermost `{...}` span from surrounding prose.
pub fn handle_partial_json(text: &str) -> Result<Value, ConverterError> {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(ConverterError::new("no JSON object found in output"))
}

/// Coerce `value` to `ty`, appending an error for every field that cannot be
/// repaired. The returned value is only meaningful when no errors were added.
pub fn coerce_value(value: &Value, ty: &FieldType, path: &str, errors: &mut Vec<FieldError>) -> Value {
    match ty {
        FieldType::Any => value.clone(),
        FieldType::String => match value {
            Value::String(_) => value.clone(),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => {
                errors.push(FieldError::new(path, format!("expected string, got {}", kind_of(other))));
                Value::Null
            }
        },
        FieldType::Number { min, max } => {
            let Some(number) = as_f64(value) else {
                errors.push(FieldError::new(path, format!("expected number, got {}", kind_of(value))));
                return Value::Null;
            };
            let below = min.map_or(false, |lo| number < lo);
            let above = max.map_or(false, |hi| number > hi);
            if below || above {
                errors.push(FieldError::new(
                    path,
                    format!("expected {}, got {}", ty.describe(), number),
                ));
                return Value::Null;
            }
            if value.is_number() {
                return value.clone();
            }
            serde_json::Number::from_f64(number)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        FieldType::Integer { min, max } => {
            let Some(number) = as_i64(value) else {
                errors.push(FieldError::new(path, format!("expected integer, got {}", kind_of(value))));
                return Value::Null;
            };
            let below = min.map_or(false, |lo| number < lo);
            let above = max.map_or(false, |hi| number > hi);
            if below || above {
                errors.push(FieldError::new(
                    path,
                    format!("expected {}, got {}", ty.describe(), number),
                ));
                return Value::Null;
            }
            Value::from(number)
        }
        FieldType::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Value::Bool(true),
                "false" | "no" => Value::Bool(false),
                _ => {
                    errors.push(FieldError::new(path, format!("expected boolean, got \"{}\"", s)));
                    Value::Null
                }
            },
            other => {
                errors.push(FieldError::new(path, format!("expected boolean, got {}", kind_of(other))));
                Value::Null
            }
        },
        FieldType::List { items } => match value {
            Value::Array(elements) => Value::Array(
                elements
                    .iter()
                    .enumerate()
                    .map(|(i, el)| coerce_value(el, items, &format!("{}/{}", path, i), errors))
                    .collect(),
            ),
            Value::Null => {
                errors.push(FieldError::new(path, "expected list, got null"));
                Value::Null
            }
            scalar => Value::Array(vec![coerce_value(scalar, items, &format!("{}/0", path), errors)]),
        },
        FieldType::Map { values } => match value {
            Value::Object(entries) => {
                let mut out = Map::new();
                for (key, entry) in entries {
                    let coerced = coerce_value(entry, values, &format!("{}/{}", path, key), errors);
                    out.insert(key.clone(), coerced);
                }
                Value::Object(out)
            }
            other => {
                errors.push(FieldError::new(path, format!("expected mapping, got {}", kind_of(other))));
                Value::Null
            }
        },
        FieldType::Object { fields } => coerce_object(value, fields, path, errors),
    }
}

/// Coerce an object against its declared fields.
///
/// Missing or null optional fields take their default; unknown fields are
/// dropped.
pub fn coerce_object(value: &Value, fields: &[FieldSpec], path: &str, errors: &mut Vec<FieldError>) -> Value {
    let Value::Object(entries) = value else {
        errors.push(FieldError::new(path, format!("expected object, got {}", kind_of(value))));
        return Value::Null;
    };

    let mut out = Map::new();
    for field in fields {
        let field_path = format!("{}/{}", path, field.name);
        match entries.get(&field.name) {
            Some(Value::Null) | None if field.required => {
                errors.push(FieldError::new(field_path, "missing required field"));
            }
            Some(Value::Null) | None => {
                out.insert(field.name.clone(), field.default_value());
            }
            Some(present) => {
                let coerced = coerce_value(present, &field.ty, &field_path, errors);
                out.insert(field.name.clone(), coerced);
            }
        }
    }
    Value::Object(out)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
