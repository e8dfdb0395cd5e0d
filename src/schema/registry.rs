//! Registry of output schemas and their task bindings.

use std::collections::HashMap;

use serde_json::Value;

use super::converter::{coerce_object, extract_json};
use super::types::OutputSchema;
use crate::tasks::task_output::Artifact;
use crate::utilities::errors::{FieldError, ValidationError};

/// Result of validating raw output against a task's schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid(Artifact),
    Invalid(ValidationError),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }

    pub fn into_result(self) -> Result<Artifact, ValidationError> {
        match self {
            ValidationOutcome::Valid(artifact) => Ok(artifact),
            ValidationOutcome::Invalid(err) => Err(err),
        }
    }
}

/// Maps task names to the schemas their results must satisfy.
///
/// Validation is a pure function of the registry contents and the raw
/// text, so the registry is shared read-only across concurrent dispatches.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, OutputSchema>,
    bindings: HashMap<String, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its own name, replacing any previous one.
    pub fn register(&mut self, schema: OutputSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.register(schema);
        self
    }

    /// Bind a task to a registered schema. Returns `false` if the schema is unknown.
    pub fn bind(&mut self, task: impl Into<String>, schema: &str) -> bool {
        if !self.schemas.contains_key(schema) {
            return false;
        }
        self.bindings.insert(task.into(), schema.to_string());
        true
    }

    pub fn contains(&self, schema: &str) -> bool {
        self.schemas.contains_key(schema)
    }

    pub fn schema(&self, name: &str) -> Option<&OutputSchema> {
        self.schemas.get(name)
    }

    pub fn schema_for_task(&self, task: &str) -> Option<&OutputSchema> {
        self.bindings.get(task).and_then(|name| self.schemas.get(name))
    }

    /// Validate raw agent output for `task`.
    ///
    /// Conforming JSON is accepted as-is; near misses are repaired by the
    /// converter; everything else yields every field error found.
    pub fn validate(&self, task: &str, raw: &str) -> ValidationOutcome {
        let Some(schema) = self.schema_for_task(task) else {
            return ValidationOutcome::Invalid(ValidationError {
                task: task.to_string(),
                schema: String::new(),
                errors: vec![FieldError::new("", "no output schema bound to task")],
            });
        };

        let value = match extract_json(raw) {
            Ok(value) => value,
            Err(e) => {
                return ValidationOutcome::Invalid(ValidationError {
                    task: task.to_string(),
                    schema: schema.name.clone(),
                    errors: vec![FieldError::new("", e.message)],
                })
            }
        };

        match self.validate_value(schema, &value) {
            Ok(data) => ValidationOutcome::Valid(Artifact::new(task, &schema.name, data, raw)),
            Err(errors) => ValidationOutcome::Invalid(ValidationError {
                task: task.to_string(),
                schema: schema.name.clone(),
                errors,
            }),
        }
    }

    /// Coerce an already-parsed value against `schema`.
    pub fn validate_value(&self, schema: &OutputSchema, value: &Value) -> Result<Value, Vec<FieldError>> {
        let mut errors = Vec::new();
        let data = coerce_object(value, &schema.fields, "", &mut errors);
        if errors.is_empty() {
            Ok(data)
        } else {
            Err(errors)
        }
    }

    /// Whether a recorded artifact still satisfies its schema unchanged.
    pub fn conforms(&self, artifact: &Artifact) -> bool {
        self.schema(&artifact.schema)
            .map(|schema| {
                self.validate_value(schema, &artifact.data)
                    .map(|data| data == artifact.data)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{FieldSpec, FieldType};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new().with_schema(OutputSchema::new(
            "FinalDecision",
            vec![
                FieldSpec::required("recommended_targets", FieldType::list(FieldType::String)),
                FieldSpec::required("decision_summary", FieldType::String),
                FieldSpec::required("confidence", FieldType::number_in(0.0, 1.0)),
                FieldSpec::required("next_steps", FieldType::list(FieldType::String)).with_default(json!([])),
            ],
        ));
        assert!(registry.bind("final_decision_task", "FinalDecision"));
        registry
    }

    #[test]
    fn test_conforming_output_is_valid() {
        let raw = r#"{"recommended_targets": ["Kongsberg"], "decision_summary": "Go", "confidence": 0.8, "next_steps": []}"#;
        let artifact = registry().validate("final_decision_task", raw).into_result().unwrap();
        assert_eq!(artifact.schema, "FinalDecision");
        assert_eq!(artifact.get("confidence"), Some(&json!(0.8)));
        assert_eq!(artifact.raw, raw);
    }

    #[test]
    fn test_near_miss_is_repaired() {
        let raw = "Thought: done\n```json\n{\"recommended_targets\": \"Kongsberg\", \"decision_summary\": \"Go\", \"confidence\": \"0.6\"}\n```";
        let registry = registry();
        let artifact = registry.validate("final_decision_task", raw).into_result().unwrap();
        assert_eq!(artifact.get("recommended_targets"), Some(&json!(["Kongsberg"])));
        assert_eq!(artifact.get("next_steps"), Some(&json!([])));
        assert!(registry.conforms(&artifact));
    }

    #[test]
    fn test_output_quoted_as_json_string_is_accepted() {
        let raw = r#""{\"recommended_targets\": [\"Kongsberg\"], \"decision_summary\": \"Go\", \"confidence\": 0.8}""#;
        let artifact = registry().validate("final_decision_task", raw).into_result().unwrap();
        assert_eq!(artifact.get("decision_summary"), Some(&json!("Go")));
    }

    #[test]
    fn test_invalid_output_lists_all_errors() {
        let raw = r#"{"recommended_targets": [], "confidence": 1.7}"#;
        match registry().validate("final_decision_task", raw) {
            ValidationOutcome::Invalid(err) => {
                let paths: Vec<&str> = err.errors.iter().map(|e| e.path.as_str()).collect();
                assert_eq!(paths, vec!["/decision_summary", "/confidence"]);
            }
            ValidationOutcome::Valid(_) => panic!("expected invalid outcome"),
        }
    }

    #[test]
    fn test_unbound_task_is_invalid() {
        assert!(!registry().validate("unknown_task", "{}").is_valid());
    }

    #[test]
    fn test_bind_unknown_schema_fails() {
        let mut registry = registry();
        assert!(!registry.bind("x", "Missing"));
    }
}
