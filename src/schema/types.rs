//! Declarative output schema types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// The type of a single schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    String,
    /// Floating-point number with an optional inclusive range.
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Whole number with an optional inclusive range.
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Boolean,
    List { items: Box<FieldType> },
    /// String-keyed mapping with uniformly typed values.
    Map { values: Box<FieldType> },
    Object { fields: Vec<FieldSpec> },
    /// Any JSON value, passed through untouched.
    Any,
}

impl FieldType {
    pub fn number() -> Self {
        FieldType::Number { min: None, max: None }
    }

    pub fn number_in(min: f64, max: f64) -> Self {
        FieldType::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn integer_at_least(min: i64) -> Self {
        FieldType::Integer {
            min: Some(min),
            max: None,
        }
    }

    pub fn list(items: FieldType) -> Self {
        FieldType::List {
            items: Box::new(items),
        }
    }

    pub fn map(values: FieldType) -> Self {
        FieldType::Map {
            values: Box::new(values),
        }
    }

    pub fn object(fields: Vec<FieldSpec>) -> Self {
        FieldType::Object { fields }
    }

    /// Compact rendering used in format instructions.
    pub fn describe(&self) -> String {
        match self {
            FieldType::String => "string".to_string(),
            FieldType::Number { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("number in [{}, {}]", lo, hi),
                (Some(lo), None) => format!("number >= {}", lo),
                (None, Some(hi)) => format!("number <= {}", hi),
                (None, None) => "number".to_string(),
            },
            FieldType::Integer { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("integer in [{}, {}]", lo, hi),
                (Some(lo), None) => format!("integer >= {}", lo),
                (None, Some(hi)) => format!("integer <= {}", hi),
                (None, None) => "integer".to_string(),
            },
            FieldType::Boolean => "boolean".to_string(),
            FieldType::List { items } => format!("[{}]", items.describe()),
            FieldType::Map { values } => format!("{{string: {}}}", values.describe()),
            FieldType::Object { fields } => {
                let inner: Vec<String> = fields.iter().map(FieldSpec::describe).collect();
                format!("{{{}}}", inner.join(", "))
            }
            FieldType::Any => "any".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldSpec
// ---------------------------------------------------------------------------

/// One named field of an object schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub ty: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Value substituted when an optional field is missing or null.
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
            description: None,
        }
    }

    /// An optional field that defaults to `null`.
    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            description: None,
        }
    }

    /// An optional field with an explicit default.
    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The value an absent optional field takes.
    pub fn default_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    fn describe(&self) -> String {
        let marker = if self.required { "" } else { "?" };
        format!("\"{}\"{}: {}", self.name, marker, self.ty.describe())
    }
}

// ---------------------------------------------------------------------------
// OutputSchema
// ---------------------------------------------------------------------------

/// Which items of an artifact are entities worth remembering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityExtraction {
    /// Top-level list field holding the entities.
    pub list_field: String,
    /// Field of each item that carries the entity's name.
    pub name_field: String,
    /// Entity type label stored alongside each record.
    pub entity_type: String,
}

/// The required shape of one task's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub entities: Option<EntityExtraction>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            fields,
            entities: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_entities(
        mut self,
        list_field: impl Into<String>,
        name_field: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        self.entities = Some(EntityExtraction {
            list_field: list_field.into(),
            name_field: name_field.into(),
            entity_type: entity_type.into(),
        });
        self
    }

    /// The schema as an object field type, for recursive validation.
    pub fn as_field_type(&self) -> FieldType {
        FieldType::Object {
            fields: self.fields.clone(),
        }
    }

    /// Format instructions appended to an agent's prompt.
    pub fn format_instructions(&self) -> String {
        let mut lines = vec![format!(
            "Your final answer MUST be a single JSON object matching the '{}' schema:",
            self.name
        )];
        if !self.description.is_empty() {
            lines.push(self.description.clone());
        }
        lines.push("{".to_string());
        for field in &self.fields {
            let mut line = format!("  \"{}\": {}", field.name, field.ty.describe());
            if !field.required {
                line.push_str(" (optional)");
            }
            if let Some(desc) = &field.description {
                line.push_str(&format!("  // {}", desc));
            }
            lines.push(line);
        }
        lines.push("}".to_string());
        lines.join("\n")
    }

    /// `(name, item)` pairs for every entity in a validated value.
    pub fn extract_entities(&self, data: &Value) -> Vec<(String, Value)> {
        let Some(rule) = &self.entities else {
            return Vec::new();
        };
        data.get(&rule.list_field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get(&rule.name_field)?.as_str()?.trim();
                        if name.is_empty() {
                            None
                        } else {
                            Some((name.to_string(), item.clone()))
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
