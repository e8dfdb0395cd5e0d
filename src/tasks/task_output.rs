//! Validated task results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The validated, schema-typed result of one task.
///
/// An artifact only exists after the schema registry accepted the
/// producing agent's output; it is never mutated afterwards.
///
/// # Fields
///
/// * `task` - Name of the task that produced it.
/// * `schema` - Name of the output schema it satisfies.
/// * `data` - The structured, coerced value.
/// * `raw` - The agent's raw text before coercion.
/// * `agent` - Role name of the producing agent.
/// * `attempt` - Dispatch attempt that produced it (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task: String,
    pub schema: String,
    pub data: Value,
    pub raw: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(task: impl Into<String>, schema: impl Into<String>, data: Value, raw: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            schema: schema.into(),
            data,
            raw: raw.into(),
            agent: String::new(),
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    /// Stamp the producing agent and attempt.
    pub fn produced_by(mut self, agent: impl Into<String>, attempt: u32) -> Self {
        self.agent = agent.into();
        self.attempt = attempt;
        self
    }

    /// Top-level field lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Compact JSON rendering of the structured data.
    pub fn to_json_string(&self) -> String {
        self.data.to_string()
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(&self.data) {
            Ok(pretty) => write!(f, "{}", pretty),
            Err(_) => write!(f, "{}", self.raw),
        }
    }
}
