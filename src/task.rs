//! Task definitions.
//!
//! A [`Task`] is the static declaration of one unit of work: its prompt
//! template, the role bound to it, the schema its result must satisfy and
//! the tasks it depends on. Runtime state lives in the task graph.

use std::collections::HashMap;
use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::utilities::string_utils::interpolate_only;

/// One named unit of work producing a single schema-typed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique name; also the identity key in the task graph.
    pub name: String,
    /// Prompt template describing the work.
    pub description: String,
    /// Prompt template describing the expected result.
    pub expected_output: String,
    /// Name of the role bound to produce this task.
    pub agent: String,
    /// Name of the output schema the result must satisfy.
    pub output_schema: String,
    /// Names of prerequisite tasks.
    #[serde(default)]
    pub context: Vec<String>,
    /// Whether the session may finish without this task.
    #[serde(default)]
    pub optional: bool,
    /// Tool whitelist override; the bound role's tools when unset.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(skip)]
    original_description: Option<String>,
    #[serde(skip)]
    original_expected_output: Option<String>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        expected_output: impl Into<String>,
        agent: impl Into<String>,
        output_schema: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            expected_output: expected_output.into(),
            agent: agent.into(),
            output_schema: output_schema.into(),
            context: Vec::new(),
            optional: false,
            tools: None,
            original_description: None,
            original_expected_output: None,
        }
    }

    /// Declare prerequisite tasks.
    pub fn with_context<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Interpolate run inputs into the description and expected output.
    ///
    /// The uninterpolated templates are kept so [`key`](Self::key) stays
    /// stable across sessions with different inputs.
    ///
    /// # Errors
    /// Returns a message naming the first missing template variable.
    pub fn interpolate_inputs(&mut self, inputs: &HashMap<String, String>) -> Result<(), String> {
        let description_template = self
            .original_description
            .get_or_insert_with(|| self.description.clone())
            .clone();
        let expected_template = self
            .original_expected_output
            .get_or_insert_with(|| self.expected_output.clone())
            .clone();

        self.description = interpolate_only(&description_template, inputs)?;
        self.expected_output = interpolate_only(&expected_template, inputs)?;
        Ok(())
    }

    /// The task portion of an agent prompt.
    pub fn prompt(&self) -> String {
        format!("{}\n\nExpected Output: {}", self.description, self.expected_output)
    }

    /// Session-independent identifier, derived from the original templates.
    pub fn key(&self) -> String {
        let desc = self.original_description.as_deref().unwrap_or(&self.description);
        let expected = self
            .original_expected_output
            .as_deref()
            .unwrap_or(&self.expected_output);

        let source = format!("{}|{}", desc, expected);
        let mut hasher = Md5::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task(name={}, agent={})", self.name, self.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "market_dynamics_task",
            "Analyse {industry} in {geography}.",
            "A report for {industry}.",
            "market_analyst",
            "MarketDynamicsReport",
        )
    }

    fn inputs(industry: &str) -> HashMap<String, String> {
        let mut inputs = HashMap::new();
        inputs.insert("industry".to_string(), industry.to_string());
        inputs.insert("geography".to_string(), "Europe".to_string());
        inputs
    }

    #[test]
    fn test_interpolation_keeps_key_stable() {
        let base_key = task().key();
        let mut a = task();
        a.interpolate_inputs(&inputs("Marine")).unwrap();
        let mut b = task();
        b.interpolate_inputs(&inputs("Aerospace")).unwrap();
        assert_eq!(a.description, "Analyse Marine in Europe.");
        assert_eq!(a.key(), base_key);
        assert_eq!(b.key(), base_key);
    }

    #[test]
    fn test_reinterpolation_uses_original_template() {
        let mut t = task();
        t.interpolate_inputs(&inputs("Marine")).unwrap();
        t.interpolate_inputs(&inputs("Rail")).unwrap();
        assert_eq!(t.expected_output, "A report for Rail.");
    }

    #[test]
    fn test_missing_input_is_reported() {
        let mut t = task();
        let err = t.interpolate_inputs(&HashMap::new()).unwrap_err();
        assert!(err.contains("industry"));
    }

    #[test]
    fn test_prompt_includes_expected_output() {
        assert!(task().prompt().ends_with("Expected Output: A report for {industry}."));
    }
}
