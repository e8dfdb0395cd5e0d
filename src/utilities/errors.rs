//! Error taxonomy for the crew.
//!
//! Errors are split by the layer that can recover from them: task-local
//! failures ([`TaskFailure`]) are retried by the scheduler, while
//! [`CrewError`] is what a session hands back to its caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::MemoryScope;

// ---------------------------------------------------------------------------
// Graph configuration
// ---------------------------------------------------------------------------

/// The task graph or role set is malformed. Raised before any dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphConfigurationError {
    /// No tasks were declared.
    #[error("task graph is empty")]
    Empty,

    /// Two tasks share a name.
    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    /// Two roles share a name.
    #[error("duplicate role name '{0}'")]
    DuplicateRole(String),

    /// A prerequisite names a task that does not exist.
    #[error("task '{task}' depends on unknown task '{missing}'")]
    DanglingDependency { task: String, missing: String },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A task is bound to a role that was never declared.
    #[error("task '{task}' is bound to unknown role '{role}'")]
    UnknownRole { task: String, role: String },

    /// A task references a schema the registry does not know.
    #[error("task '{task}' references unknown output schema '{schema}'")]
    UnknownSchema { task: String, schema: String },

    /// The designated terminal task is not part of the graph.
    #[error("terminal task '{0}' is not part of the graph")]
    UnknownTerminalTask(String),

    /// Only the manager role may carry delegation permission.
    #[error("role '{0}' declares delegation permission but is not the manager")]
    DelegationNotAllowed(String),

    /// A task or persona template references an input that was not
    /// supplied. `task` names the task, or the role for persona templates.
    #[error("'{task}' has an invalid template: {reason}")]
    Template { task: String, reason: String },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single missing or malformed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Pointer-style path to the field, e.g. `/prospects/0/name`.
    pub path: String,
    /// Human-readable reason.
    pub reason: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {}", path, self.reason)
    }
}

/// Output that could not be coerced into its task's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("output of task '{task}' does not match schema '{schema}': {}", join_field_errors(errors))]
pub struct ValidationError {
    pub task: String,
    pub schema: String,
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    /// Corrective feedback handed to the agent on its next attempt.
    pub fn feedback(&self) -> String {
        let mut lines = vec![format!(
            "Your previous answer did not match the required '{}' format:",
            self.schema
        )];
        lines.extend(self.errors.iter().map(|e| format!("- {}", e)));
        lines.push("Return a single JSON object that fixes every issue above.".to_string());
        lines.join("\n")
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// A memory store stayed unreachable after bounded retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{scope} memory unavailable for {operation} after {attempts} attempt(s): {reason}")]
pub struct MemoryUnavailable {
    pub scope: MemoryScope,
    pub operation: String,
    pub attempts: u32,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Tool / backend invocation
// ---------------------------------------------------------------------------

/// Whether a failed external call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// Network blips, rate limits, upstream 5xx.
    Transient,
    /// The backend refused the content or the request outright.
    ContentPolicy,
    /// The agent passed unusable input; shown to the agent as an observation.
    InvalidInput,
}

/// The generation backend or a tool failed during an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tool} failed ({kind:?}): {message}")]
pub struct ToolInvocationError {
    pub tool: String,
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolInvocationError {
    pub fn transient(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            kind: ToolFailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn content_policy(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            kind: ToolFailureKind::ContentPolicy,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != ToolFailureKind::ContentPolicy
    }
}

// ---------------------------------------------------------------------------
// Task-level failure
// ---------------------------------------------------------------------------

/// Why a single dispatch of a task did not produce an artifact.
#[derive(Debug, Clone, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Tool(#[from] ToolInvocationError),

    #[error(transparent)]
    Memory(#[from] MemoryUnavailable),

    /// The assigned role reported it cannot finish the task alone.
    #[error("role '{role}' asked for help: {reason}")]
    HelpRequested { role: String, reason: String },

    /// The invocation task itself died (panic or runtime shutdown).
    #[error("invocation did not complete: {0}")]
    Interrupted(String),
}

impl TaskFailure {
    /// Content-policy refusals exhaust a task immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskFailure::Tool(e) => e.is_retryable(),
            _ => true,
        }
    }

    /// Feedback to fold into the next attempt's prompt, if any.
    pub fn corrective_feedback(&self) -> Option<String> {
        match self {
            TaskFailure::Validation(e) => Some(e.feedback()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Session-level error
// ---------------------------------------------------------------------------

/// Errors that end a session without a run outcome.
#[derive(Debug, Error)]
pub enum CrewError {
    #[error(transparent)]
    Configuration(#[from] GraphConfigurationError),

    /// The final durable flush failed.
    #[error(transparent)]
    Memory(#[from] MemoryUnavailable),

    /// A memory store could not be opened.
    #[error("failed to initialise memory: {0}")]
    MemoryInit(String),
}
