//! Tool abstraction for agents.
//!
//! Agents call tools by name from their ReAct loop. A tool receives the raw
//! `Action Input` text and returns an observation string.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utilities::errors::{ToolFailureKind, ToolInvocationError};

// ---------------------------------------------------------------------------
// EnvVar
// ---------------------------------------------------------------------------

/// Environment variable a tool requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl EnvVar {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    /// Read the variable, treating an empty value as unset.
    pub fn read(&self) -> Option<String> {
        std::env::var(&self.name).ok().filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// A tool call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::Transient,
            message: message.into(),
        }
    }

    /// A failure retrying will not fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::ContentPolicy,
            message: message.into(),
        }
    }

    /// The agent's input was unusable. The agent sees the message and may
    /// try again within the same invocation.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ToolFailureKind::InvalidInput,
            message: message.into(),
        }
    }

    /// Classify an unsuccessful HTTP status: 429 and 5xx are transient.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::transient(message)
        } else {
            Self::fatal(message)
        }
    }

    /// Attach the tool name.
    pub fn into_invocation_error(self, tool: &str) -> ToolInvocationError {
        ToolInvocationError {
            tool: tool.to_string(),
            kind: self.kind,
            message: self.message,
        }
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        ToolError::transient(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// BaseTool
// ---------------------------------------------------------------------------

/// A capability an agent may invoke.
#[async_trait]
pub trait BaseTool: Send + Sync + fmt::Debug {
    /// The unique name agents use in `Action:` lines.
    fn name(&self) -> &str;

    /// Description used to tell the model how/when/why to use the tool.
    fn description(&self) -> &str;

    /// Environment variables the tool reads.
    fn env_vars(&self) -> Vec<EnvVar> {
        Vec::new()
    }

    /// Run the tool on raw `Action Input` text.
    async fn run(&self, input: &str) -> Result<String, ToolError>;
}

/// Pull a string argument out of JSON action input, or use the text as-is.
///
/// Accepts `{"<key>": "..."}` for any of `keys`, a bare JSON string, or
/// plain text.
pub fn extract_argument(input: &str, keys: &[&str]) -> String {
    let trimmed = input.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => keys
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| trimmed.to_string()),
        Ok(Value::String(s)) => s,
        _ => trimmed.to_string(),
    }
}

/// Render a tool list for an agent prompt.
pub fn render_tools<'a, I>(tools: I) -> String
where
    I: IntoIterator<Item = &'a std::sync::Arc<dyn BaseTool>>,
{
    tools
        .into_iter()
        .map(|t| format!("Tool Name: {}\nTool Description: {}", t.name(), t.description()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
