//! Generation backend contract.
//!
//! Agents and the manager policy only ever see [`BaseLLM`]; concrete
//! providers live under [`providers`](super::providers).

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::utilities::errors::ToolInvocationError;

/// Name under which backend failures are reported.
pub const GENERATION_TOOL_NAME: &str = "generation";

/// Failure of a generation call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LLMError {
    /// Network errors, rate limits, upstream 5xx. Worth retrying.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// The backend refused the content.
    #[error("content policy refusal: {0}")]
    ContentPolicy(String),

    /// The request itself was rejected (auth, bad request, missing key).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl LLMError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LLMError::Transient(_))
    }
}

impl From<LLMError> for ToolInvocationError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Transient(msg) => ToolInvocationError::transient(GENERATION_TOOL_NAME, msg),
            other => ToolInvocationError::content_policy(GENERATION_TOOL_NAME, other.to_string()),
        }
    }
}

/// A language-generation backend.
///
/// Implementations must be safe to call concurrently; the scheduler runs
/// independent tasks in parallel against the same backend.
#[async_trait]
pub trait BaseLLM: Send + Sync + fmt::Debug {
    /// Model identifier.
    fn model(&self) -> &str;

    /// Generate a completion for `prompt`.
    ///
    /// # Arguments
    /// * `prompt` - The full prompt text.
    /// * `tools_allowed` - Tools the caller may invoke after this turn. Providers
    ///   use it to stop generation before a fabricated observation.
    async fn generate(&self, prompt: &str, tools_allowed: &[String]) -> Result<String, LLMError>;
}
