//! Session configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agents::DEFAULT_MAX_ITER;
use crate::memory::RetryPolicy;
use crate::tasks::task_graph::DEFAULT_RETRY_CEILING;

/// What happens when a task exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResultPolicy {
    /// Any exhausted task aborts the session.
    #[default]
    Abort,
    /// Exhausted optional tasks are skipped; dependents treat them as
    /// satisfied. Required tasks still abort.
    SkipOptional,
}

/// Memory settings for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Whether agents get memory context and write their results back.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite file for durable memory; the platform data directory when unset.
    #[serde(default)]
    pub durable_path: Option<PathBuf>,
    /// Durable records blended into each context bundle.
    #[serde(default = "default_durable_top_k")]
    pub durable_top_k: usize,
    /// Session records blended into each context bundle.
    #[serde(default = "default_session_top_k")]
    pub session_top_k: usize,
    /// Retry policy for unavailable stores.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool { true }
fn default_durable_top_k() -> usize { 2 }
fn default_session_top_k() -> usize { 3 }

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            durable_path: None,
            durable_top_k: default_durable_top_k(),
            session_top_k: default_session_top_k(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for one crew session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewConfig {
    /// Failed attempts after which a task is exhausted.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Invocations in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub partial_results: PartialResultPolicy,
    /// Include succeeded artifacts in the failure report of an aborted run.
    #[serde(default = "default_true")]
    pub return_partial_on_abort: bool,
    /// Task whose artifact is the run result; the last declared task when unset.
    #[serde(default)]
    pub terminal_task: Option<String>,
    /// Copy entity records into durable memory at session end.
    #[serde(default)]
    pub promote_entities: bool,
    /// Tool-loop iteration cap for roles without their own.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_retry_ceiling() -> u32 { DEFAULT_RETRY_CEILING }
fn default_max_concurrency() -> usize { 4 }
fn default_max_iter() -> u32 { DEFAULT_MAX_ITER }

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            max_concurrency: default_max_concurrency(),
            partial_results: PartialResultPolicy::Abort,
            return_partial_on_abort: true,
            terminal_task: None,
            promote_entities: false,
            max_iter: default_max_iter(),
            memory: MemoryConfig::default(),
        }
    }
}
