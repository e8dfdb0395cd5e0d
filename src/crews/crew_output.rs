//! Crew output representation.
//!
//! A session ends in one of two ways: the terminal task's artifact, or a
//! [`FailureReport`] explaining why the run stopped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tasks::task_output::Artifact;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Aborted,
}

/// A task that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustedTask {
    pub task: String,
    pub failures: u32,
    pub last_error: Option<String>,
}

/// Why an aborted session stopped.
///
/// # Fields
///
/// * `exhausted` - Required tasks that exhausted their retries.
/// * `cancelled` - The session was cancelled from outside.
/// * `stalled` - Nothing could make progress.
/// * `partial_artifacts` - Artifacts of tasks that did succeed, when
///   configured to return them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub exhausted: Vec<ExhaustedTask>,
    pub cancelled: bool,
    #[serde(default)]
    pub stalled: bool,
    #[serde(default)]
    pub partial_artifacts: Vec<Artifact>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            writeln!(f, "Session cancelled.")?;
        }
        if self.stalled {
            writeln!(f, "Session stalled: no task could make progress.")?;
        }
        for task in &self.exhausted {
            writeln!(
                f,
                "Task '{}' exhausted its retries after {} failure(s). Last error: {}",
                task.task,
                task.failures,
                task.last_error.as_deref().unwrap_or("none recorded")
            )?;
        }
        if !self.partial_artifacts.is_empty() {
            let names: Vec<&str> = self.partial_artifacts.iter().map(|a| a.task.as_str()).collect();
            writeln!(f, "Completed before abort: {}", names.join(", "))?;
        }
        Ok(())
    }
}

/// Result of one crew session.
///
/// # Fields
///
/// * `status` - Completed or aborted.
/// * `final_artifact` - The terminal task's artifact on completion.
/// * `tasks_output` - Every artifact in completion order.
/// * `failure` - Why the session aborted.
/// * `dispatches` - Total dispatches issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewOutput {
    pub status: SessionStatus,
    pub final_artifact: Option<Artifact>,
    pub tasks_output: Vec<Artifact>,
    pub failure: Option<FailureReport>,
    pub dispatches: u32,
}

impl CrewOutput {
    pub fn completed(final_artifact: Artifact, tasks_output: Vec<Artifact>, dispatches: u32) -> Self {
        Self {
            status: SessionStatus::Completed,
            final_artifact: Some(final_artifact),
            tasks_output,
            failure: None,
            dispatches,
        }
    }

    pub fn aborted(report: FailureReport, tasks_output: Vec<Artifact>, dispatches: u32) -> Self {
        Self {
            status: SessionStatus::Aborted,
            final_artifact: None,
            tasks_output,
            failure: Some(report),
            dispatches,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// The structured result of the terminal task.
    pub fn to_json(&self) -> Option<&serde_json::Value> {
        self.final_artifact.as_ref().map(|a| &a.data)
    }

    /// The output of a specific task.
    pub fn task_output(&self, task: &str) -> Option<&Artifact> {
        self.tasks_output.iter().find(|a| a.task == task)
    }
}

impl fmt::Display for CrewOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.final_artifact, &self.failure) {
            (Some(artifact), _) => write!(f, "{}", artifact),
            (None, Some(report)) => write!(f, "{}", report),
            (None, None) => Ok(()),
        }
    }
}
