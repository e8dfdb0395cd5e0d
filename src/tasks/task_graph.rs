//! Task dependency graph and per-task state machine.
//!
//! The graph is built once per session from declared tasks and then owned
//! exclusively by the scheduler, which applies every status transition.
//!
//! Transitions:
//!
//! ```text
//! Pending ──► Dispatched ──► Succeeded
//!                 │
//!                 ▼
//!             Failed(n) ──► Dispatched      while n < ceiling and retryable
//!                 │
//!                 ▼
//!              Skipped                      optional tasks, skip policy only
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::Task;
use crate::tasks::task_output::Artifact;
use crate::utilities::errors::GraphConfigurationError;

/// Default number of failed attempts after which a task is exhausted.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Runtime status of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// In flight; `attempt` is 1-based.
    Dispatched { attempt: u32 },
    Succeeded,
    /// `failures` counts every failed attempt so far.
    Failed { failures: u32, retryable: bool },
    Skipped,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched { .. } => "dispatched",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// An illegal transition or unknown task. Indicates a scheduler bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphStateError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{task}' cannot move from {from} to {to}")]
    IllegalTransition {
        task: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Runtime record for one task.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task: Task,
    pub status: TaskStatus,
    /// Failed attempts so far. Never decreases.
    pub failures: u32,
    /// Dispatches so far.
    pub dispatches: u32,
    pub artifact: Option<Artifact>,
    /// One entry per failed attempt.
    pub errors: Vec<String>,
    /// Outstanding help request from the last assigned role.
    pub help_request: Option<String>,
    /// Roles assigned on the latest dispatch.
    pub assigned_roles: Vec<String>,
}

impl TaskState {
    fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            failures: 0,
            dispatches: 0,
            artifact: None,
            errors: Vec::new(),
            help_request: None,
            assigned_roles: Vec::new(),
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

/// Read-only view of one task for decision policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub name: String,
    pub description: String,
    pub agent: String,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    pub failures: u32,
    pub optional: bool,
    pub last_error: Option<String>,
    pub help_request: Option<String>,
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// Declarative set of named tasks plus their runtime status table.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    states: Vec<TaskState>,
    index: HashMap<String, usize>,
    terminal: String,
    retry_ceiling: u32,
    completion_order: Vec<String>,
}

impl TaskGraph {
    /// Build a graph from declared tasks. The last declared task is terminal.
    ///
    /// # Errors
    /// Rejects empty graphs, duplicate names, dangling dependencies and cycles.
    pub fn new(tasks: Vec<Task>, retry_ceiling: u32) -> Result<Self, GraphConfigurationError> {
        let Some(last) = tasks.last() else {
            return Err(GraphConfigurationError::Empty);
        };
        let terminal = last.name.clone();

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.name.clone(), i).is_some() {
                return Err(GraphConfigurationError::DuplicateTask(task.name.clone()));
            }
        }

        for task in &tasks {
            if let Some(missing) = task.context.iter().find(|dep| !index.contains_key(*dep)) {
                return Err(GraphConfigurationError::DanglingDependency {
                    task: task.name.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let graph = Self {
            states: tasks.into_iter().map(TaskState::new).collect(),
            index,
            terminal,
            retry_ceiling: retry_ceiling.max(1),
            completion_order: Vec::new(),
        };

        if let Some(path) = graph.find_cycle() {
            return Err(GraphConfigurationError::Cycle { path });
        }
        Ok(graph)
    }

    /// Designate a different terminal task.
    pub fn with_terminal(mut self, name: &str) -> Result<Self, GraphConfigurationError> {
        if !self.index.contains_key(name) {
            return Err(GraphConfigurationError::UnknownTerminalTask(name.to_string()));
        }
        self.terminal = name.to_string();
        Ok(self)
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut color = vec![0u8; self.states.len()];
        let mut path = Vec::new();
        (0..self.states.len()).find_map(|start| {
            if color[start] == 0 {
                self.visit(start, &mut color, &mut path)
            } else {
                None
            }
        })
    }

    fn visit(&self, node: usize, color: &mut [u8], path: &mut Vec<usize>) -> Option<Vec<String>> {
        color[node] = 1;
        path.push(node);
        for dep in &self.states[node].task.context {
            let Some(&next) = self.index.get(dep) else {
                continue;
            };
            if color[next] == 1 {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&n| self.states[n].task.name.clone())
                    .collect();
                cycle.push(self.states[next].task.name.clone());
                return Some(cycle);
            }
            if color[next] == 0 {
                if let Some(cycle) = self.visit(next, color, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        color[node] = 2;
        None
    }

    // -- Accessors ---------------------------------------------------------

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.states.iter().map(|s| &s.task)
    }

    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    pub fn status(&self, name: &str) -> Option<&TaskStatus> {
        self.state(name).map(|s| &s.status)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.state(name).and_then(|s| s.artifact.as_ref())
    }

    pub fn terminal_artifact(&self) -> Option<&Artifact> {
        self.artifact(&self.terminal)
    }

    /// Artifacts in the order their tasks succeeded.
    pub fn artifacts(&self) -> Vec<&Artifact> {
        self.completion_order
            .iter()
            .filter_map(|name| self.artifact(name))
            .collect()
    }

    /// Task names in the order they succeeded.
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// Total dispatches across all tasks.
    pub fn total_dispatches(&self) -> u32 {
        self.states.iter().map(|s| s.dispatches).sum()
    }

    // -- Readiness ---------------------------------------------------------

    fn prerequisites_met(&self, state: &TaskState) -> bool {
        state.task.context.iter().all(|dep| {
            matches!(
                self.status(dep),
                Some(TaskStatus::Succeeded) | Some(TaskStatus::Skipped)
            )
        })
    }

    fn is_retryable(&self, state: &TaskState) -> bool {
        matches!(
            state.status,
            TaskStatus::Failed { failures, retryable: true } if failures < self.retry_ceiling
        )
    }

    /// Pending tasks whose prerequisites have all succeeded.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.states
            .iter()
            .filter(|s| s.status == TaskStatus::Pending && self.prerequisites_met(s))
            .map(|s| &s.task)
            .collect()
    }

    /// Failed tasks still below the retry ceiling.
    pub fn retryable_tasks(&self) -> Vec<&Task> {
        self.states
            .iter()
            .filter(|s| self.is_retryable(s) && self.prerequisites_met(s))
            .map(|s| &s.task)
            .collect()
    }

    /// Names of ready and retryable tasks, in declaration order.
    pub fn dispatchable(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|s| {
                (s.status == TaskStatus::Pending || self.is_retryable(s)) && self.prerequisites_met(s)
            })
            .map(|s| s.task.name.clone())
            .collect()
    }

    /// Failed tasks that can no longer be dispatched.
    pub fn exhausted_tasks(&self) -> Vec<&TaskState> {
        self.states
            .iter()
            .filter(|s| matches!(s.status, TaskStatus::Failed { .. }) && !self.is_retryable(s))
            .collect()
    }

    /// Every task succeeded or was skipped.
    pub fn is_complete(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s.status, TaskStatus::Succeeded | TaskStatus::Skipped))
    }

    /// Read-only view of every task, in declaration order.
    pub fn snapshot(&self) -> Vec<TaskView> {
        self.states
            .iter()
            .map(|s| TaskView {
                name: s.task.name.clone(),
                description: s.task.description.clone(),
                agent: s.task.agent.clone(),
                dependencies: s.task.context.clone(),
                status: s.status.clone(),
                failures: s.failures,
                optional: s.task.optional,
                last_error: s.last_error().map(str::to_string),
                help_request: s.help_request.clone(),
            })
            .collect()
    }

    // -- Transitions -------------------------------------------------------

    fn state_mut(&mut self, name: &str) -> Result<&mut TaskState, GraphStateError> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.states[i]),
            None => Err(GraphStateError::UnknownTask(name.to_string())),
        }
    }

    /// Pending or retryable Failed → Dispatched. Returns the attempt number.
    pub fn mark_dispatched(&mut self, name: &str, roles: Vec<String>) -> Result<u32, GraphStateError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| GraphStateError::UnknownTask(name.to_string()))?;
        let state = &self.states[idx];
        let allowed = (state.status == TaskStatus::Pending || self.is_retryable(state))
            && self.prerequisites_met(state);
        if !allowed {
            return Err(GraphStateError::IllegalTransition {
                task: name.to_string(),
                from: state.status.label(),
                to: "dispatched",
            });
        }

        let state = &mut self.states[idx];
        let attempt = state.failures + 1;
        state.status = TaskStatus::Dispatched { attempt };
        state.dispatches += 1;
        state.assigned_roles = roles;
        Ok(attempt)
    }

    /// Dispatched → Succeeded with the validated artifact.
    pub fn record_result(&mut self, name: &str, artifact: Artifact) -> Result<(), GraphStateError> {
        let state = self.state_mut(name)?;
        if !matches!(state.status, TaskStatus::Dispatched { .. }) {
            return Err(GraphStateError::IllegalTransition {
                task: name.to_string(),
                from: state.status.label(),
                to: "succeeded",
            });
        }
        state.status = TaskStatus::Succeeded;
        state.artifact = Some(artifact);
        state.help_request = None;
        self.completion_order.push(name.to_string());
        Ok(())
    }

    /// Dispatched → Failed(n + 1). Returns the new failure count.
    pub fn mark_failed(&mut self, name: &str, reason: &str, retryable: bool) -> Result<u32, GraphStateError> {
        let state = self.state_mut(name)?;
        if !matches!(state.status, TaskStatus::Dispatched { .. }) {
            return Err(GraphStateError::IllegalTransition {
                task: name.to_string(),
                from: state.status.label(),
                to: "failed",
            });
        }
        state.failures += 1;
        state.errors.push(reason.to_string());
        state.status = TaskStatus::Failed {
            failures: state.failures,
            retryable,
        };
        Ok(state.failures)
    }

    /// Attach a help request to a task, visible to the next decision.
    pub fn record_help_request(&mut self, name: &str, reason: &str) -> Result<(), GraphStateError> {
        self.state_mut(name)?.help_request = Some(reason.to_string());
        Ok(())
    }

    /// Exhausted optional Failed → Skipped.
    pub fn mark_skipped(&mut self, name: &str) -> Result<(), GraphStateError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| GraphStateError::UnknownTask(name.to_string()))?;
        let state = &self.states[idx];
        let exhausted = matches!(state.status, TaskStatus::Failed { .. }) && !self.is_retryable(state);
        if !exhausted || !state.task.optional {
            return Err(GraphStateError::IllegalTransition {
                task: name.to_string(),
                from: state.status.label(),
                to: "skipped",
            });
        }
        self.states[idx].status = TaskStatus::Skipped;
        Ok(())
    }
}
