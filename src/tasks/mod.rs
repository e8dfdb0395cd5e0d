//! Task runtime: the dependency graph and the artifacts it records.

pub mod task_graph;
pub mod task_output;

pub use task_graph::{GraphStateError, TaskGraph, TaskState, TaskStatus, TaskView};
pub use task_output::Artifact;
