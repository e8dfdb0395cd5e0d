//! Process types for crew execution.
//!
//! The process picks the decision policy a session runs with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How tasks are assigned to roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    /// Every task goes to its bound role; rule-based help splits only.
    Sequential,
    /// The manager agent decides each round's dispatches.
    Hierarchical,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::Sequential => write!(f, "sequential"),
            Process::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Process::Hierarchical
    }
}

impl FromStr for Process {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "rules" | "rule_based" => Ok(Process::Sequential),
            "hierarchical" | "manager" => Ok(Process::Hierarchical),
            other => Err(format!("unknown process '{}'", other)),
        }
    }
}
