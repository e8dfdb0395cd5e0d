//! Agent roles.
//!
//! An [`Agent`] is a capability-specialized persona: who it is (role title,
//! goal, backstory), which tools it may call, whether it may write to memory
//! and how many tool-loop iterations it gets. Roles are immutable once a
//! session starts; the crew interpolates run inputs into the persona before
//! building the graph.

use std::collections::HashMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::translations::{render, I18N};
use crate::utilities::string_utils::interpolate_only;

/// Name of the built-in coordinating role.
pub const MANAGER_ROLE: &str = "crew_manager";

fn default_memory() -> bool {
    true
}

/// A capability-specialized role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Role name, the identity key tasks are bound to.
    #[serde(default)]
    pub name: String,
    /// Role title, e.g. "Market Dynamics Analyst".
    pub role: String,
    pub goal: String,
    pub backstory: String,
    /// Names of the tools this role may call.
    #[serde(default)]
    pub tools: Vec<String>,
    /// May assign work to other roles. Only the manager holds this.
    #[serde(default)]
    pub allow_delegation: bool,
    /// May append its results to memory.
    #[serde(default = "default_memory")]
    pub memory: bool,
    /// Tool-loop iteration cap; the crew default applies when `None`.
    #[serde(default)]
    pub max_iter: Option<u32>,

    #[serde(skip)]
    original_role: Option<String>,
    #[serde(skip)]
    original_goal: Option<String>,
    #[serde(skip)]
    original_backstory: Option<String>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            tools: Vec::new(),
            allow_delegation: false,
            memory: true,
            max_iter: None,
            original_role: None,
            original_goal: None,
            original_backstory: None,
        }
    }

    /// The built-in manager role, with delegation permission and no tools.
    pub fn manager() -> Self {
        let (role, goal, backstory) = I18N.manager_persona();
        Self::new(MANAGER_ROLE, role, goal, backstory)
            .with_delegation(true)
            .with_memory(false)
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }

    pub fn with_memory(mut self, memory: bool) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    pub fn is_manager(&self) -> bool {
        self.name == MANAGER_ROLE
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    /// MD5 of `role|goal|backstory` before interpolation.
    pub fn key(&self) -> String {
        let role = self.original_role.as_deref().unwrap_or(&self.role);
        let goal = self.original_goal.as_deref().unwrap_or(&self.goal);
        let backstory = self.original_backstory.as_deref().unwrap_or(&self.backstory);

        let mut hasher = Md5::new();
        hasher.update(format!("{}|{}|{}", role, goal, backstory).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Interpolate run inputs into the persona.
    ///
    /// Re-interpolation always starts from the original templates.
    ///
    /// # Errors
    /// Names the first placeholder missing from `inputs`.
    pub fn interpolate_inputs(&mut self, inputs: &HashMap<String, String>) -> Result<(), String> {
        let role = self.original_role.get_or_insert_with(|| self.role.clone()).clone();
        let goal = self.original_goal.get_or_insert_with(|| self.goal.clone()).clone();
        let backstory = self
            .original_backstory
            .get_or_insert_with(|| self.backstory.clone())
            .clone();

        self.role = interpolate_only(&role, inputs)?;
        self.goal = interpolate_only(&goal, inputs)?;
        self.backstory = interpolate_only(&backstory, inputs)?;
        Ok(())
    }

    /// The role-playing preamble of every prompt this role receives.
    pub fn persona(&self) -> String {
        render(
            I18N.slice("role_playing"),
            &[
                ("role", self.role.trim()),
                ("backstory", self.backstory.trim()),
                ("goal", self.goal.trim()),
            ],
        )
    }
}
