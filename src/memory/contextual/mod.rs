//! Context assembly for a single dispatch.
//!
//! Blends durable history, session insights, entity facts and the artifacts
//! of a task's declared dependencies into one [`ContextBundle`].

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::memory::memory::MemoryScope;
use crate::memory::tiers::MemoryTierManager;
use crate::task::Task;
use crate::tasks::task_output::Artifact;
use crate::utilities::errors::MemoryUnavailable;

/// Everything an agent gets to see besides its task prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Durable records from earlier sessions for the same task.
    pub historical: Vec<String>,
    /// Session records similar to the task prompt.
    pub insights: Vec<String>,
    /// `(entity, facts)` for entities mentioned in the prompt or dependencies.
    pub entities: Vec<(String, Vec<String>)>,
    /// `(task, structured result)` for each declared dependency.
    pub dependencies: Vec<(String, String)>,
}

impl ContextBundle {
    /// A bundle carrying only dependency artifacts.
    pub fn from_dependencies(dependencies: &[Artifact]) -> Self {
        Self {
            dependencies: dependencies
                .iter()
                .map(|a| (a.task.clone(), a.to_json_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.historical.is_empty()
            && self.insights.is_empty()
            && self.entities.is_empty()
            && self.dependencies.is_empty()
    }

    /// Render the bundle as prompt text. Empty sections are omitted.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();

        if !self.historical.is_empty() {
            let items: Vec<String> = self.historical.iter().map(|h| format!("- {}", h)).collect();
            parts.push(format!("Historical Data:\n{}", items.join("\n")));
        }

        if !self.insights.is_empty() {
            let items: Vec<String> = self.insights.iter().map(|i| format!("- {}", i)).collect();
            parts.push(format!("Recent Insights:\n{}", items.join("\n")));
        }

        if !self.entities.is_empty() {
            let items: Vec<String> = self
                .entities
                .iter()
                .map(|(name, facts)| format!("- {}: {}", name, facts.join(" | ")))
                .collect();
            parts.push(format!("Entities:\n{}", items.join("\n")));
        }

        if !self.dependencies.is_empty() {
            let items: Vec<String> = self
                .dependencies
                .iter()
                .map(|(task, data)| format!("[{}]\n{}", task, data))
                .collect();
            parts.push(format!("Context from prior tasks:\n{}", items.join("\n\n")));
        }

        parts.join("\n\n")
    }
}

/// Builds context bundles from the memory tiers.
#[derive(Clone)]
pub struct ContextualMemory {
    memory: Arc<MemoryTierManager>,
    /// Durable records per task.
    pub durable_top_k: usize,
    /// Session records per task.
    pub session_top_k: usize,
}

impl ContextualMemory {
    pub fn new(memory: Arc<MemoryTierManager>, durable_top_k: usize, session_top_k: usize) -> Self {
        Self {
            memory,
            durable_top_k,
            session_top_k,
        }
    }

    /// Assemble the context bundle for `task`.
    ///
    /// # Arguments
    /// * `task` - The interpolated task about to be dispatched.
    /// * `dependencies` - Artifacts of the task's declared dependencies.
    pub async fn build_context_for_task(
        &self,
        task: &Task,
        dependencies: &[Artifact],
    ) -> Result<ContextBundle, MemoryUnavailable> {
        let mut bundle = ContextBundle::from_dependencies(dependencies);
        let prompt = task.prompt();
        let key = task.key();

        let (historical, insights, names) = tokio::join!(
            self.memory.query(MemoryScope::Durable, &key, self.durable_top_k),
            self.memory.query(MemoryScope::Session, &prompt, self.session_top_k),
            self.memory.entity_names(),
        );

        bundle.historical = historical?.into_iter().map(|r| r.content).collect();
        bundle.insights = insights?
            .into_iter()
            .filter(|r| r.key != task.name)
            .map(|r| r.content)
            .collect();

        let haystack = {
            let mut text = prompt.to_lowercase();
            for (_, data) in &bundle.dependencies {
                text.push('\n');
                text.push_str(&data.to_lowercase());
            }
            text
        };
        let mentioned: Vec<String> = names?
            .into_iter()
            .filter(|name| haystack.contains(&name.to_lowercase()))
            .collect();

        let lookups = join_all(
            mentioned
                .iter()
                .map(|name| self.memory.query(MemoryScope::Entity, name, usize::MAX)),
        )
        .await;
        for (name, records) in mentioned.into_iter().zip(lookups) {
            let facts: Vec<String> = records?.into_iter().map(|r| r.content).collect();
            if !facts.is_empty() {
                bundle.entities.push((name, facts));
            }
        }

        log::debug!(
            "context for '{}': {} historical, {} insights, {} entities, {} dependencies",
            task.name,
            bundle.historical.len(),
            bundle.insights.len(),
            bundle.entities.len(),
            bundle.dependencies.len()
        );
        Ok(bundle)
    }
}
