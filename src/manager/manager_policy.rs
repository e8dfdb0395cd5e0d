//! Decisions made by the manager agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::delegation::{DecisionPolicy, DispatchDecision, GraphSnapshot, RuleBasedPolicy};
use crate::agent::Agent;
use crate::llms::base_llm::BaseLLM;
use crate::schema::converter::extract_json;
use crate::translations::{render, I18N};
use crate::utilities::string_utils::truncate_chars;

#[derive(Debug, Deserialize)]
struct ManagerReply {
    #[serde(default)]
    decisions: Vec<ManagerDecision>,
}

#[derive(Debug, Deserialize)]
struct ManagerDecision {
    task: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    role: Option<String>,
}

/// Asks the manager agent, through its own generation call, which task
/// goes to which role. Falls back to [`RuleBasedPolicy`] when the reply is
/// unusable.
#[derive(Debug, Clone)]
pub struct ManagerPolicy {
    llm: Arc<dyn BaseLLM>,
    manager: Agent,
    fallback: RuleBasedPolicy,
}

impl ManagerPolicy {
    pub fn new(llm: Arc<dyn BaseLLM>, manager: Agent) -> Self {
        Self {
            llm,
            manager,
            fallback: RuleBasedPolicy::new(),
        }
    }

    /// The decision prompt for `snapshot`.
    pub fn build_prompt(&self, snapshot: &GraphSnapshot) -> String {
        let roles: Vec<String> = snapshot
            .roles
            .iter()
            .map(|r| {
                let tools = if r.tools.is_empty() {
                    "no tools".to_string()
                } else {
                    format!("tools: {}", r.tools.join(", "))
                };
                format!("- {} ({}; {}): {}", r.name, r.role.trim(), tools, r.goal.trim())
            })
            .collect();

        let tasks: Vec<String> = snapshot
            .tasks
            .iter()
            .map(|t| {
                let mut line = format!(
                    "- {} [{}, {} failure(s), bound to {}]",
                    t.name,
                    t.status.label(),
                    t.failures,
                    t.agent
                );
                if let Some(help) = &t.help_request {
                    line.push_str(&format!(" bound role asked for help: {}", help));
                }
                if let Some(error) = &t.last_error {
                    line.push_str(&format!(" last error: {}", error));
                }
                line
            })
            .collect();

        let decision = render(
            I18N.slice("manager_decision"),
            &[
                ("roles", roles.join("\n").as_str()),
                ("tasks", tasks.join("\n").as_str()),
                ("dispatchable", snapshot.dispatchable.join(", ").as_str()),
            ],
        );
        format!("{}\n\n{}", self.manager.persona(), decision)
    }

    /// Parse the manager's reply into decisions.
    ///
    /// Returns `None` when the reply holds no usable JSON.
    pub fn parse_reply(raw: &str) -> Option<Vec<DispatchDecision>> {
        let value = extract_json(raw).ok()?;
        let reply: ManagerReply = match value {
            Value::Array(items) => ManagerReply {
                decisions: serde_json::from_value(Value::Array(items)).ok()?,
            },
            other => serde_json::from_value(other).ok()?,
        };

        let decisions: Vec<DispatchDecision> = reply
            .decisions
            .into_iter()
            .filter_map(|d| {
                let mut roles = d.roles;
                if let Some(role) = d.role {
                    if !roles.contains(&role) {
                        roles.insert(0, role);
                    }
                }
                match roles.len() {
                    0 => None,
                    1 => Some(DispatchDecision::Dispatch {
                        task: d.task,
                        role: roles.remove(0),
                    }),
                    _ => Some(DispatchDecision::Split { task: d.task, roles }),
                }
            })
            .collect();
        Some(decisions)
    }
}

#[async_trait]
impl DecisionPolicy for ManagerPolicy {
    fn name(&self) -> &str {
        "manager"
    }

    async fn decide(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
        let prompt = self.build_prompt(snapshot);
        let reply = match self.llm.generate(&prompt, &[]).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("manager decision call failed, using rules: {}", e);
                return self.fallback.decisions(snapshot);
            }
        };

        match Self::parse_reply(&reply) {
            Some(decisions) if !decisions.is_empty() => {
                log::debug!("manager decided: {:?}", decisions);
                decisions
            }
            _ => {
                log::warn!("manager reply unusable, using rules: {}", truncate_chars(reply.trim(), 200));
                self.fallback.decisions(snapshot)
            }
        }
    }
}
