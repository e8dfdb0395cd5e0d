//! Delegation decisions.
//!
//! The scheduler never decides on its own who works on what. Each round it
//! hands a [`GraphSnapshot`] to a [`DecisionPolicy`] and gets back a list of
//! [`DispatchDecision`]s.
//!
//! ```text
//! Scheduler                   DecisionPolicy
//!   │                              │
//!   ├─ GraphSnapshot ────────────►│
//!   │                              ├── (rules or manager agent)
//!   │◄─ [DispatchDecision] ───────┤
//!   │                              │
//!   ├─ validate, fall back to the bound role
//!   ├─ dispatch
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::tasks::task_graph::TaskView;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// One dispatch chosen by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchDecision {
    /// Run `task` with a single role.
    Dispatch { task: String, role: String },
    /// Split `task` across several roles. The first role leads and produces
    /// the artifact; the others contribute findings first.
    Split { task: String, roles: Vec<String> },
}

impl DispatchDecision {
    pub fn task(&self) -> &str {
        match self {
            DispatchDecision::Dispatch { task, .. } | DispatchDecision::Split { task, .. } => task,
        }
    }

    /// Roles in dispatch order, lead first.
    pub fn roles(&self) -> Vec<String> {
        match self {
            DispatchDecision::Dispatch { role, .. } => vec![role.clone()],
            DispatchDecision::Split { roles, .. } => roles.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// What a policy knows about one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleView {
    pub name: String,
    pub role: String,
    pub goal: String,
    pub tools: Vec<String>,
    pub allow_delegation: bool,
}

impl From<&Agent> for RoleView {
    fn from(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            role: agent.role.clone(),
            goal: agent.goal.clone(),
            tools: agent.tools.clone(),
            allow_delegation: agent.allow_delegation,
        }
    }
}

/// Read-only state of the graph handed to a policy each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<TaskView>,
    /// Ready or retryable tasks, in declaration order.
    pub dispatchable: Vec<String>,
    pub in_flight: Vec<String>,
    /// Roles that may execute tasks, in declaration order.
    pub roles: Vec<RoleView>,
    pub retry_ceiling: u32,
    /// How many more dispatches fit this round.
    pub capacity: usize,
}

impl GraphSnapshot {
    pub fn task(&self, name: &str) -> Option<&TaskView> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&RoleView> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Roles that could stand in for `bound`: every other executing role
    /// whose tools cover the bound role's tools.
    pub fn substitutes(&self, bound: &str) -> Vec<&RoleView> {
        let required: &[String] = self.role(bound).map(|r| r.tools.as_slice()).unwrap_or(&[]);
        self.roles
            .iter()
            .filter(|r| r.name != bound && !r.allow_delegation)
            .filter(|r| required.iter().all(|tool| r.tools.contains(tool)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Decides which dispatchable tasks run next and with which roles.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    /// Short name used in events and logs.
    fn name(&self) -> &str;

    /// Choose dispatches for this round. Returning fewer decisions than
    /// `snapshot.capacity` is allowed; returning none while nothing is in
    /// flight makes the scheduler dispatch every task to its bound role.
    async fn decide(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision>;
}

/// Deterministic policy: every dispatchable task goes to its bound role,
/// except a task whose role asked for help, which is split between the
/// bound role and the first substitute.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedPolicy;

impl RuleBasedPolicy {
    pub fn new() -> Self {
        Self
    }

    /// The synchronous core, shared with policies that fall back to it.
    pub fn decisions(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
        snapshot
            .dispatchable
            .iter()
            .filter_map(|name| snapshot.task(name))
            .take(snapshot.capacity)
            .map(|task| {
                let substitute = task
                    .help_request
                    .as_ref()
                    .and_then(|_| snapshot.substitutes(&task.agent).into_iter().next());
                match substitute {
                    Some(helper) => DispatchDecision::Split {
                        task: task.name.clone(),
                        roles: vec![task.agent.clone(), helper.name.clone()],
                    },
                    None => DispatchDecision::Dispatch {
                        task: task.name.clone(),
                        role: task.agent.clone(),
                    },
                }
            })
            .collect()
    }
}

#[async_trait]
impl DecisionPolicy for RuleBasedPolicy {
    fn name(&self) -> &str {
        "rule_based"
    }

    async fn decide(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
        self.decisions(snapshot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tasks::task_graph::TaskStatus;

    pub(crate) fn view(name: &str, agent: &str, help: Option<&str>) -> TaskView {
        TaskView {
            name: name.into(),
            description: format!("do {}", name),
            agent: agent.into(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            failures: 0,
            optional: false,
            last_error: None,
            help_request: help.map(str::to_string),
        }
    }

    pub(crate) fn role(name: &str, tools: &[&str]) -> RoleView {
        RoleView {
            name: name.into(),
            role: name.into(),
            goal: String::new(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            allow_delegation: false,
        }
    }

    pub(crate) fn snapshot(tasks: Vec<TaskView>, capacity: usize) -> GraphSnapshot {
        GraphSnapshot {
            dispatchable: tasks.iter().map(|t| t.name.clone()).collect(),
            tasks,
            in_flight: Vec::new(),
            roles: vec![
                role("market_analyst", &["search"]),
                role("target_strategist", &[]),
                role("prospect_researcher", &["search"]),
            ],
            retry_ceiling: 3,
            capacity,
        }
    }

    #[tokio::test]
    async fn test_rule_based_uses_bound_roles() {
        let snap = snapshot(
            vec![
                view("market_dynamics_task", "market_analyst", None),
                view("hpt_criteria_task", "target_strategist", None),
            ],
            4,
        );
        let decisions = RuleBasedPolicy::new().decide(&snap).await;
        assert_eq!(
            decisions,
            vec![
                DispatchDecision::Dispatch {
                    task: "market_dynamics_task".into(),
                    role: "market_analyst".into()
                },
                DispatchDecision::Dispatch {
                    task: "hpt_criteria_task".into(),
                    role: "target_strategist".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_help_request_splits_with_tool_compatible_role() {
        let snap = snapshot(
            vec![view("market_dynamics_task", "market_analyst", Some("need more sources"))],
            4,
        );
        let decisions = RuleBasedPolicy::new().decide(&snap).await;
        assert_eq!(
            decisions,
            vec![DispatchDecision::Split {
                task: "market_dynamics_task".into(),
                roles: vec!["market_analyst".into(), "prospect_researcher".into()],
            }]
        );
    }

    #[test]
    fn test_capacity_limits_decisions() {
        let snap = snapshot(
            vec![
                view("a", "market_analyst", None),
                view("b", "market_analyst", None),
                view("c", "market_analyst", None),
            ],
            2,
        );
        assert_eq!(RuleBasedPolicy::new().decisions(&snap).len(), 2);
    }

    #[test]
    fn test_substitutes_exclude_manager_and_self() {
        let mut snap = snapshot(Vec::new(), 1);
        let mut manager = role("crew_manager", &["search"]);
        manager.allow_delegation = true;
        snap.roles.push(manager);
        let names: Vec<&str> = snap
            .substitutes("target_strategist")
            .into_iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["market_analyst", "prospect_researcher"]);
    }
}
