//! Delegation: who works on which task, and the loop that drives the graph.

pub mod delegation;
pub mod manager_policy;
pub mod orchestrator;

pub use delegation::{DecisionPolicy, DispatchDecision, GraphSnapshot, RoleView, RuleBasedPolicy};
pub use manager_policy::ManagerPolicy;
pub use orchestrator::{AbortReason, Cancellation, DelegationScheduler, ScheduleOutcome};
