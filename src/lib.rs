//! # Target Acquisition
//!
//! A hierarchical multi-agent crew that turns a market-targeting brief
//! (industry, sector, geography, time horizon) into a ranked, research-backed
//! outreach plan and a final go/no-go decision.
//!
//! The moving parts:
//!
//! - [`schema`]: output schemas and the registry that validates every result
//! - [`memory`]: durable, session and entity memory tiers
//! - [`agents`]: the ReAct invocation loop around a generation backend
//! - [`tasks`]: the task dependency graph and its status table
//! - [`manager`]: decision policies and the delegation scheduler
//! - [`crew`]: one session from inputs to [`CrewOutput`]

pub mod agent;
pub mod agents;
pub mod crew;
pub mod crews;
pub mod events;
pub mod llms;
pub mod manager;
pub mod memory;
pub mod process;
pub mod project;
pub mod schema;
pub mod task;
pub mod tasks;
pub mod tools;
pub mod translations;
pub mod utilities;

pub use agent::Agent;
pub use crew::Crew;
pub use crews::crew_config::CrewConfig;
pub use crews::crew_output::CrewOutput;
pub use llms::base_llm::BaseLLM;
pub use process::Process;
pub use task::Task;
pub use tasks::task_output::Artifact;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
