//! Main Crew struct.
//!
//! A [`Crew`] owns the declared roles, tasks and schemas of a project and
//! runs one session per [`kickoff`](Crew::kickoff): interpolate inputs,
//! validate the configuration, open memory, drive the delegation scheduler
//! and hand back either the terminal artifact or a failure report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Local;
use md5::{Digest, Md5};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::agent::Agent;
use crate::agents::CrewAgentExecutor;
use crate::crews::crew_config::CrewConfig;
use crate::crews::crew_output::{CrewOutput, ExhaustedTask, FailureReport};
use crate::events::{EventBus, OrchestrationEvent};
use crate::llms::base_llm::BaseLLM;
use crate::manager::{
    AbortReason, Cancellation, DecisionPolicy, DelegationScheduler, ManagerPolicy, RuleBasedPolicy,
    ScheduleOutcome,
};
use crate::memory::{MemoryScope, MemoryTierManager};
use crate::process::Process;
use crate::schema::SchemaRegistry;
use crate::task::Task;
use crate::tasks::task_graph::TaskGraph;
use crate::tasks::task_output::Artifact;
use crate::tools::BaseTool;
use crate::utilities::errors::{CrewError, GraphConfigurationError};

/// A group of roles, the tasks they perform and how work is assigned.
///
/// # Fields
///
/// * `name` - Optional name for logs.
/// * `id` - Unique identifier of this crew instance.
/// * `agents` - Roles in declaration order. May include the manager.
/// * `tasks` - Tasks in declaration order.
/// * `process` - Picks the decision policy.
/// * `config` - Retry, concurrency and memory settings.
pub struct Crew {
    pub name: Option<String>,
    pub id: Uuid,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub process: Process,
    pub config: CrewConfig,
    registry: SchemaRegistry,
    llm: Arc<dyn BaseLLM>,
    manager_llm: Option<Arc<dyn BaseLLM>>,
    tools: Vec<Arc<dyn BaseTool>>,
    memory: Option<Arc<MemoryTierManager>>,
    policy: Option<Arc<dyn DecisionPolicy>>,
    events: EventBus,
    cancellation: Cancellation,
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("agents", &self.agents.iter().map(|a| &a.name).collect::<Vec<_>>())
            .field("tasks", &self.tasks.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("process", &self.process)
            .field("model", &self.llm.model())
            .finish()
    }
}

impl Crew {
    /// Create a crew.
    ///
    /// # Arguments
    ///
    /// * `agents` - Roles in declaration order.
    /// * `tasks` - Tasks in declaration order; the last one is terminal
    ///   unless the config names another.
    /// * `registry` - Schemas the tasks reference by name.
    /// * `llm` - Backend for every role, and for the manager unless
    ///   [`with_manager_llm`](Self::with_manager_llm) is used.
    pub fn new(agents: Vec<Agent>, tasks: Vec<Task>, registry: SchemaRegistry, llm: Arc<dyn BaseLLM>) -> Self {
        Self {
            name: Some("crew".to_string()),
            id: Uuid::new_v4(),
            agents,
            tasks,
            process: Process::default(),
            config: CrewConfig::default(),
            registry,
            llm,
            manager_llm: None,
            tools: Vec::new(),
            memory: None,
            policy: None,
            events: EventBus::default(),
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = process;
        self
    }

    pub fn with_config(mut self, config: CrewConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn BaseTool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_manager_llm(mut self, llm: Arc<dyn BaseLLM>) -> Self {
        self.manager_llm = Some(llm);
        self
    }

    /// Use these memory stores instead of opening the default ones.
    pub fn with_memory_manager(mut self, memory: Arc<MemoryTierManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override the policy the process would pick.
    pub fn with_policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Receive [`OrchestrationEvent`]s for every session of this crew.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    /// Handle that cancels the running (or next) session.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// MD5 of every role key and task key.
    pub fn key(&self) -> String {
        let mut source: Vec<String> = self.agents.iter().map(Agent::key).collect();
        source.extend(self.tasks.iter().map(Task::key));
        let mut hasher = Md5::new();
        hasher.update(source.join("|").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Run one session.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Values for the `{placeholders}` of personas and task
    ///   prompts. `current_date` is added when absent.
    ///
    /// # Errors
    ///
    /// Configuration problems are reported before any dispatch. A failed
    /// final flush of durable memory is the only error after dispatching
    /// starts; every other failure ends in an aborted [`CrewOutput`].
    pub async fn kickoff(&self, inputs: &HashMap<String, String>) -> Result<CrewOutput, CrewError> {
        let mut inputs = inputs.clone();
        inputs
            .entry("current_date".to_string())
            .or_insert_with(|| Local::now().format("%Y-%m-%d").to_string());

        let (roles, manager) = self.prepare_roles(&inputs)?;
        let tasks = self.prepare_tasks(&inputs, &roles)?;
        let registry = self.bind_schemas(&tasks)?;

        let mut graph = TaskGraph::new(tasks, self.config.retry_ceiling)?;
        if let Some(terminal) = &self.config.terminal_task {
            graph = graph.with_terminal(terminal)?;
        }

        let memory = self.open_memory()?;
        let policy = self.select_policy(manager);

        log::info!(
            "crew {} kickoff: {} role(s), {} task(s), {} process",
            self.name.as_deref().unwrap_or("crew"),
            roles.len(),
            graph.len(),
            self.process
        );

        let executor =
            CrewAgentExecutor::new(Arc::clone(&self.llm), self.tools.clone()).with_max_iter(self.config.max_iter);
        let mut scheduler = DelegationScheduler::new(executor, Arc::new(registry), roles, policy)
            .with_events(self.events.clone())
            .with_cancellation(self.cancellation.clone())
            .with_max_concurrency(self.config.max_concurrency)
            .with_partial_results(self.config.partial_results);
        if let Some(memory) = &memory {
            scheduler = scheduler.with_memory(
                Arc::clone(memory),
                self.config.memory.durable_top_k,
                self.config.memory.session_top_k,
            );
        }

        let outcome = scheduler.run(&mut graph).await;

        let finished = match &memory {
            Some(memory) => self.finish_memory(memory).await,
            None => Ok(()),
        };
        let output = self.build_output(&graph, &outcome);
        finished?;

        log::info!("crew session {} after {} dispatch(es)", outcome.label(), output.dispatches);
        Ok(output)
    }

    /// Validate and interpolate the roles. Returns the executing roles and
    /// the manager.
    fn prepare_roles(&self, inputs: &HashMap<String, String>) -> Result<(Vec<Agent>, Agent), GraphConfigurationError> {
        let mut seen = HashSet::new();
        let mut roles = Vec::with_capacity(self.agents.len());
        let mut manager = None;

        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(GraphConfigurationError::DuplicateRole(agent.name.clone()));
            }
            if agent.allow_delegation && !agent.is_manager() {
                return Err(GraphConfigurationError::DelegationNotAllowed(agent.name.clone()));
            }

            let mut agent = agent.clone();
            agent
                .interpolate_inputs(inputs)
                .map_err(|reason| GraphConfigurationError::Template {
                    task: agent.name.clone(),
                    reason,
                })?;
            if agent.is_manager() {
                manager = Some(agent);
            } else {
                roles.push(agent);
            }
        }

        Ok((roles, manager.unwrap_or_else(Agent::manager)))
    }

    fn prepare_tasks(&self, inputs: &HashMap<String, String>, roles: &[Agent]) -> Result<Vec<Task>, GraphConfigurationError> {
        self.tasks
            .iter()
            .map(|task| {
                if !roles.iter().any(|r| r.name == task.agent) {
                    return Err(GraphConfigurationError::UnknownRole {
                        task: task.name.clone(),
                        role: task.agent.clone(),
                    });
                }
                let mut task = task.clone();
                task.interpolate_inputs(inputs)
                    .map_err(|reason| GraphConfigurationError::Template {
                        task: task.name.clone(),
                        reason,
                    })?;
                Ok(task)
            })
            .collect()
    }

    fn bind_schemas(&self, tasks: &[Task]) -> Result<SchemaRegistry, GraphConfigurationError> {
        let mut registry = self.registry.clone();
        for task in tasks {
            if !registry.bind(task.name.clone(), &task.output_schema) {
                return Err(GraphConfigurationError::UnknownSchema {
                    task: task.name.clone(),
                    schema: task.output_schema.clone(),
                });
            }
        }
        Ok(registry)
    }

    fn open_memory(&self) -> Result<Option<Arc<MemoryTierManager>>, CrewError> {
        if !self.config.memory.enabled {
            return Ok(None);
        }
        if let Some(memory) = &self.memory {
            return Ok(Some(Arc::clone(memory)));
        }
        let memory = MemoryTierManager::open(self.config.memory.durable_path.clone())
            .map_err(|e| CrewError::MemoryInit(e.to_string()))?
            .with_retry(self.config.memory.retry.clone());
        Ok(Some(Arc::new(memory)))
    }

    fn select_policy(&self, manager: Agent) -> Arc<dyn DecisionPolicy> {
        if let Some(policy) = &self.policy {
            return Arc::clone(policy);
        }
        match self.process {
            Process::Sequential => Arc::new(RuleBasedPolicy::new()),
            Process::Hierarchical => {
                let llm = self.manager_llm.clone().unwrap_or_else(|| Arc::clone(&self.llm));
                Arc::new(ManagerPolicy::new(llm, manager))
            }
        }
    }

    /// Promote entities if configured, flush durable memory, then discard
    /// the per-session stores.
    async fn finish_memory(&self, memory: &MemoryTierManager) -> Result<(), CrewError> {
        if self.config.promote_entities {
            match memory.entity_names().await {
                Ok(names) => {
                    for name in names {
                        if let Err(e) = memory.promote(MemoryScope::Entity, &name).await {
                            log::warn!("failed to promote entity '{}': {}", name, e);
                        }
                    }
                }
                Err(e) => log::warn!("failed to list entities for promotion: {}", e),
            }
        }

        let flushed = memory.flush().await;
        memory.close().await;
        if let Err(e) = &flushed {
            log::error!("final durable flush failed: {}", e);
        }
        flushed.map_err(CrewError::from)
    }

    fn build_output(&self, graph: &TaskGraph, outcome: &ScheduleOutcome) -> CrewOutput {
        let tasks_output: Vec<Artifact> = graph.artifacts().into_iter().cloned().collect();
        let dispatches = graph.total_dispatches();
        let partial = |outputs: &[Artifact]| {
            if self.config.return_partial_on_abort {
                outputs.to_vec()
            } else {
                Vec::new()
            }
        };
        let exhausted = |names: &[String]| -> Vec<ExhaustedTask> {
            names
                .iter()
                .filter_map(|name| graph.state(name))
                .map(|state| ExhaustedTask {
                    task: state.task.name.clone(),
                    failures: state.failures,
                    last_error: state.last_error().map(str::to_string),
                })
                .collect()
        };

        match outcome {
            ScheduleOutcome::Completed => match graph.terminal_artifact() {
                Some(artifact) => CrewOutput::completed(artifact.clone(), tasks_output, dispatches),
                None => {
                    log::warn!("terminal task '{}' was skipped; no final artifact", graph.terminal());
                    let report = FailureReport {
                        exhausted: exhausted(&[graph.terminal().to_string()]),
                        partial_artifacts: partial(&tasks_output),
                        ..FailureReport::default()
                    };
                    CrewOutput::aborted(report, tasks_output, dispatches)
                }
            },
            ScheduleOutcome::Aborted(reason) => {
                let mut report = FailureReport {
                    partial_artifacts: partial(&tasks_output),
                    ..FailureReport::default()
                };
                match reason {
                    AbortReason::Exhausted(names) => report.exhausted = exhausted(names),
                    AbortReason::Cancelled => report.cancelled = true,
                    AbortReason::Stalled => report.stalled = true,
                }
                CrewOutput::aborted(report, tasks_output, dispatches)
            }
        }
    }
}

impl std::fmt::Display for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Crew(id={}, process={}, number_of_agents={}, number_of_tasks={})",
            self.id,
            self.process,
            self.agents.len(),
            self.tasks.len()
        )
    }
}
