//! The delegation scheduler.
//!
//! Owns the task graph's status table for the length of a run. Each round it
//! asks the [`DecisionPolicy`] what to dispatch, validates the answer,
//! spawns the invocations on a `JoinSet` and applies their outcomes:
//!
//! - valid artifact: memory appended, then `Succeeded`
//! - invalid output, tool error, memory outage, help request: `Failed(n)`
//! - exhausted: skip (optional tasks under `SkipOptional`) or abort
//!
//! The loop ends when every task succeeded or was skipped, when a required
//! task is exhausted, on cancellation, or when nothing can make progress.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::delegation::{DecisionPolicy, GraphSnapshot, RoleView};
use crate::agent::Agent;
use crate::agents::{AgentResponse, CrewAgentExecutor, Invocation};
use crate::crews::crew_config::PartialResultPolicy;
use crate::events::{EventBus, OrchestrationEvent};
use crate::memory::{ContextBundle, ContextualMemory, MemoryScope, MemoryTierManager};
use crate::schema::SchemaRegistry;
use crate::task::Task;
use crate::tasks::task_graph::{GraphStateError, TaskGraph};
use crate::tasks::task_output::Artifact;
use crate::utilities::errors::{MemoryUnavailable, TaskFailure};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Stop new dispatches and end the run as soon as possible.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the flag is set.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Required tasks ran out of retries.
    Exhausted(Vec<String>),
    Cancelled,
    /// Nothing in flight and nothing dispatchable, yet not complete.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Completed,
    Aborted(AbortReason),
}

impl ScheduleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleOutcome::Completed => "completed",
            ScheduleOutcome::Aborted(AbortReason::Cancelled) => "cancelled",
            ScheduleOutcome::Aborted(_) => "aborted",
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch job
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct DispatchMemory {
    tiers: Arc<MemoryTierManager>,
    contextual: ContextualMemory,
}

/// Tools `agent` may use on `task`: its own tools, narrowed by the task's
/// list when the task declares one.
pub fn tool_whitelist(agent: &Agent, task: &Task) -> Vec<String> {
    match &task.tools {
        Some(allowed) => agent.tools.iter().filter(|t| allowed.contains(t)).cloned().collect(),
        None => agent.tools.clone(),
    }
}

/// Everything one spawned invocation owns.
struct DispatchJob {
    executor: CrewAgentExecutor,
    registry: Arc<SchemaRegistry>,
    memory: Option<DispatchMemory>,
    task: Task,
    lead: Agent,
    helpers: Vec<Agent>,
    help_reason: Option<String>,
    dependencies: Vec<Artifact>,
    feedback: Option<String>,
    attempt: u32,
}

/// What came back from one dispatch. Nothing has been written to memory
/// yet; the scheduler does that once it accepts the outcome.
struct DispatchReport {
    task: String,
    lead: String,
    attempt: u32,
    /// Whether the lead role may write to memory.
    remember: bool,
    outcome: Result<Artifact, TaskFailure>,
}

impl DispatchJob {
    async fn run(self) -> DispatchReport {
        let task = self.task.name.clone();
        let lead = self.lead.name.clone();
        let attempt = self.attempt;
        let remember = self.lead.memory;
        let outcome = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskFailure::Interrupted(format!("invocation of '{}' panicked", task))),
        };
        DispatchReport {
            task,
            lead,
            attempt,
            remember,
            outcome,
        }
    }

    async fn execute(self) -> Result<Artifact, TaskFailure> {
        let mut context = match &self.memory {
            Some(memory) => {
                memory
                    .contextual
                    .build_context_for_task(&self.task, &self.dependencies)
                    .await?
            }
            None => ContextBundle::from_dependencies(&self.dependencies),
        };

        if !self.helpers.is_empty() {
            self.gather_contributions(&mut context).await?;
        }

        let format = self
            .registry
            .schema_for_task(&self.task.name)
            .map(|s| s.format_instructions())
            .unwrap_or_default();
        let whitelist = tool_whitelist(&self.lead, &self.task);
        let response = self
            .executor
            .invoke(Invocation {
                agent: &self.lead,
                task: &self.task,
                format_instructions: &format,
                context: &context,
                feedback: self.feedback.as_deref(),
                tool_whitelist: &whitelist,
            })
            .await?;

        let raw = match response {
            AgentResponse::Answer { raw, .. } => raw,
            AgentResponse::NeedsHelp { reason } => {
                return Err(TaskFailure::HelpRequested {
                    role: self.lead.name.clone(),
                    reason,
                })
            }
        };

        let artifact = self
            .registry
            .validate(&self.task.name, &raw)
            .into_result()?
            .produced_by(&self.lead.name, self.attempt);
        Ok(artifact)
    }

    /// Run the helper roles first and fold their answers into the lead's
    /// context as insights.
    async fn gather_contributions(&self, context: &mut ContextBundle) -> Result<(), TaskFailure> {
        let request = match &self.help_reason {
            Some(reason) => format!("{} asked for help with this task: {}", self.lead.role.trim(), reason),
            None => format!("Contribute findings that help {} complete this task.", self.lead.role.trim()),
        };
        let (executor, task, shared, request) = (&self.executor, &self.task, &*context, request.as_str());

        let results = join_all(self.helpers.iter().map(|helper| {
            let whitelist = tool_whitelist(helper, task);
            async move {
                let response = executor
                    .invoke(Invocation {
                        agent: helper,
                        task,
                        format_instructions: "",
                        context: shared,
                        feedback: Some(request),
                        tool_whitelist: &whitelist,
                    })
                    .await;
                (helper.name.clone(), response)
            }
        }))
        .await;

        for (helper, response) in results {
            match response? {
                AgentResponse::Answer { raw, .. } => context.insights.push(format!("[{}] {}", helper, raw.trim())),
                AgentResponse::NeedsHelp { reason } => {
                    log::debug!("helper '{}' could not contribute to '{}': {}", helper, task.name, reason)
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DelegationScheduler
// ---------------------------------------------------------------------------

/// Drives a [`TaskGraph`] to completion through a [`DecisionPolicy`].
pub struct DelegationScheduler {
    executor: CrewAgentExecutor,
    registry: Arc<SchemaRegistry>,
    /// Roles that execute tasks, in declaration order.
    roles: Vec<Agent>,
    policy: Arc<dyn DecisionPolicy>,
    memory: Option<DispatchMemory>,
    events: EventBus,
    cancellation: Cancellation,
    /// Invocations in flight at once.
    pub max_concurrency: usize,
    pub partial_results: PartialResultPolicy,
}

impl DelegationScheduler {
    /// Create a scheduler without memory.
    ///
    /// # Arguments
    /// * `executor` - Runs each invocation.
    /// * `registry` - Validates every result.
    /// * `roles` - Executing roles; a role with delegation permission is
    ///   never dispatched to.
    /// * `policy` - Decides each round's dispatches.
    pub fn new(
        executor: CrewAgentExecutor,
        registry: Arc<SchemaRegistry>,
        roles: Vec<Agent>,
        policy: Arc<dyn DecisionPolicy>,
    ) -> Self {
        Self {
            executor,
            registry,
            roles,
            policy,
            memory: None,
            events: EventBus::default(),
            cancellation: Cancellation::new(),
            max_concurrency: 4,
            partial_results: PartialResultPolicy::Abort,
        }
    }

    pub fn with_memory(mut self, tiers: Arc<MemoryTierManager>, durable_top_k: usize, session_top_k: usize) -> Self {
        let contextual = ContextualMemory::new(Arc::clone(&tiers), durable_top_k, session_top_k);
        self.memory = Some(DispatchMemory { tiers, contextual });
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_partial_results(mut self, policy: PartialResultPolicy) -> Self {
        self.partial_results = policy;
        self
    }

    fn role(&self, name: &str) -> Option<&Agent> {
        self.roles.iter().find(|r| r.name == name && !r.allow_delegation)
    }

    fn snapshot(&self, graph: &TaskGraph, in_flight: &HashSet<String>) -> GraphSnapshot {
        GraphSnapshot {
            tasks: graph.snapshot(),
            dispatchable: graph.dispatchable(),
            in_flight: graph
                .tasks()
                .filter(|t| in_flight.contains(&t.name))
                .map(|t| t.name.clone())
                .collect(),
            roles: self
                .roles
                .iter()
                .filter(|r| !r.allow_delegation)
                .map(RoleView::from)
                .collect(),
            retry_ceiling: graph.retry_ceiling(),
            capacity: self.max_concurrency.saturating_sub(in_flight.len()),
        }
    }

    /// Resolve a decision's roles, or `None` if any is unknown or may not
    /// execute tasks.
    fn resolve_roles(&self, roles: &[String]) -> Option<Vec<Agent>> {
        let mut resolved: Vec<Agent> = Vec::new();
        for name in roles {
            let agent = self.role(name)?;
            if !resolved.iter().any(|a| a.name == agent.name) {
                resolved.push(agent.clone());
            }
        }
        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    }

    /// Drive `graph` until it completes or the run aborts.
    pub async fn run(&self, graph: &mut TaskGraph) -> ScheduleOutcome {
        let mut join_set: JoinSet<DispatchReport> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut feedback: HashMap<String, String> = HashMap::new();
        let mut cancel_rx = self.cancellation.subscribe();

        log::info!(
            "starting run of {} task(s) with the {} policy",
            graph.len(),
            self.policy.name()
        );
        self.events.publish(OrchestrationEvent::SessionStarted {
            tasks: graph.tasks().map(|t| t.name.clone()).collect(),
            policy: self.policy.name().to_string(),
        });

        let outcome = loop {
            if self.cancellation.is_cancelled() {
                break ScheduleOutcome::Aborted(AbortReason::Cancelled);
            }
            if graph.is_complete() {
                break ScheduleOutcome::Completed;
            }
            if let Some(exhausted) = self.settle_exhausted(graph) {
                break ScheduleOutcome::Aborted(AbortReason::Exhausted(exhausted));
            }

            if let Err(e) = self
                .dispatch_round(graph, &mut join_set, &mut in_flight, &feedback, &mut cancel_rx)
                .await
            {
                log::error!("scheduler state error: {}", e);
            }
            if self.cancellation.is_cancelled() {
                continue;
            }

            if in_flight.is_empty() {
                if graph.is_complete() {
                    continue;
                }
                log::error!("no task in flight and none dispatchable; run stalled");
                break ScheduleOutcome::Aborted(AbortReason::Stalled);
            }

            let joined = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => continue,
                joined = join_set.join_next() => joined,
            };

            match joined {
                Some(Ok(mut report)) => {
                    in_flight.remove(&report.task);
                    self.persist(graph, &mut report).await;
                    if let Err(e) = self.apply_report(graph, report, &mut feedback) {
                        log::error!("scheduler state error: {}", e);
                    }
                }
                Some(Err(e)) => {
                    log::error!("dispatch task failed to join: {}", e);
                }
                None => {
                    log::error!("join set drained with {} task(s) marked in flight", in_flight.len());
                    break ScheduleOutcome::Aborted(AbortReason::Stalled);
                }
            }
        };

        if !join_set.is_empty() {
            log::warn!("discarding {} in-flight invocation(s)", join_set.len());
            join_set.detach_all();
        }

        log::info!(
            "run {} after {} dispatch(es)",
            outcome.label(),
            graph.total_dispatches()
        );
        self.events.publish(OrchestrationEvent::SessionFinished {
            status: outcome.label().to_string(),
            dispatches: graph.total_dispatches(),
        });
        outcome
    }

    /// Skip exhausted optional tasks when allowed. Returns the exhausted
    /// tasks that must abort the run, if any.
    fn settle_exhausted(&self, graph: &mut TaskGraph) -> Option<Vec<String>> {
        let exhausted: Vec<(String, bool)> = graph
            .exhausted_tasks()
            .into_iter()
            .map(|s| (s.task.name.clone(), s.task.optional))
            .collect();

        let mut fatal = Vec::new();
        for (name, optional) in exhausted {
            if optional && self.partial_results == PartialResultPolicy::SkipOptional {
                match graph.mark_skipped(&name) {
                    Ok(()) => {
                        log::warn!("optional task '{}' exhausted its retries; skipping", name);
                        self.events.publish(OrchestrationEvent::TaskSkipped { task: name });
                    }
                    Err(e) => {
                        log::error!("scheduler state error: {}", e);
                        fatal.push(name);
                    }
                }
            } else {
                fatal.push(name);
            }
        }

        if fatal.is_empty() {
            None
        } else {
            log::error!("task(s) exhausted their retries: {}", fatal.join(", "));
            Some(fatal)
        }
    }

    /// Ask the policy for decisions and spawn the valid ones.
    async fn dispatch_round(
        &self,
        graph: &mut TaskGraph,
        join_set: &mut JoinSet<DispatchReport>,
        in_flight: &mut HashSet<String>,
        feedback: &HashMap<String, String>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), GraphStateError> {
        let snapshot = self.snapshot(graph, in_flight);
        if snapshot.capacity == 0 || snapshot.dispatchable.is_empty() {
            return Ok(());
        }

        let decisions = tokio::select! {
            biased;
            _ = cancelled(cancel_rx) => {
                log::info!("cancelled while the {} policy was deciding", self.policy.name());
                return Ok(());
            }
            decisions = self.policy.decide(&snapshot) => decisions,
        };
        let mut spawned = 0usize;

        for decision in decisions {
            if spawned >= snapshot.capacity || self.cancellation.is_cancelled() {
                break;
            }
            let task = decision.task().to_string();
            let Some(view) = snapshot.task(&task) else {
                log::warn!("policy chose unknown task '{}'", task);
                continue;
            };
            if !snapshot.dispatchable.contains(&task) || in_flight.contains(&task) {
                log::warn!("policy chose task '{}' which is not dispatchable", task);
                continue;
            }

            let roles = decision.roles();
            let (agents, fallback) = match self.resolve_roles(&roles) {
                Some(agents) => (agents, false),
                None => {
                    log::warn!(
                        "policy assigned '{}' to unusable role(s) [{}]; using bound role '{}'",
                        task,
                        roles.join(", "),
                        view.agent
                    );
                    match self.role(&view.agent) {
                        Some(bound) => (vec![bound.clone()], true),
                        None => {
                            log::error!("bound role '{}' of '{}' cannot execute tasks", view.agent, task);
                            continue;
                        }
                    }
                }
            };

            self.events.publish(OrchestrationEvent::DecisionMade {
                task: task.clone(),
                roles: agents.iter().map(|a| a.name.clone()).collect(),
                policy: self.policy.name().to_string(),
                fallback,
            });
            self.spawn_dispatch(graph, join_set, in_flight, feedback, &task, agents)?;
            spawned += 1;
        }

        if spawned == 0 && in_flight.is_empty() && !self.cancellation.is_cancelled() {
            log::warn!("policy dispatched nothing; dispatching ready tasks to their bound roles");
            for task in snapshot.dispatchable.iter().take(snapshot.capacity) {
                let Some(view) = snapshot.task(task) else { continue };
                let Some(bound) = self.role(&view.agent).cloned() else {
                    log::error!("bound role '{}' of '{}' cannot execute tasks", view.agent, task);
                    continue;
                };
                self.spawn_dispatch(graph, join_set, in_flight, feedback, task, vec![bound])?;
            }
        }
        Ok(())
    }

    fn spawn_dispatch(
        &self,
        graph: &mut TaskGraph,
        join_set: &mut JoinSet<DispatchReport>,
        in_flight: &mut HashSet<String>,
        feedback: &HashMap<String, String>,
        task_name: &str,
        mut agents: Vec<Agent>,
    ) -> Result<(), GraphStateError> {
        if agents.is_empty() {
            return Ok(());
        }
        let roles: Vec<String> = agents.iter().map(|a| a.name.clone()).collect();
        let attempt = graph.mark_dispatched(task_name, roles.clone())?;
        let state = graph
            .state(task_name)
            .ok_or_else(|| GraphStateError::UnknownTask(task_name.to_string()))?;

        let task = state.task.clone();
        let help_reason = state.help_request.clone();
        let dependencies: Vec<Artifact> = task
            .context
            .iter()
            .filter_map(|dep| graph.artifact(dep).cloned())
            .collect();
        let lead = agents.remove(0);

        log::info!(
            "dispatching '{}' to [{}] (attempt {})",
            task_name,
            roles.join(", "),
            attempt
        );

        let job = DispatchJob {
            executor: self.executor.clone(),
            registry: Arc::clone(&self.registry),
            memory: self.memory.clone(),
            task,
            lead,
            helpers: agents,
            help_reason,
            dependencies,
            feedback: feedback.get(task_name).cloned(),
            attempt,
        };
        join_set.spawn(job.run());
        in_flight.insert(task_name.to_string());

        self.events.publish(OrchestrationEvent::TaskDispatched {
            task: task_name.to_string(),
            roles,
            attempt,
        });
        Ok(())
    }

    /// Write an accepted artifact to memory before it is recorded. A memory
    /// outage turns the report into a task failure and leaves every tier
    /// untouched except, possibly, the durable one.
    async fn persist(&self, graph: &TaskGraph, report: &mut DispatchReport) {
        if !report.remember {
            return;
        }
        let (Some(memory), Ok(artifact)) = (&self.memory, &report.outcome) else {
            return;
        };
        let Some(state) = graph.state(&report.task) else {
            return;
        };
        let written = self.remember(&memory.tiers, &state.task, &report.lead, artifact).await;
        if let Err(e) = written {
            log::warn!("could not store the result of '{}': {}", report.task, e);
            report.outcome = Err(TaskFailure::from(e));
        }
    }

    /// Append to durable memory, then session, then entity. A durable
    /// failure leaves the other tiers untouched.
    async fn remember(
        &self,
        tiers: &MemoryTierManager,
        task: &Task,
        agent: &str,
        artifact: &Artifact,
    ) -> Result<(), MemoryUnavailable> {
        let content = artifact.to_json_string();
        let metadata = HashMap::from([
            ("task".to_string(), serde_json::json!(task.name)),
            ("schema".to_string(), serde_json::json!(artifact.schema)),
            ("agent".to_string(), serde_json::json!(agent)),
        ]);
        tiers
            .append_with_metadata(MemoryScope::Durable, &task.key(), &content, metadata)
            .await?;
        tiers.append(MemoryScope::Session, &task.name, &content).await?;

        if let Some(schema) = self.registry.schema_for_task(&task.name) {
            for (name, item) in schema.extract_entities(&artifact.data) {
                tiers.append(MemoryScope::Entity, &name, &item.to_string()).await?;
            }
        }
        Ok(())
    }

    fn apply_report(
        &self,
        graph: &mut TaskGraph,
        report: DispatchReport,
        feedback: &mut HashMap<String, String>,
    ) -> Result<(), GraphStateError> {
        match report.outcome {
            Ok(artifact) => {
                graph.record_result(&report.task, artifact)?;
                feedback.remove(&report.task);
                log::info!("'{}' succeeded (attempt {})", report.task, report.attempt);
                self.events.publish(OrchestrationEvent::TaskSucceeded {
                    task: report.task,
                    agent: report.lead,
                    attempt: report.attempt,
                });
            }
            Err(failure) => {
                if let TaskFailure::HelpRequested { role, reason } = &failure {
                    graph.record_help_request(&report.task, reason)?;
                    self.events.publish(OrchestrationEvent::HelpRequested {
                        task: report.task.clone(),
                        role: role.clone(),
                        reason: reason.clone(),
                    });
                }

                let retryable = failure.is_retryable();
                let reason = failure.to_string();
                let failures = graph.mark_failed(&report.task, &reason, retryable)?;
                match failure.corrective_feedback() {
                    Some(text) => {
                        feedback.insert(report.task.clone(), text);
                    }
                    None => {
                        feedback.remove(&report.task);
                    }
                }

                log::warn!(
                    "'{}' failed (attempt {}, {} failure(s), retryable: {}): {}",
                    report.task,
                    report.attempt,
                    failures,
                    retryable,
                    reason
                );
                self.events.publish(OrchestrationEvent::TaskFailed {
                    task: report.task,
                    attempt: report.attempt,
                    failures,
                    retryable,
                    reason,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llms::base_llm::{BaseLLM, LLMError};
    use crate::manager::delegation::{DispatchDecision, RuleBasedPolicy};
    use crate::memory::storage::{EntityStorage, RAGStorage};
    use crate::memory::{MemoryRecord, RetryPolicy, Storage};
    use crate::schema::{FieldSpec, FieldType, OutputSchema};
    use crate::tasks::task_graph::TaskStatus;
    use async_trait::async_trait;
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;
    use regex::Regex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static TASK_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"Current Task: Work on (\w+)\.").unwrap());
    static ROLE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^You are (\w+)\.").unwrap());

    type Script = dyn Fn(&str, &str, usize) -> Result<String, LLMError> + Send + Sync;

    /// Backend whose reply depends on the task, the role and how many times
    /// that task has been seen. Tracks peak concurrency.
    struct ScriptedLLM {
        script: Box<Script>,
        calls: Mutex<HashMap<String, usize>>,
        prompts: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl std::fmt::Debug for ScriptedLLM {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("ScriptedLLM")
        }
    }

    impl ScriptedLLM {
        fn new<F>(script: F) -> Arc<Self>
        where
            F: Fn(&str, &str, usize) -> Result<String, LLMError> + Send + Sync + 'static,
        {
            Self::with_delay(Duration::from_millis(20), script)
        }

        fn with_delay<F>(delay: Duration, script: F) -> Arc<Self>
        where
            F: Fn(&str, &str, usize) -> Result<String, LLMError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                script: Box::new(script),
                calls: Mutex::new(HashMap::new()),
                prompts: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self, task: &str) -> usize {
            self.calls.lock().get(task).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BaseLLM for ScriptedLLM {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _tools: &[String]) -> Result<String, LLMError> {
            let task = TASK_MARKER
                .captures(prompt)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let role = ROLE_MARKER
                .captures(prompt)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let call = {
                let mut calls = self.calls.lock();
                let n = calls.entry(task.clone()).or_insert(0);
                *n += 1;
                *n
            };
            self.prompts.lock().push(prompt.to_string());

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            (self.script)(&task, &role, call)
        }
    }

    const VALID: &str = "Thought: done\nFinal Answer: {\"summary\": \"ok\"}";
    const INVALID: &str = "Thought: done\nFinal Answer: {\"other\": 1}";

    fn task(name: &str, deps: &[&str]) -> Task {
        Task::new(name, format!("Work on {}.", name), "A note.", "writer", "Note").with_context(deps.iter().copied())
    }

    fn registry(tasks: &[Task]) -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new().with_schema(
            OutputSchema::new(
                "Note",
                vec![
                    FieldSpec::required("summary", FieldType::String),
                    FieldSpec::optional(
                        "companies",
                        FieldType::list(FieldType::object(vec![FieldSpec::required("name", FieldType::String)])),
                    ),
                ],
            )
            .with_entities(
                "companies",
                "name",
                "company",
            ),
        );
        for t in tasks {
            registry.bind(t.name.clone(), "Note");
        }
        Arc::new(registry)
    }

    fn roles() -> Vec<Agent> {
        vec![
            Agent::new("writer", "writer", "Write notes", "Writes."),
            Agent::new("helper", "helper", "Help out", "Helps."),
            Agent::manager(),
        ]
    }

    fn scheduler(llm: Arc<ScriptedLLM>, tasks: &[Task]) -> DelegationScheduler {
        DelegationScheduler::new(
            CrewAgentExecutor::new(llm, Vec::new()),
            registry(tasks),
            roles(),
            Arc::new(RuleBasedPolicy::new()),
        )
    }

    fn graph(tasks: Vec<Task>) -> TaskGraph {
        TaskGraph::new(tasks, 3).unwrap()
    }

    #[tokio::test]
    async fn test_chain_completes_in_dependency_order() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm, &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.completion_order(), &["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(g.total_dispatches(), 3);
        for name in ["a", "b", "c"] {
            let artifact = g.artifact(name).unwrap();
            assert_eq!(artifact.agent, "writer");
            assert!(registry(&tasks).conforms(artifact));
        }
    }

    #[tokio::test]
    async fn test_always_invalid_task_aborts_after_ceiling() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let llm = ScriptedLLM::new(|task, _, _| Ok(if task == "b" { INVALID } else { VALID }.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Exhausted(vec!["b".into()])));
        let b = g.state("b").unwrap();
        assert_eq!(b.failures, 3);
        assert_eq!(b.dispatches, 3);
        assert_eq!(llm.calls("b"), 3);
        assert_eq!(g.state("c").unwrap().dispatches, 0);
        assert_eq!(g.status("c"), Some(&TaskStatus::Pending));
        assert!(g.total_dispatches() <= 3 * 4);
    }

    #[tokio::test]
    async fn test_validation_failure_feeds_back_into_retry() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, call| Ok(if call == 1 { INVALID } else { VALID }.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.artifact("a").unwrap().attempt, 2);
        let prompts = llm.prompts.lock();
        assert!(!prompts[0].contains("did not match the required 'Note' format"));
        assert!(prompts[1].contains("did not match the required 'Note' format"));
        assert!(prompts[1].contains("/summary: missing required field"));
    }

    #[tokio::test]
    async fn test_siblings_dispatch_concurrently() {
        let tasks = vec![task("a", &[]), task("d", &["a"]), task("e", &["a"])];
        let llm = ScriptedLLM::with_delay(Duration::from_millis(100), |_, _, _| Ok(VALID.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.completion_order()[0], "a");
        assert_eq!(llm.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &[])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks)
            .with_max_concurrency(1)
            .run(&mut g)
            .await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(llm.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_content_policy_failure_exhausts_immediately() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let llm = ScriptedLLM::new(|_, _, _| Err(LLMError::ContentPolicy("refused".into())));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Exhausted(vec!["a".into()])));
        assert_eq!(g.state("a").unwrap().dispatches, 1);
        assert!(g.state("a").unwrap().last_error().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_transient_backend_failure_is_retried() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, call| {
            if call == 1 {
                Err(LLMError::Transient("timeout".into()))
            } else {
                Ok(VALID.into())
            }
        });
        let mut g = graph(tasks.clone());

        assert_eq!(scheduler(llm, &tasks).run(&mut g).await, ScheduleOutcome::Completed);
        assert_eq!(g.state("a").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_skip_optional_lets_dependents_run() {
        let tasks = vec![task("a", &[]), task("b", &["a"]).with_optional(true), task("c", &["b"])];
        let llm = ScriptedLLM::new(|task, _, _| Ok(if task == "b" { INVALID } else { VALID }.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm, &tasks)
            .with_partial_results(PartialResultPolicy::SkipOptional)
            .run(&mut g)
            .await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.status("b"), Some(&TaskStatus::Skipped));
        assert_eq!(g.status("c"), Some(&TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_optional_task_still_aborts_under_abort_policy() {
        let tasks = vec![task("a", &[]).with_optional(true)];
        let llm = ScriptedLLM::new(|_, _, _| Ok(INVALID.into()));
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm, &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Exhausted(vec!["a".into()])));
    }

    #[tokio::test]
    async fn test_help_request_leads_to_split_dispatch() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, role, call| {
            Ok(match (role, call) {
                ("writer", 1) => "Thought: stuck\nNeeds Help: need market data".into(),
                ("helper", _) => "Final Answer: market grows 5% a year".into(),
                _ => VALID.into(),
            })
        });
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).with_events(events).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.state("a").unwrap().assigned_roles, vec!["writer".to_string(), "helper".to_string()]);

        let prompts = llm.prompts.lock();
        assert!(prompts[1].starts_with("You are helper."));
        assert!(prompts[1].contains("writer asked for help with this task: need market data"));
        assert!(prompts[2].contains("[helper] market grows 5% a year"));

        let mut saw_help = false;
        while let Ok(event) = rx.try_recv() {
            if let OrchestrationEvent::HelpRequested { role, .. } = event {
                assert_eq!(role, "writer");
                saw_help = true;
            }
        }
        assert!(saw_help);
    }

    /// Always picks a role that does not exist.
    struct BrokenPolicy;

    #[async_trait]
    impl DecisionPolicy for BrokenPolicy {
        fn name(&self) -> &str {
            "broken"
        }

        async fn decide(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
            snapshot
                .dispatchable
                .iter()
                .map(|t| DispatchDecision::Dispatch {
                    task: t.clone(),
                    role: "crew_manager".into(),
                })
                .collect()
        }
    }

    /// Never dispatches anything.
    struct IdlePolicy;

    #[async_trait]
    impl DecisionPolicy for IdlePolicy {
        fn name(&self) -> &str {
            "idle"
        }

        async fn decide(&self, _snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_ineligible_role_falls_back_to_bound_role() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let mut g = graph(tasks.clone());

        let outcome = DelegationScheduler::new(
            CrewAgentExecutor::new(llm, Vec::new()),
            registry(&tasks),
            roles(),
            Arc::new(BrokenPolicy),
        )
        .with_events(events)
        .run(&mut g)
        .await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        assert_eq!(g.artifact("a").unwrap().agent, "writer");

        let mut fallback_seen = false;
        while let Ok(event) = rx.try_recv() {
            if let OrchestrationEvent::DecisionMade { fallback, roles, .. } = event {
                assert!(fallback);
                assert_eq!(roles, vec!["writer".to_string()]);
                fallback_seen = true;
            }
        }
        assert!(fallback_seen);
    }

    #[tokio::test]
    async fn test_idle_policy_still_makes_progress() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let mut g = graph(tasks.clone());

        let outcome = DelegationScheduler::new(
            CrewAgentExecutor::new(llm, Vec::new()),
            registry(&tasks),
            roles(),
            Arc::new(IdlePolicy),
        )
        .run(&mut g)
        .await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cancel_before_start_dispatches_nothing() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm, &tasks)
            .with_cancellation(cancellation)
            .run(&mut g)
            .await;
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Cancelled));
        assert_eq!(g.total_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_run_discards_in_flight_work() {
        let tasks = vec![task("a", &[]), task("b", &["a"])];
        let llm = ScriptedLLM::with_delay(Duration::from_secs(30), |_, _, _| Ok(VALID.into()));
        let cancellation = Cancellation::new();
        let trigger = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut g = graph(tasks.clone());

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler(llm, &tasks).with_cancellation(cancellation).run(&mut g),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Cancelled));
        assert!(g.artifact("a").is_none());
        assert_eq!(g.state("b").unwrap().dispatches, 0);
    }

    #[tokio::test]
    async fn test_success_is_written_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let tiers = Arc::new(MemoryTierManager::open(Some(dir.path().join("mem.db"))).unwrap());
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, _| {
            Ok("Final Answer: {\"summary\": \"ok\", \"companies\": [{\"name\": \"Kongsberg\"}]}".into())
        });
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm, &tasks)
            .with_memory(Arc::clone(&tiers), 2, 3)
            .run(&mut g)
            .await;
        assert_eq!(outcome, ScheduleOutcome::Completed);

        let durable = tiers.query(MemoryScope::Durable, &tasks[0].key(), 5).await.unwrap();
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].metadata["agent"], "writer");
        let session = tiers.query(MemoryScope::Session, "summary ok", 5).await.unwrap();
        assert_eq!(session[0].key, "a");
        assert_eq!(tiers.entity_names().await.unwrap(), vec!["Kongsberg".to_string()]);
    }

    #[tokio::test]
    async fn test_roles_without_memory_permission_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tiers = Arc::new(MemoryTierManager::open(Some(dir.path().join("mem.db"))).unwrap());
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let mut g = graph(tasks.clone());
        let roles = vec![Agent::new("writer", "writer", "Write notes", "Writes.").with_memory(false)];

        DelegationScheduler::new(
            CrewAgentExecutor::new(llm, Vec::new()),
            registry(&tasks),
            roles,
            Arc::new(RuleBasedPolicy::new()),
        )
        .with_memory(Arc::clone(&tiers), 2, 3)
        .run(&mut g)
        .await;

        assert!(tiers.query(MemoryScope::Durable, &tasks[0].key(), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_work_is_never_written_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let tiers = Arc::new(MemoryTierManager::open(Some(dir.path().join("mem.db"))).unwrap());
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::with_delay(Duration::from_millis(300), |_, _, _| {
            Ok("Final Answer: {\"summary\": \"ok\", \"companies\": [{\"name\": \"Kongsberg\"}]}".into())
        });
        let cancellation = Cancellation::new();
        let trigger = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks)
            .with_memory(Arc::clone(&tiers), 2, 3)
            .with_cancellation(cancellation)
            .run(&mut g)
            .await;
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Cancelled));

        // Let the detached invocation finish.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(llm.calls("a"), 1);
        assert!(tiers.query(MemoryScope::Durable, &tasks[0].key(), 5).await.unwrap().is_empty());
        assert!(tiers.query(MemoryScope::Session, "summary ok", 5).await.unwrap().is_empty());
        assert!(tiers.entity_names().await.unwrap().is_empty());
    }

    /// Durable store that accepts reads and rejects every write.
    struct ReadOnlyStorage;

    #[async_trait]
    impl Storage for ReadOnlyStorage {
        fn scope(&self) -> MemoryScope {
            MemoryScope::Durable
        }

        async fn append(&self, _record: MemoryRecord) -> Result<(), anyhow::Error> {
            anyhow::bail!("durable store is read-only")
        }

        async fn query(&self, _probe: &str, _top_k: usize) -> Result<Vec<MemoryRecord>, anyhow::Error> {
            Ok(Vec::new())
        }

        async fn reset(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_durable_outage_fails_only_the_writing_task() {
        let tiers = Arc::new(
            MemoryTierManager::new(
                Arc::new(ReadOnlyStorage),
                Arc::new(RAGStorage::default()),
                Arc::new(EntityStorage::new()),
            )
            .with_retry(RetryPolicy::immediate(1)),
        );
        let tasks = vec![
            task("a", &[]),
            Task::new("b", "Work on b.", "A note.", "helper", "Note"),
        ];
        let roles = vec![
            Agent::new("writer", "writer", "Write notes", "Writes."),
            Agent::new("helper", "helper", "Help out", "Helps.").with_memory(false),
        ];
        let llm = ScriptedLLM::new(|_, _, _| {
            Ok("Final Answer: {\"summary\": \"ok\", \"companies\": [{\"name\": \"Kongsberg\"}]}".into())
        });
        let mut g = graph(tasks.clone());

        let outcome = DelegationScheduler::new(
            CrewAgentExecutor::new(llm.clone(), Vec::new()),
            registry(&tasks),
            roles,
            Arc::new(RuleBasedPolicy::new()),
        )
        .with_memory(Arc::clone(&tiers), 2, 3)
        .run(&mut g)
        .await;

        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Exhausted(vec!["a".into()])));
        let a = g.state("a").unwrap();
        assert_eq!(a.failures, 3);
        assert_eq!(llm.calls("a"), 3);
        assert!(a.last_error().unwrap().contains("memory unavailable"));
        assert!(g.artifact("a").is_none());
        assert_eq!(g.status("b"), Some(&TaskStatus::Succeeded));

        assert!(tiers.query(MemoryScope::Session, "summary ok", 5).await.unwrap().is_empty());
        assert!(tiers.entity_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_invocation_is_retried() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, call| {
            if call == 1 {
                panic!("backend crashed");
            }
            Ok(VALID.into())
        });
        let mut g = graph(tasks.clone());

        let outcome = scheduler(llm.clone(), &tasks).run(&mut g).await;
        assert_eq!(outcome, ScheduleOutcome::Completed);
        let a = g.state("a").unwrap();
        assert_eq!(a.failures, 1);
        assert!(a.last_error().unwrap().contains("panicked"));
        assert_eq!(g.artifact("a").unwrap().attempt, 2);
    }

    /// Takes far longer to decide than any test waits.
    struct SlowPolicy;

    #[async_trait]
    impl DecisionPolicy for SlowPolicy {
        fn name(&self) -> &str {
            "slow"
        }

        async fn decide(&self, snapshot: &GraphSnapshot) -> Vec<DispatchDecision> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            RuleBasedPolicy::new().decisions(snapshot)
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_a_pending_decision() {
        let tasks = vec![task("a", &[])];
        let llm = ScriptedLLM::new(|_, _, _| Ok(VALID.into()));
        let cancellation = Cancellation::new();
        let trigger = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut g = graph(tasks.clone());

        let scheduler = DelegationScheduler::new(
            CrewAgentExecutor::new(llm.clone(), Vec::new()),
            registry(&tasks),
            roles(),
            Arc::new(SlowPolicy),
        )
        .with_cancellation(cancellation);
        let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.run(&mut g))
            .await
            .unwrap();
        assert_eq!(outcome, ScheduleOutcome::Aborted(AbortReason::Cancelled));
        assert_eq!(g.total_dispatches(), 0);
        assert_eq!(llm.calls("a"), 0);
    }
}
