//! Agent executor.
//!
//! Drives one invocation of one role on one task: builds the prompt from the
//! persona, the interpolated task, the output format and the context bundle,
//! then runs the ReAct loop (`Thought / Action / Action Input / Observation /
//! Final Answer`) against the generation backend until the role produces a
//! final answer, asks for help, or runs out of iterations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::parser::{parse, AgentAction, ParseResult};
use crate::agent::Agent;
use crate::llms::base_llm::BaseLLM;
use crate::memory::ContextBundle;
use crate::task::Task;
use crate::tools::base_tool::{render_tools, BaseTool};
use crate::translations::{render, I18N};
use crate::utilities::errors::{ToolFailureKind, ToolInvocationError};

/// Iteration cap used when neither the role nor the crew sets one.
pub const DEFAULT_MAX_ITER: u32 = 8;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Everything one invocation needs.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub agent: &'a Agent,
    /// The task with run inputs already interpolated.
    pub task: &'a Task,
    /// Output format instruction of the task's schema.
    pub format_instructions: &'a str,
    pub context: &'a ContextBundle,
    /// Corrective feedback from the previous failed attempt.
    pub feedback: Option<&'a str>,
    /// Tools the role may call on this task.
    pub tool_whitelist: &'a [String],
}

/// What the role produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    /// Raw final answer, to be validated against the task's schema.
    Answer { raw: String, tool_calls: u32 },
    /// The role cannot finish the task alone.
    NeedsHelp { reason: String },
}

// ---------------------------------------------------------------------------
// CrewAgentExecutor
// ---------------------------------------------------------------------------

/// Runs agent invocations against a shared backend and tool set.
#[derive(Clone)]
pub struct CrewAgentExecutor {
    llm: Arc<dyn BaseLLM>,
    tools: HashMap<String, Arc<dyn BaseTool>>,
    /// Iteration cap for roles without their own.
    pub max_iter: u32,
}

impl fmt::Debug for CrewAgentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tools: Vec<&String> = self.tools.keys().collect();
        tools.sort();
        f.debug_struct("CrewAgentExecutor")
            .field("model", &self.llm.model())
            .field("tools", &tools)
            .field("max_iter", &self.max_iter)
            .finish()
    }
}

impl CrewAgentExecutor {
    /// Create an executor.
    ///
    /// # Arguments
    /// * `llm` - Generation backend shared by every role.
    /// * `tools` - Every tool available to the crew; each invocation only
    ///   sees the whitelisted subset.
    pub fn new(llm: Arc<dyn BaseLLM>, tools: Vec<Arc<dyn BaseTool>>) -> Self {
        Self {
            llm,
            tools: tools.into_iter().map(|t| (t.name().to_string(), t)).collect(),
            max_iter: DEFAULT_MAX_ITER,
        }
    }

    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    pub fn llm(&self) -> &Arc<dyn BaseLLM> {
        &self.llm
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Whitelisted tools that are actually registered, in whitelist order.
    fn allowed_tools(&self, whitelist: &[String]) -> Vec<Arc<dyn BaseTool>> {
        whitelist
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(tool) => Some(Arc::clone(tool)),
                None => {
                    log::warn!("tool '{}' is whitelisted but not registered", name);
                    None
                }
            })
            .collect()
    }

    /// Assemble the full prompt for one invocation.
    pub fn build_prompt(&self, invocation: &Invocation<'_>, tools: &[Arc<dyn BaseTool>]) -> String {
        let mut prompt = invocation.agent.persona();

        if tools.is_empty() {
            prompt.push_str(I18N.slice("no_tools"));
        } else {
            let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
            prompt.push_str(&render(
                I18N.slice("tools"),
                &[("tools", render_tools(tools).as_str()), ("tool_names", names.join(", ").as_str())],
            ));
        }
        prompt.push_str(I18N.slice("needs_help"));

        if !invocation.format_instructions.is_empty() {
            prompt.push_str(&render(
                I18N.slice("formatted_output"),
                &[("output_format", invocation.format_instructions)],
            ));
        }
        if let Some(feedback) = invocation.feedback {
            prompt.push_str(&render(I18N.slice("feedback"), &[("feedback", feedback)]));
        }

        let mut input = invocation.task.prompt();
        if !invocation.context.is_empty() {
            input.push_str(&render(
                I18N.slice("context"),
                &[("context", invocation.context.render().as_str())],
            ));
        }
        prompt.push_str(&render(I18N.slice("task"), &[("input", input.as_str())]));
        prompt
    }

    /// Run one invocation.
    ///
    /// # Errors
    /// Backend failures and tool failures other than bad input end the
    /// invocation as `ToolInvocationError`.
    pub async fn invoke(&self, invocation: Invocation<'_>) -> Result<AgentResponse, ToolInvocationError> {
        let tools = self.allowed_tools(invocation.tool_whitelist);
        let tool_names: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        let max_iter = invocation.agent.max_iter.unwrap_or(self.max_iter).max(1);
        let base = self.build_prompt(&invocation, &tools);

        log::debug!(
            "invoking '{}' on '{}' (tools: [{}], max_iter: {})",
            invocation.agent.name,
            invocation.task.name,
            tool_names.join(", "),
            max_iter
        );

        let mut scratchpad = String::new();
        let mut tool_calls = 0u32;

        for iteration in 1..=max_iter {
            let text = self
                .llm
                .generate(&format!("{}{}", base, scratchpad), &tool_names)
                .await?;

            match parse(&text) {
                Ok(ParseResult::Finish(finish)) => {
                    log::debug!(
                        "'{}' finished '{}' after {} iteration(s)",
                        invocation.agent.name,
                        invocation.task.name,
                        iteration
                    );
                    return Ok(AgentResponse::Answer {
                        raw: finish.output,
                        tool_calls,
                    });
                }
                Ok(ParseResult::NeedsHelp(reason)) => {
                    return Ok(AgentResponse::NeedsHelp { reason });
                }
                Ok(ParseResult::Action(action)) => {
                    let observation = self.use_tool(&action, &tools, &tool_names).await?;
                    tool_calls += 1;
                    scratchpad.push_str(&format!(
                        "{}\nObservation: {}\n",
                        text.trim_end(),
                        observation
                    ));
                }
                Err(err) if tools.is_empty() => {
                    log::debug!(
                        "'{}' answered without the expected format ({}); using raw text",
                        invocation.agent.name,
                        err
                    );
                    return Ok(AgentResponse::Answer { raw: text, tool_calls });
                }
                Err(err) => {
                    scratchpad.push_str(&format!(
                        "{}\n{}\n",
                        text.trim_end(),
                        render(I18N.error("wrong_tool_format"), &[("error", err.error.as_str())])
                    ));
                }
            }
        }

        log::warn!(
            "'{}' hit its iteration cap on '{}'; forcing a final answer",
            invocation.agent.name,
            invocation.task.name
        );
        let prompt = format!("{}{}\n{}", base, scratchpad, I18N.slice("force_final_answer"));
        let text = self.llm.generate(&prompt, &[]).await?;
        match parse(&text) {
            Ok(ParseResult::NeedsHelp(reason)) => Ok(AgentResponse::NeedsHelp { reason }),
            Ok(ParseResult::Finish(finish)) => Ok(AgentResponse::Answer {
                raw: finish.output,
                tool_calls,
            }),
            _ => Ok(AgentResponse::Answer { raw: text, tool_calls }),
        }
    }

    /// Run a requested tool and return the observation text.
    async fn use_tool(
        &self,
        action: &AgentAction,
        tools: &[Arc<dyn BaseTool>],
        tool_names: &[String],
    ) -> Result<String, ToolInvocationError> {
        let Some(tool) = tools.iter().find(|t| t.name() == action.tool) else {
            log::debug!("agent requested unavailable tool '{}'", action.tool);
            return Ok(render(
                I18N.error("tool_not_available"),
                &[("tool", action.tool.as_str()), ("tool_names", tool_names.join(", ").as_str())],
            ));
        };

        log::debug!("using tool '{}' with input {}", tool.name(), action.tool_input);
        match tool.run(&action.tool_input).await {
            Ok(output) => Ok(output),
            Err(err) if err.kind == ToolFailureKind::InvalidInput => Ok(render(
                I18N.error("tool_usage_error"),
                &[
                    ("error", err.message.as_str()),
                    ("tool", tool.name()),
                    ("tool_description", tool.description()),
                ],
            )),
            Err(err) => Err(err.into_invocation_error(tool.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llms::base_llm::LLMError;
    use crate::tools::base_tool::ToolError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Backend that replays queued replies and records every prompt.
    #[derive(Debug, Default)]
    struct ScriptedLLM {
        replies: Mutex<Vec<Result<String, LLMError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLLM {
        fn new(replies: Vec<Result<String, LLMError>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BaseLLM for ScriptedLLM {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _tools_allowed: &[String]) -> Result<String, LLMError> {
            self.prompts.lock().push(prompt.to_string());
            self.replies
                .lock()
                .pop()
                .unwrap_or_else(|| Ok("Final Answer: {}".to_string()))
        }
    }

    #[derive(Debug)]
    struct EchoSearch {
        fail_with: Option<ToolError>,
    }

    #[async_trait]
    impl BaseTool for EchoSearch {
        fn name(&self) -> &str {
            "search"
        }

        fn description(&self) -> &str {
            "Echoes the query."
        }

        async fn run(&self, input: &str) -> Result<String, ToolError> {
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(format!("results for {}", input)),
            }
        }
    }

    fn agent() -> Agent {
        Agent::new("market_analyst", "Analyst", "Map the market", "Knows ships.").with_tools(["search"])
    }

    fn task() -> Task {
        Task::new("market_dynamics_task", "Analyse thrusters.", "A report.", "market_analyst", "Report")
    }

    fn invoke_with<'a>(
        agent: &'a Agent,
        task: &'a Task,
        context: &'a ContextBundle,
        whitelist: &'a [String],
    ) -> Invocation<'a> {
        Invocation {
            agent,
            task,
            format_instructions: "{\"summary\": string}",
            context,
            feedback: Some("- /summary: missing required field"),
            tool_whitelist: whitelist,
        }
    }

    #[tokio::test]
    async fn test_react_loop_uses_tool_then_answers() {
        let llm = ScriptedLLM::new(vec![
            Ok("Thought: look it up\nAction: search\nAction Input: {\"search_query\": \"pods\"}".into()),
            Ok("Thought: done\nFinal Answer: {\"summary\": \"ok\"}".into()),
        ]);
        let executor = CrewAgentExecutor::new(llm.clone(), vec![Arc::new(EchoSearch { fail_with: None })]);
        let (agent, task, context) = (agent(), task(), ContextBundle::default());
        let whitelist = vec!["search".to_string()];

        let response = executor
            .invoke(invoke_with(&agent, &task, &context, &whitelist))
            .await
            .unwrap();
        assert_eq!(
            response,
            AgentResponse::Answer {
                raw: "{\"summary\": \"ok\"}".into(),
                tool_calls: 1
            }
        );

        let prompts = llm.prompts.lock();
        assert!(prompts[0].contains("You are Analyst."));
        assert!(prompts[0].contains("Tool Name: search"));
        assert!(prompts[0].contains("- /summary: missing required field"));
        assert!(prompts[0].contains("Current Task: Analyse thrusters."));
        assert!(prompts[1].contains("Observation: results for {\"search_query\": \"pods\"}"));
    }

    #[tokio::test]
    async fn test_tool_outside_whitelist_is_refused() {
        let llm = ScriptedLLM::new(vec![
            Ok("Thought: x\nAction: search\nAction Input: {\"q\": \"pods\"}".into()),
            Ok("Final Answer: {}".into()),
        ]);
        let executor = CrewAgentExecutor::new(llm.clone(), vec![Arc::new(EchoSearch { fail_with: None })]);
        let (agent, task, context) = (agent(), task(), ContextBundle::default());

        executor
            .invoke(invoke_with(&agent, &task, &context, &[]))
            .await
            .unwrap();
        let prompts = llm.prompts.lock();
        assert!(!prompts[0].contains("Tool Name: search"));
        assert!(prompts[1].contains("Action 'search' doesn't exist"));
    }

    #[tokio::test]
    async fn test_needs_help_is_reported() {
        let llm = ScriptedLLM::new(vec![Ok("Thought: stuck\nNeeds Help: need filings access".into())]);
        let executor = CrewAgentExecutor::new(llm, Vec::new());
        let (agent, task, context) = (agent(), task(), ContextBundle::default());

        let response = executor
            .invoke(invoke_with(&agent, &task, &context, &[]))
            .await
            .unwrap();
        assert_eq!(
            response,
            AgentResponse::NeedsHelp {
                reason: "need filings access".into()
            }
        );
    }

    #[tokio::test]
    async fn test_iteration_cap_forces_final_answer() {
        let action = "Thought: again\nAction: search\nAction Input: {\"q\": \"x\"}";
        let llm = ScriptedLLM::new(vec![
            Ok(action.into()),
            Ok(action.into()),
            Ok("{\"summary\": \"forced\"}".into()),
        ]);
        let executor = CrewAgentExecutor::new(llm.clone(), vec![Arc::new(EchoSearch { fail_with: None })]);
        let (task, context) = (task(), ContextBundle::default());
        let agent = agent().with_max_iter(2);
        let whitelist = vec!["search".to_string()];

        let response = executor
            .invoke(invoke_with(&agent, &task, &context, &whitelist))
            .await
            .unwrap();
        assert_eq!(
            response,
            AgentResponse::Answer {
                raw: "{\"summary\": \"forced\"}".into(),
                tool_calls: 2
            }
        );
        let prompts = llm.prompts.lock();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[2].contains("MUST give your absolute best final answer"));
    }

    #[tokio::test]
    async fn test_unformatted_answer_without_tools_is_kept() {
        let llm = ScriptedLLM::new(vec![Ok("```json\n{\"summary\": \"s\"}\n```".into())]);
        let executor = CrewAgentExecutor::new(llm, Vec::new());
        let (agent, task, context) = (agent(), task(), ContextBundle::default());

        match executor.invoke(invoke_with(&agent, &task, &context, &[])).await.unwrap() {
            AgentResponse::Answer { raw, .. } => assert!(raw.contains("\"summary\"")),
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_and_backend_failures_propagate() {
        let llm = ScriptedLLM::new(vec![Ok("Thought: x\nAction: search\nAction Input: {\"q\": \"x\"}".into())]);
        let tool = EchoSearch {
            fail_with: Some(ToolError::transient("timeout")),
        };
        let executor = CrewAgentExecutor::new(llm, vec![Arc::new(tool)]);
        let (agent, task, context) = (agent(), task(), ContextBundle::default());
        let whitelist = vec!["search".to_string()];

        let err = executor
            .invoke(invoke_with(&agent, &task, &context, &whitelist))
            .await
            .unwrap_err();
        assert_eq!(err.tool, "search");
        assert!(err.is_retryable());

        let llm = ScriptedLLM::new(vec![Err(LLMError::ContentPolicy("refused".into()))]);
        let executor = CrewAgentExecutor::new(llm, Vec::new());
        let err = executor
            .invoke(invoke_with(&agent, &task, &context, &[]))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_tool_input_becomes_observation() {
        let llm = ScriptedLLM::new(vec![
            Ok("Thought: x\nAction: search\nAction Input: {}".into()),
            Ok("Final Answer: {}".into()),
        ]);
        let tool = EchoSearch {
            fail_with: Some(ToolError::invalid_input("search query is empty")),
        };
        let executor = CrewAgentExecutor::new(llm.clone(), vec![Arc::new(tool)]);
        let (agent, task, context) = (agent(), task(), ContextBundle::default());
        let whitelist = vec!["search".to_string()];

        executor
            .invoke(invoke_with(&agent, &task, &context, &whitelist))
            .await
            .unwrap();
        assert!(llm.prompts.lock()[1].contains("This was the error: search query is empty"));
    }
}
