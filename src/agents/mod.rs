//! Agent invocation: the ReAct executor and its output parser.

pub mod crew_agent_executor;
pub mod parser;

pub use crew_agent_executor::{AgentResponse, CrewAgentExecutor, Invocation, DEFAULT_MAX_ITER};
pub use parser::{AgentAction, AgentFinish, OutputParserError, ParseResult};
