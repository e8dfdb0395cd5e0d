//! Parsing of ReAct-style agent turns.
//!
//! A turn is one of:
//!
//! ```text
//! Thought: I should look up suppliers
//! Action: search
//! Action Input: {"search_query": "azimuth thruster suppliers"}
//! ```
//!
//! ```text
//! Thought: I have everything I need
//! Final Answer: {"industry": "..."}
//! ```
//!
//! ```text
//! Thought: this needs a financial analyst
//! Needs Help: cannot assess balance sheets without filings
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// The text prefix for a final answer.
pub const FINAL_ANSWER_ACTION: &str = "Final Answer:";

/// The text prefix an agent uses to ask the manager for help.
pub const NEEDS_HELP_ACTION: &str = "Needs Help:";

const MISSING_ACTION_AFTER_THOUGHT_ERROR_MESSAGE: &str =
    "I just got this: I couldn't find an Action after the Thought.";

const MISSING_ACTION_INPUT_AFTER_ACTION_ERROR_MESSAGE: &str =
    "I just got this: I found an Action but couldn't find a valid Action Input right after it.";

static ACTION_WITH_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)Action\s*\d*\s*:\s*(.+?)\s*(?:\n|\r\n?)Action\s*\d*\s*Input\s*\d*\s*:\s*(.*)").unwrap()
});
static ACTION_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"Action\s*\d*\s*:").unwrap());
static ACTION_INPUT_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Action\s*\d*\s*Input\s*\d*\s*:").unwrap());

/// A tool call requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAction {
    pub thought: String,
    pub tool: String,
    pub tool_input: String,
    /// The raw turn text.
    pub text: String,
}

/// The agent's final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFinish {
    pub thought: String,
    pub output: String,
    pub text: String,
}

/// Result of parsing one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Action(AgentAction),
    Finish(AgentFinish),
    /// The agent cannot finish alone; carries its reason.
    NeedsHelp(String),
}

/// The turn did not follow the expected format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("OutputParserError: {error}")]
pub struct OutputParserError {
    pub error: String,
}

impl OutputParserError {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// Parse one agent turn.
///
/// A final answer wins over an action in the same turn; a help request wins
/// over both.
///
/// # Errors
/// Returns `OutputParserError` with format guidance for the agent.
pub fn parse(text: &str) -> Result<ParseResult, OutputParserError> {
    if let Some(idx) = text.find(NEEDS_HELP_ACTION) {
        let reason = text[idx + NEEDS_HELP_ACTION.len()..].trim();
        let reason = if reason.is_empty() { "no reason given" } else { reason };
        return Ok(ParseResult::NeedsHelp(reason.to_string()));
    }

    let thought = extract_thought(text);

    if text.contains(FINAL_ANSWER_ACTION) {
        let final_answer = text
            .rsplit(FINAL_ANSWER_ACTION)
            .next()
            .unwrap_or_default()
            .trim();
        return Ok(ParseResult::Finish(AgentFinish {
            thought,
            output: clean_trailing_backticks(final_answer),
            text: text.to_string(),
        }));
    }

    if let Some(caps) = ACTION_WITH_INPUT.captures(text) {
        let tool = caps.get(1).map_or("", |m| m.as_str());
        let input = caps.get(2).map_or("", |m| m.as_str());
        let input = cut_at_observation(input).trim().trim_matches('"');
        return Ok(ParseResult::Action(AgentAction {
            thought,
            tool: clean_action(tool),
            tool_input: safe_repair_json(input),
            text: text.to_string(),
        }));
    }

    if !ACTION_ONLY.is_match(text) {
        return Err(OutputParserError::new(format!(
            "{}\nYou MUST use the following format:\n\
             Thought: [your thought]\n\
             Final Answer: [your final answer]",
            MISSING_ACTION_AFTER_THOUGHT_ERROR_MESSAGE
        )));
    }

    if !ACTION_INPUT_ONLY.is_match(text) {
        return Err(OutputParserError::new(MISSING_ACTION_INPUT_AFTER_ACTION_ERROR_MESSAGE));
    }

    Err(OutputParserError::new(
        "Could not parse the output. Please use the correct format.",
    ))
}

fn extract_thought(text: &str) -> String {
    let idx = text.find("\nAction").or_else(|| text.find("\nFinal Answer"));
    match idx {
        Some(idx) => text[..idx].replace("```", "").trim().to_string(),
        None => String::new(),
    }
}

/// Drop a fabricated `Observation:` the model appended to its own action.
fn cut_at_observation(input: &str) -> &str {
    match input.find("\nObservation") {
        Some(idx) => &input[..idx],
        None => input,
    }
}

fn clean_action(text: &str) -> String {
    text.trim().trim_matches('*').trim().to_string()
}

/// Remove an unmatched trailing triple backtick.
fn clean_trailing_backticks(text: &str) -> String {
    if text.ends_with("```") && text.matches("```").count() % 2 != 0 {
        return text[..text.len() - 3].trim_end().to_string();
    }
    text.to_string()
}

/// Repair common JSON slips in tool input; leave it alone if that fails.
fn safe_repair_json(tool_input: &str) -> String {
    if tool_input.starts_with('[') && tool_input.ends_with(']') {
        return tool_input.to_string();
    }
    let cleaned = tool_input.replace("\"\"\"", "\"");
    if serde_json::from_str::<serde_json::Value>(&cleaned).is_ok() {
        cleaned
    } else {
        tool_input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_final_answer() {
        let text = "Thought: I know the answer\nFinal Answer: {\"confidence\": 0.9}";
        match parse(text).unwrap() {
            ParseResult::Finish(finish) => {
                assert_eq!(finish.output, "{\"confidence\": 0.9}");
                assert_eq!(finish.thought, "Thought: I know the answer");
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_action_with_json_input() {
        let text = "Thought: search\nAction: search\nAction Input: {\"search_query\": \"pods\"}\nObservation: made up";
        match parse(text).unwrap() {
            ParseResult::Action(action) => {
                assert_eq!(action.tool, "search");
                assert_eq!(action.tool_input, "{\"search_query\": \"pods\"}");
            }
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_needs_help() {
        let text = "Thought: out of my depth\nNeeds Help: requires a financial analyst";
        assert_eq!(
            parse(text).unwrap(),
            ParseResult::NeedsHelp("requires a financial analyst".to_string())
        );
    }

    #[test]
    fn test_parse_missing_action() {
        assert!(parse("Thought: I need to do something").is_err());
        let err = parse("Thought: x\nAction: search").unwrap_err();
        assert!(err.error.contains("Action Input"));
    }

    #[test]
    fn test_trailing_backticks_removed() {
        let text = "Final Answer: {\"a\": 1}\n```";
        match parse(text).unwrap() {
            ParseResult::Finish(finish) => assert_eq!(finish.output, "{\"a\": 1}"),
            other => panic!("expected finish, got {other:?}"),
        }
    }
}
