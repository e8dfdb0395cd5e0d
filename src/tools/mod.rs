//! Tools agents may call from their ReAct loop.

pub mod base_tool;
pub mod push_tool;
pub mod serper_dev_tool;

pub use base_tool::{BaseTool, EnvVar, ToolError};
pub use push_tool::PushNotificationTool;
pub use serper_dev_tool::{SearchResult, SearchTool, SerperDevTool};
