//! Language-generation backends.

pub mod base_llm;
pub mod providers;

pub use base_llm::{BaseLLM, LLMError};
pub use providers::openai::OpenAICompletion;
