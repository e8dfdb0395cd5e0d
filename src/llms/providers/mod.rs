//! Concrete generation backends.

pub mod openai;
