//! Shared utilities.

pub mod errors;
pub mod paths;
pub mod printer;
pub mod string_utils;
