//! Agent roles.

pub mod core;

pub use self::core::{Agent, MANAGER_ROLE};
