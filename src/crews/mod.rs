//! Crew sub-modules: session configuration, output and the
//! target-acquisition pipeline definition.

pub mod crew_config;
pub mod crew_output;
pub mod target_acquisition;

pub use crew_config::{CrewConfig, MemoryConfig, PartialResultPolicy};
pub use crew_output::{CrewOutput, ExhaustedTask, FailureReport, SessionStatus};
