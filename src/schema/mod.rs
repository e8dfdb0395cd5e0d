//! Output schemas and the registry that enforces them.
//!
//! Every task declares the shape of its result. Raw agent output is
//! validated here, with best-effort repair of near-misses, before it becomes
//! an [`Artifact`](crate::tasks::task_output::Artifact).

pub mod converter;
pub mod registry;
pub mod types;

pub use registry::{SchemaRegistry, ValidationOutcome};
pub use types::{EntityExtraction, FieldSpec, FieldType, OutputSchema};
