//! Workflow definition model and parser.

pub mod parser;
pub mod types;

pub use parser::{parse_definition, parse_definition_file, validate_definition};
pub use types::{
    Job, Matrix, NeedsSpec, PermissionLevel, Step, Strategy, TriggerSpec, WorkflowDefinition,
};
