//! Step execution: the action trait, the registry of built-ins, and
//! outcome types.

pub mod actions;
pub mod outcome;
pub mod registry;

pub use outcome::StepOutcome;
pub use registry::{ActionRegistry, StepAction, StepContext, Stores};
