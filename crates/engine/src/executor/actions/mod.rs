//! Built-in step actions.

pub mod artifact;
pub mod cache;
pub mod shell;
