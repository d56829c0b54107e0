//! Command implementations.

pub mod workflow;
