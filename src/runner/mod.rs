//! Workflow execution: the engine facade, executors, and their gates.
//!
//! - [`engine`] - entry point and sequential execution
//! - [`parallel`] - bounded-concurrency block and DAG execution
//! - [`step`] - single-step dispatch with timeout and retry
//! - [`rate_limit`] - token-bucket pacing for step dispatch

pub mod engine;
pub mod parallel;
pub mod rate_limit;
pub mod step;

pub use engine::{EngineOptions, WorkflowEngine};
pub use parallel::ParallelExecutor;
pub use rate_limit::RateLimiter;
pub use step::StepRunner;
