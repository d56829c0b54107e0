//! Workflow document model, templating, and execution structure.
//!
//! This module holds everything the engine needs to understand a workflow
//! before running it:
//!
//! - [`schema`] - the validated document model
//! - [`template`] - `{{ expr | filter }}` rendering over the [`Scope`]
//! - [`graph`] - the `depends_on` dependency graph
//! - [`results`] - step, block, and workflow result records
//! - [`observer`] - the progress event stream

pub mod graph;
pub mod observer;
pub mod results;
pub mod schema;
pub mod template;

pub use graph::{DependencyGraph, DependencyGraphBuilder};
pub use observer::{NullObserver, ProgressEvent, ProgressObserver, TracingObserver};
pub use results::{
    format_duration_seconds, BlockResult, EntryResult, StepResult, StepStatus, WorkflowResult,
};
pub use schema::{
    BlockFailurePolicy, ParallelBlock, ParallelConfig, Step, StepFailurePolicy, StepOrBlock,
    Workflow, DEFAULT_STEP_TIMEOUT_SECS,
};
pub use template::{parse, render, render_bool, Scope, Template};
