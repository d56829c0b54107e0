//! opsctl - unified DevOps CLI with a declarative workflow engine.
//!
//! opsctl composes operations across external services (cloud APIs,
//! Kubernetes, observability, ticketing, chat) behind one CLI. Its core is a
//! workflow engine that executes declarative YAML documents: steps with
//! dependencies, templated parameters, parallel blocks, and failure policies.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`dispatch`] - Contracts with the command dispatcher and shell runner
//! - [`error`] - Error types and result aliases
//! - [`runner`] - Engine facade, executors, step runner, rate limiter
//! - [`ui`] - Progress output and summary rendering
//! - [`workflow`] - Document model, templating, dependency graph, results
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use opsctl::dispatch::{SubprocessDispatcher, SystemShell};
//! use opsctl::runner::{EngineOptions, WorkflowEngine};
//! use opsctl::workflow::Workflow;
//!
//! # async fn example() -> opsctl::Result<()> {
//! let workflow = Workflow::load_str(
//!     "name: hello\nsteps:\n  - name: greet\n    command: \"!echo hi\"\n",
//! )?;
//!
//! let engine = WorkflowEngine::new(
//!     Arc::new(SubprocessDispatcher::current()?),
//!     Arc::new(SystemShell::new()),
//! );
//! let result = engine.run(&workflow, &EngineOptions::default()).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod dispatch;
pub mod error;
pub mod runner;
pub mod ui;
pub mod workflow;

pub use error::{OpsctlError, Result};
