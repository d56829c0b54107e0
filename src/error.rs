//! Error types for opsctl operations.
//!
//! This module defines [`OpsctlError`], the primary error type used throughout
//! the application, and a [`Result`] type alias for convenience.
//!
//! # Error Handling Strategy
//!
//! - Use `OpsctlError` for domain-specific errors that need distinct handling
//! - Use `anyhow::Error` (via `OpsctlError::Other`) for unexpected errors
//! - Workflow validation collects every problem before reporting, so users
//!   can fix a document in one pass

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for opsctl operations.
#[derive(Debug, Error)]
pub enum OpsctlError {
    /// Workflow file not found at the given location.
    #[error("Workflow not found: {path}")]
    WorkflowNotFound { path: PathBuf },

    /// Failed to parse a workflow document.
    #[error("Failed to parse workflow: {message}")]
    WorkflowParseError { message: String },

    /// Workflow document failed validation.
    #[error("Invalid workflow: {message}")]
    WorkflowInvalid { message: String },

    /// Step dependency cycle detected.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// A step depends on a name that is not declared.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Template rendering failed.
    #[error("Template error: {message}")]
    RenderError { message: String },

    /// A dispatched command could not be executed.
    #[error("Dispatch failed for '{command}': {message}")]
    DispatchError { command: String, message: String },

    /// Step execution failed in a way that is not a plain non-zero exit.
    #[error("Step '{step}' failed: {message}")]
    StepExecutionError { step: String, message: String },

    /// The rate limiter or a dispatch exceeded its deadline.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Execution was cancelled.
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic wrapped error for anyhow interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for opsctl operations.
pub type Result<T> = std::result::Result<T, OpsctlError>;

/// A single validation problem found in a workflow document.
///
/// Validation collects all errors rather than stopping at the first one.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Rule identifier, e.g. `unknown-dependency`.
    pub rule: String,
    /// Human-readable error message.
    pub message: String,
    /// Step name if the error is step-specific.
    pub step: Option<String>,
}

impl ValidationError {
    /// Create a validation error not tied to a particular step.
    pub fn new(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            step: None,
        }
    }

    /// Create a validation error attributed to a step.
    pub fn for_step(rule: &str, step: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            step: Some(step.to_string()),
        }
    }
}

/// Fold collected validation errors into a single [`OpsctlError`].
///
/// Returns `Ok(())` when the list is empty.
pub fn into_result(errors: Vec<ValidationError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        let messages: Vec<_> = errors.iter().map(|e| e.message.clone()).collect();
        Err(OpsctlError::WorkflowInvalid {
            message: messages.join("; "),
        })
    }
}
