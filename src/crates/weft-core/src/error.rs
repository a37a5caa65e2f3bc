//! Error types for workflow construction and execution
//!
//! One enum covers the whole taxonomy the engine distinguishes:
//!
//! - [`WorkflowError::Validation`] - a schema mismatch; always fatal to the
//!   node it occurred at and never retried.
//! - [`WorkflowError::Step`] - a step body reported failure; retried per the
//!   retry policy, then fatal to the smallest enclosing composite.
//! - [`WorkflowError::Aborted`] - an observed cancellation signal; a
//!   distinguished failure reason, not retried.
//! - [`WorkflowError::Snapshot`] - persistence failed; always fatal, the
//!   engine never proceeds on state it could not save or load.
//! - [`WorkflowError::Conflict`] - a second writer raced for one run id.
//! - `UnknownStep` / `UnknownRun` / `Configuration` / `DepthExceeded` -
//!   programmer errors, surfaced as `Err` from the API rather than folded
//!   into a failed run result.
//!
//! Suspension is deliberately absent here: a step that suspends returns
//! [`StepOutcome::Suspended`](crate::step::StepOutcome), a normal alternate
//! exit, never an error.

use thiserror::Error;

/// Convenience result type using [`WorkflowError`]
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors raised while building, validating, or executing workflows
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Data did not satisfy a declared schema; fatal to the node, never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A step body reported failure
    #[error("Step '{step}' failed: {error}")]
    Step {
        /// Id of the failing step
        step: String,
        /// Error message from the step body
        error: String,
    },

    /// The run's cancellation signal was observed
    #[error("Run aborted by cancellation signal")]
    Aborted,

    /// Snapshot persistence failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] weft_snapshot::SnapshotError),

    /// A concurrent start/resume raced for the same run id
    #[error("Run conflict: {0}")]
    Conflict(String),

    /// Resume named a step that is not suspended (or does not exist)
    #[error("No suspended step matching '{0}'")]
    UnknownStep(String),

    /// Resume named a run the store has no snapshot for
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    /// The graph is structurally invalid (detected at commit time)
    #[error("Workflow configuration error: {0}")]
    Configuration(String),

    /// Workflows-as-steps nested beyond the configured bound
    #[error("Workflow nesting exceeded the configured depth of {max_depth}")]
    DepthExceeded {
        /// The configured bound that was exceeded
        max_depth: usize,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Create a step failure with context
    pub fn step(step: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            error: error.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
