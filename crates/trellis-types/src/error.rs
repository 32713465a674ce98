//! Engine error taxonomy.
//!
//! Errors are structured (stable code, message, contextual detail) rather
//! than opaque strings so that collaborators can build user-facing messages.
//! [`ErrorDetail`] is the serializable projection stored in run outcomes and
//! step states.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed document: missing field, unknown reference shape, bad value.
    /// Fatal; rejected before execution starts.
    #[error("validation error: {0}")]
    Validation(String),

    /// The dependency graph contains a cycle through the named step/node.
    /// Fatal; no steps execute.
    #[error("circular dependency involving '{id}'")]
    CircularDependency { id: String },

    /// A reference points at a step, resource, or trigger that does not exist.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// An action step named a component the library does not know.
    #[error("component not found: '{component_id}'")]
    ComponentNotFound { component_id: String },

    /// A step failed after exhausting its retry policy.
    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        message: String,
    },

    /// The circuit breaker for this step is open; execution was not attempted.
    #[error("circuit open for '{key}'")]
    CircuitOpen { key: String },

    /// Expression parse or evaluation failure.
    #[error("expression error: {0}")]
    Expression(String),

    /// The flow's trigger filter rejected the initial input.
    #[error("trigger rejected input: {0}")]
    Trigger(String),

    /// A single step attempt exceeded its timeout.
    #[error("step '{step_id}' timed out")]
    StepTimeout { step_id: String },

    /// The whole run exceeded the document timeout.
    #[error("run timed out")]
    RunTimeout,

    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// Document parse failure (JSON/YAML).
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem I/O failure while loading or saving a document.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::UnknownReference(_) => "unknown_reference",
            EngineError::ComponentNotFound { .. } => "component_not_found",
            EngineError::StepExecution { .. } => "step_execution",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::Expression(_) => "expression",
            EngineError::Trigger(_) => "trigger_rejected",
            EngineError::StepTimeout { .. } => "step_timeout",
            EngineError::RunTimeout => "run_timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::Parse(_) => "parse",
            EngineError::Io(_) => "io",
        }
    }

    /// Serializable projection for run outcomes and step states.
    pub fn to_detail(&self) -> ErrorDetail {
        let (step_id, attempts) = match self {
            EngineError::StepExecution {
                step_id, attempts, ..
            } => (Some(step_id.clone()), Some(*attempts)),
            EngineError::StepTimeout { step_id } => (Some(step_id.clone()), None),
            _ => (None, None),
        };
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
            step_id,
            attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorDetail
// ---------------------------------------------------------------------------

/// Structured, serializable error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code (see [`EngineError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Step the error is attributed to, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Attempt count at failure, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
