//! Custom-step sandbox capability.
//!
//! `custom` steps carry externally supplied logic. The engine never runs that
//! logic with host privileges; it hands the source text to an injected
//! [`CustomStepRunner`]. The built-in [`ExpressionStepRunner`] interprets the
//! code as a restricted expression over the step's inputs, on a blocking
//! thread, under a deadline. Subprocess or WASM sandboxes plug in through
//! the same trait.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};

use crate::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by custom-step execution.
#[derive(Debug, thiserror::Error)]
pub enum CustomStepError {
    /// The code failed to parse or evaluate.
    #[error("evaluation failed: {0}")]
    EvalFailed(String),

    /// The runner's deadline elapsed.
    #[error("custom step exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    /// This runner refuses to execute custom code.
    #[error("custom steps are disabled: {0}")]
    Disabled(String),
}

// ---------------------------------------------------------------------------
// CustomStepRunner trait
// ---------------------------------------------------------------------------

/// Sandbox boundary for `custom` steps.
///
/// Returns a boxed future so the scheduler can hold `Arc<dyn CustomStepRunner>`.
pub trait CustomStepRunner: Send + Sync {
    /// Run the supplied code against the resolved input map.
    fn run<'a>(
        &'a self,
        code: &'a str,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, CustomStepError>>;
}

// ---------------------------------------------------------------------------
// ExpressionStepRunner
// ---------------------------------------------------------------------------

/// Built-in runner: the code is a restricted expression over `inputs`.
///
/// The expression is interpreted -- it has no access to the filesystem,
/// network, or process state, and the evaluation is bounded by `deadline`.
/// CPU spent inside a single expression is not preemptible; the deadline
/// detaches the caller but the blocking thread runs the evaluation to
/// completion.
pub struct ExpressionStepRunner {
    deadline: Duration,
}

impl ExpressionStepRunner {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl Default for ExpressionStepRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl CustomStepRunner for ExpressionStepRunner {
    fn run<'a>(
        &'a self,
        code: &'a str,
        inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, CustomStepError>> {
        let deadline = self.deadline;
        let code = code.to_string();
        let context = json!({ "inputs": inputs });

        Box::pin(async move {
            let handle = tokio::task::spawn_blocking(move || {
                ExpressionEvaluator::new()
                    .evaluate_value(&code, &context)
                    .map_err(|e| CustomStepError::EvalFailed(e.to_string()))
            });

            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(CustomStepError::EvalFailed(join_err.to_string())),
                Err(_) => Err(CustomStepError::DeadlineExceeded(deadline)),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// DenyAllRunner
// ---------------------------------------------------------------------------

/// Runner that rejects every custom step. For embeddings that do not allow
/// caller-supplied logic at all.
pub struct DenyAllRunner;

impl CustomStepRunner for DenyAllRunner {
    fn run<'a>(
        &'a self,
        _code: &'a str,
        _inputs: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, CustomStepError>> {
        Box::pin(async {
            Err(CustomStepError::Disabled(
                "this engine was built without a custom-step sandbox".to_string(),
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
