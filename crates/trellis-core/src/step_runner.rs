//! Leaf step dispatch.
//!
//! `StepRunner` executes the step kinds that do not orchestrate other steps:
//! action, condition, transform, wait, and custom. The composite kinds
//! (loop, parallel) are driven by the scheduler, which recurses back through
//! the same retry machinery for each sub-step.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use trellis_types::document::{Step, StepSpec};
use trellis_types::error::EngineError;

use crate::auth::AuthManager;
use crate::component::{ComponentCall, ComponentLibrary};
use crate::condition::evaluate_condition;
use crate::context::ExecutionContext;
use crate::custom::CustomStepRunner;
use crate::expression::ExpressionEvaluator;
use crate::resolver::InputResolver;
use crate::transform::apply_transform;

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes leaf workflow steps by dispatching on the config payload.
pub struct StepRunner {
    components: Arc<dyn ComponentLibrary>,
    auth: Arc<dyn AuthManager>,
    custom: Arc<dyn CustomStepRunner>,
}

impl StepRunner {
    pub fn new(
        components: Arc<dyn ComponentLibrary>,
        auth: Arc<dyn AuthManager>,
        custom: Arc<dyn CustomStepRunner>,
    ) -> Self {
        Self {
            components,
            auth,
            custom,
        }
    }

    /// Execute one attempt of a leaf step and return its result value.
    pub async fn execute(
        &self,
        step: &Step,
        resolved_inputs: &Map<String, Value>,
        resolver: &InputResolver<'_>,
        evaluator: &ExpressionEvaluator,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        match &step.config {
            StepSpec::Action {
                component_id,
                params,
            } => {
                let component = self.components.get(component_id).ok_or_else(|| {
                    EngineError::ComponentNotFound {
                        component_id: component_id.clone(),
                    }
                })?;
                tracing::debug!(
                    step_id = step.id.as_str(),
                    component_id = component_id.as_str(),
                    "dispatching action step"
                );
                component
                    .execute(ComponentCall {
                        inputs: resolved_inputs,
                        config: params,
                        auth: self.auth.as_ref(),
                    })
                    .await
                    .map_err(|e| EngineError::StepExecution {
                        step_id: step.id.clone(),
                        attempts: 0,
                        message: e.to_string(),
                    })
            }
            StepSpec::Condition { condition } => {
                let held = evaluate_condition(condition, resolver, evaluator, ctx)?;
                tracing::debug!(step_id = step.id.as_str(), held, "condition evaluated");
                Ok(json!(held))
            }
            StepSpec::Transform { transform } => {
                apply_transform(transform, resolver, ctx, resolved_inputs)
            }
            StepSpec::Wait { duration_ms } => {
                tracing::debug!(step_id = step.id.as_str(), duration_ms, "wait step");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(*duration_ms)) => {
                        Ok(json!({ "waited_ms": duration_ms }))
                    }
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
            StepSpec::Custom { code, language } => {
                tracing::debug!(
                    step_id = step.id.as_str(),
                    language = language.as_deref().unwrap_or("expression"),
                    "custom step"
                );
                self.custom
                    .run(code, resolved_inputs)
                    .await
                    .map_err(|e| EngineError::StepExecution {
                        step_id: step.id.clone(),
                        attempts: 0,
                        message: e.to_string(),
                    })
            }
            StepSpec::Loop { .. } | StepSpec::Parallel { .. } => {
                // The scheduler orchestrates composite kinds before reaching
                // the leaf runner.
                Err(EngineError::Validation(format!(
                    "composite step '{}' reached the leaf runner",
                    step.id
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
