//! Input resolution.
//!
//! Materializes a step's declared inputs against the run context and the
//! (static) document. Resolution is pure lookup plus restricted expression
//! evaluation; it never mutates the context.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use trellis_types::document::{Input, WorkflowDocument};
use trellis_types::error::EngineError;

use crate::context::ExecutionContext;
use crate::expression::ExpressionEvaluator;

// ---------------------------------------------------------------------------
// InputResolver
// ---------------------------------------------------------------------------

/// Resolves step inputs against a document and a run context.
pub struct InputResolver<'a> {
    document: &'a WorkflowDocument,
    evaluator: &'a ExpressionEvaluator,
}

impl<'a> InputResolver<'a> {
    pub fn new(document: &'a WorkflowDocument, evaluator: &'a ExpressionEvaluator) -> Self {
        Self {
            document,
            evaluator,
        }
    }

    /// Resolve a single input to its value.
    ///
    /// | kind | resolution |
    /// |---|---|
    /// | literal | embedded value, unchanged |
    /// | variable | context variable; absent resolves to null, not an error |
    /// | step | completed step result; absent is an error |
    /// | resource | document resource definition by id |
    /// | expression | restricted evaluation against the context surface |
    pub fn resolve(&self, input: &Input, ctx: &ExecutionContext) -> Result<Value, EngineError> {
        match input {
            Input::Literal { value } => Ok(value.clone()),
            Input::Variable { name } => {
                Ok(ctx.variables.get(name).cloned().unwrap_or(Value::Null))
            }
            Input::Step { id } => ctx.step_result(id).cloned().ok_or_else(|| {
                // Scheduler ordering guarantees presence in a valid flow;
                // reaching this means the reference targets a step that has
                // not run (e.g. a failure handler reading the failed step).
                EngineError::Validation(format!("result of step '{id}' is not available"))
            }),
            Input::Resource { id } => {
                let resource = self
                    .document
                    .resources
                    .iter()
                    .find(|r| r.id == *id)
                    .ok_or_else(|| EngineError::UnknownReference(format!("resource '{id}'")))?;
                Ok(json!({
                    "id": resource.id,
                    "kind": resource.kind,
                    "config": resource.config,
                }))
            }
            Input::Expression { expression } => {
                self.evaluator.evaluate_in_context(expression, ctx)
            }
        }
    }

    /// Resolve a step's full input map in declaration (key) order.
    pub fn resolve_all(
        &self,
        inputs: &BTreeMap<String, Input>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut resolved = Map::new();
        for (name, input) in inputs {
            resolved.insert(name.clone(), self.resolve(input, ctx)?);
        }
        Ok(resolved)
    }
}

/// Collect the step ids a step's inputs depend on, in declaration order.
pub fn step_dependencies(inputs: &BTreeMap<String, Input>) -> Vec<&str> {
    let mut deps = Vec::new();
    for input in inputs.values() {
        if let Input::Step { id } = input {
            if !deps.contains(&id.as_str()) {
                deps.push(id.as_str());
            }
        }
    }
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
