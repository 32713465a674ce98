//! Restricted expression evaluator.
//!
//! Wraps `jexl_eval::Evaluator` with a fixed transform allowlist. This is the
//! engine's entire expression surface: arithmetic, comparisons, field paths,
//! and the transforms registered here -- interpreted, never executed as host
//! code. Payloads are always passed as context objects, NEVER interpolated
//! into expression strings.

use serde_json::{Value, json};
use trellis_types::error::EngineError;

use crate::context::ExecutionContext;

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Expression evaluator with the standard transform allowlist registered.
///
/// Used for:
/// - `Input::Expression` resolution
/// - `condition` steps of type `expression` and `custom`
/// - trigger `when` filters
/// - flow output evaluation
///
/// The underlying `jexl_eval::Evaluator` boxes its transforms without
/// `Send`/`Sync` bounds, so it is built fresh inside each (synchronous)
/// evaluation and never crosses an await point. This handle itself is
/// freely shareable.
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    /// Create an evaluator handle.
    pub fn new() -> Self {
        Self
    }

    /// Build the jexl evaluator with the fixed transform allowlist.
    fn build() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let sep = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                Ok(json!(s.split(sep).collect::<Vec<_>>()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let needle = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(needle)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("number", |args: &[Value]| {
                let n = match args.first() {
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                    Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
                    Some(Value::Bool(true)) => 1.0,
                    _ => 0.0,
                };
                Ok(json!(n))
            })
            .with_transform("abs", |args: &[Value]| {
                let n = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(n.abs()))
            })
            .with_transform("round", |args: &[Value]| {
                let n = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(n.round()))
            })
            .with_transform("not", |args: &[Value]| {
                let truthy = args.first().map(Self::is_truthy).unwrap_or(false);
                Ok(json!(!truthy))
            })
    }

    /// Evaluate an expression to its raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, EngineError> {
        if !context.is_object() {
            return Err(EngineError::Expression(
                "expression context must be a JSON object".to_string(),
            ));
        }
        Self::build()
            .eval_in_context(expression, context)
            .map_err(|e| EngineError::Expression(format!("'{expression}': {e}")))
    }

    /// Evaluate an expression and coerce the result to boolean.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, EngineError> {
        Ok(Self::is_truthy(&self.evaluate_value(expression, context)?))
    }

    /// Evaluate against a run context's read-only expression surface.
    pub fn evaluate_in_context(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError> {
        self.evaluate_value(expression, &ctx.to_expression_context())
    }

    /// JavaScript-like truthiness.
    pub fn is_truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
