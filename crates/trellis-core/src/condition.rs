//! Condition evaluation: the operator table and the four condition types.
//!
//! Comparison semantics are deliberately tolerant: an unknown operator or an
//! unparseable regex evaluates to `false` with a warning rather than failing
//! the step. Numeric operators coerce both sides to numbers; substring
//! operators coerce both sides to strings.

use serde_json::Value;
use trellis_types::document::ConditionSpec;
use trellis_types::error::EngineError;

use crate::context::ExecutionContext;
use crate::expression::ExpressionEvaluator;
use crate::resolver::InputResolver;

// ---------------------------------------------------------------------------
// Operator table
// ---------------------------------------------------------------------------

/// Compare two values with a named operator.
///
/// Supported operators: `equals`, `not_equals`, `greater_than`, `less_than`,
/// `contains`, `starts_with`, `ends_with`, `regex`. Anything else returns
/// `false` (documented tolerant-failure behavior).
pub fn compare(left: &Value, operator: &str, right: &Value) -> bool {
    match operator {
        "equals" => values_equal(left, right),
        "not_equals" => !values_equal(left, right),
        "greater_than" => match (to_number(left), to_number(right)) {
            (Some(l), Some(r)) => l > r,
            _ => false,
        },
        "less_than" => match (to_number(left), to_number(right)) {
            (Some(l), Some(r)) => l < r,
            _ => false,
        },
        "contains" => to_text(left).contains(&to_text(right)),
        "starts_with" => to_text(left).starts_with(&to_text(right)),
        "ends_with" => to_text(left).ends_with(&to_text(right)),
        "regex" => match regex::Regex::new(&to_text(right)) {
            Ok(pattern) => pattern.is_match(&to_text(left)),
            Err(e) => {
                tracing::warn!(pattern = %to_text(right), error = %e, "invalid regex pattern");
                false
            }
        },
        other => {
            tracing::warn!(operator = other, "unknown comparison operator");
            false
        }
    }
}

/// Equality with cross-type numeric tolerance (`1` equals `1.0`).
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (to_number(left), to_number(right)) {
        return l == r;
    }
    left == right
}

/// Numeric coercion: numbers pass through, numeric strings parse, booleans
/// become 0/1. Null, arrays, and objects have no numeric value.
pub(crate) fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// String coercion for substring and regex operators.
pub(crate) fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate a structured condition against the run context.
pub fn evaluate_condition(
    spec: &ConditionSpec,
    resolver: &InputResolver<'_>,
    evaluator: &ExpressionEvaluator,
    ctx: &ExecutionContext,
) -> Result<bool, EngineError> {
    match spec {
        ConditionSpec::Expression { expression } => {
            evaluator.evaluate_bool(expression, &ctx.to_expression_context())
        }
        ConditionSpec::Comparison {
            left,
            operator,
            right,
        } => {
            let left = resolver.resolve(left, ctx)?;
            let right = resolver.resolve(right, ctx)?;
            Ok(compare(&left, operator, &right))
        }
        ConditionSpec::Existence { value } => {
            let resolved = resolver.resolve(value, ctx)?;
            Ok(!resolved.is_null())
        }
        ConditionSpec::Custom { predicate, args } => {
            let mut surface = ctx.to_expression_context();
            if let Some(map) = surface.as_object_mut() {
                map.insert("args".to_string(), args.clone());
            }
            evaluator.evaluate_bool(predicate, &surface)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
