//! Transform step executors: map, filter, aggregate, template.
//!
//! All four operate on resolved values only; none of them touch the context
//! directly. The filter predicate shares the comparison operator table with
//! condition steps.

use serde_json::{Map, Value, json};
use trellis_types::document::{AggregateFn, TransformSpec};
use trellis_types::error::EngineError;

use crate::condition::{compare, to_number, to_text};
use crate::context::ExecutionContext;
use crate::resolver::InputResolver;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Apply a transform and return its result value.
///
/// `resolved_inputs` is the step's materialized input map; `template`
/// substitutes its keys, the collection transforms resolve their own `items`
/// input.
pub fn apply_transform(
    spec: &TransformSpec,
    resolver: &InputResolver<'_>,
    ctx: &ExecutionContext,
    resolved_inputs: &Map<String, Value>,
) -> Result<Value, EngineError> {
    match spec {
        TransformSpec::Map { items, mapping } => {
            let items = resolve_items(items, resolver, ctx)?;
            let projected: Vec<Value> = items
                .iter()
                .map(|item| {
                    let mut out = Map::new();
                    for (target, source_path) in mapping {
                        let value = path_value(item, source_path).cloned().unwrap_or(Value::Null);
                        out.insert(target.clone(), value);
                    }
                    Value::Object(out)
                })
                .collect();
            Ok(Value::Array(projected))
        }
        TransformSpec::Filter {
            items,
            field,
            operator,
            value,
        } => {
            let items = resolve_items(items, resolver, ctx)?;
            let kept: Vec<Value> = items
                .into_iter()
                .filter(|item| {
                    let left = path_value(item, field).cloned().unwrap_or(Value::Null);
                    compare(&left, operator, value)
                })
                .collect();
            Ok(Value::Array(kept))
        }
        TransformSpec::Aggregate {
            items,
            function,
            field,
        } => {
            let items = resolve_items(items, resolver, ctx)?;
            aggregate(&items, *function, field.as_deref())
        }
        TransformSpec::Template { template } => Ok(Value::String(render_template(
            template,
            resolved_inputs,
        ))),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_items(
    input: &trellis_types::document::Input,
    resolver: &InputResolver<'_>,
    ctx: &ExecutionContext,
) -> Result<Vec<Value>, EngineError> {
    match resolver.resolve(input, ctx)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(EngineError::Validation(format!(
            "transform items must resolve to an array, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk a dotted path into a value. Empty path returns the value itself.
pub fn path_value<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn aggregate(
    items: &[Value],
    function: AggregateFn,
    field: Option<&str>,
) -> Result<Value, EngineError> {
    if function == AggregateFn::Count {
        return Ok(json!(items.len()));
    }

    let path = field.ok_or_else(|| {
        EngineError::Validation(format!(
            "aggregate '{}' requires a field path",
            serde_json::to_string(&function).unwrap_or_default()
        ))
    })?;

    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| path_value(item, path).and_then(to_number))
        .collect();

    let result = match function {
        AggregateFn::Count => json!(items.len()),
        AggregateFn::Sum => json!(numbers.iter().sum::<f64>()),
        AggregateFn::Average => {
            if numbers.is_empty() {
                Value::Null
            } else {
                json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFn::Max => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.max(n))))
            .map(|n| json!(n))
            .unwrap_or(Value::Null),
        AggregateFn::Min => numbers
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.min(n))))
            .map(|n| json!(n))
            .unwrap_or(Value::Null),
    };
    Ok(result)
}

/// Substitute `${key}` tokens from the resolved input map.
///
/// Unknown keys are left as-is.
fn render_template(template: &str, inputs: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match inputs.get(key) {
                    Some(value) => out.push_str(&to_text(value)),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use trellis_types::document::{DocumentMetadata, Input, WorkflowDocument};
    use uuid::Uuid;

    use crate::expression::ExpressionEvaluator;

    fn empty_document() -> WorkflowDocument {
        WorkflowDocument {
            version: "1".to_string(),
            metadata: DocumentMetadata {
                name: "test".to_string(),
                tags: vec![],
                created: Utc::now(),
                modified: Utc::now(),
            },
            config: Default::default(),
            resources: vec![],
            triggers: vec![],
            flows: vec![],
            error_handlers: vec![],
        }
    }

    fn context_with_items() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        ctx.set_step_result(
            "gather",
            json!([
                {"name": "a", "score": 4, "meta": {"active": true}},
                {"name": "b", "score": 9, "meta": {"active": false}},
                {"name": "c", "score": 7, "meta": {"active": true}},
            ]),
        )
        .unwrap();
        ctx
    }

    fn items_input() -> Input {
        Input::Step {
            id: "gather".to_string(),
        }
    }

    fn run(spec: &TransformSpec, ctx: &ExecutionContext, inputs: &Map<String, Value>) -> Value {
        let doc = empty_document();
        let eval = ExpressionEvaluator::new();
        let resolver = InputResolver::new(&doc, &eval);
        apply_transform(spec, &resolver, ctx, inputs).unwrap()
    }

    // -----------------------------------------------------------------------
    // Map
    // -----------------------------------------------------------------------

    #[test]
    fn map_projects_paths() {
        let ctx = context_with_items();
        let spec = TransformSpec::Map {
            items: items_input(),
            mapping: BTreeMap::from([
                ("label".to_string(), "name".to_string()),
                ("active".to_string(), "meta.active".to_string()),
            ]),
        };
        let result = run(&spec, &ctx, &Map::new());
        assert_eq!(
            result,
            json!([
                {"label": "a", "active": true},
                {"label": "b", "active": false},
                {"label": "c", "active": true},
            ])
        );
    }

    #[test]
    fn map_missing_path_yields_null() {
        let ctx = context_with_items();
        let spec = TransformSpec::Map {
            items: items_input(),
            mapping: BTreeMap::from([("missing".to_string(), "no.such.path".to_string())]),
        };
        let result = run(&spec, &ctx, &Map::new());
        assert_eq!(result[0]["missing"], Value::Null);
    }

    // -----------------------------------------------------------------------
    // Filter
    // -----------------------------------------------------------------------

    #[test]
    fn filter_evaluates_predicate() {
        let ctx = context_with_items();
        let spec = TransformSpec::Filter {
            items: items_input(),
            field: "score".to_string(),
            operator: "greater_than".to_string(),
            value: json!(5),
        };
        let result = run(&spec, &ctx, &Map::new());
        let names: Vec<&str> = result
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn filter_on_nested_field() {
        let ctx = context_with_items();
        let spec = TransformSpec::Filter {
            items: items_input(),
            field: "meta.active".to_string(),
            operator: "equals".to_string(),
            value: json!(true),
        };
        let result = run(&spec, &ctx, &Map::new());
        assert_eq!(result.as_array().unwrap().len(), 2);
    }

    #[test]
    fn filter_unknown_operator_drops_everything() {
        let ctx = context_with_items();
        let spec = TransformSpec::Filter {
            items: items_input(),
            field: "score".to_string(),
            operator: "roughly".to_string(),
            value: json!(5),
        };
        let result = run(&spec, &ctx, &Map::new());
        assert!(result.as_array().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Aggregate
    // -----------------------------------------------------------------------

    #[test]
    fn aggregate_functions() {
        let ctx = context_with_items();
        let agg = |function, field: Option<&str>| {
            run(
                &TransformSpec::Aggregate {
                    items: items_input(),
                    function,
                    field: field.map(String::from),
                },
                &ctx,
                &Map::new(),
            )
        };
        assert_eq!(agg(AggregateFn::Count, None), json!(3));
        assert_eq!(agg(AggregateFn::Sum, Some("score")), json!(20.0));
        assert_eq!(agg(AggregateFn::Max, Some("score")), json!(9.0));
        assert_eq!(agg(AggregateFn::Min, Some("score")), json!(4.0));
        let avg = agg(AggregateFn::Average, Some("score"));
        assert!((avg.as_f64().unwrap() - 20.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_empty_collection() {
        let mut ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        ctx.set_step_result("gather", json!([])).unwrap();
        let spec = TransformSpec::Aggregate {
            items: items_input(),
            function: AggregateFn::Max,
            field: Some("score".to_string()),
        };
        assert_eq!(run(&spec, &ctx, &Map::new()), Value::Null);
    }

    #[test]
    fn aggregate_without_field_is_error() {
        let ctx = context_with_items();
        let doc = empty_document();
        let eval = ExpressionEvaluator::new();
        let resolver = InputResolver::new(&doc, &eval);
        let spec = TransformSpec::Aggregate {
            items: items_input(),
            function: AggregateFn::Sum,
            field: None,
        };
        let err = apply_transform(&spec, &resolver, &ctx, &Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn non_array_items_is_error() {
        let mut ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        ctx.set_step_result("gather", json!("not-a-list")).unwrap();
        let doc = empty_document();
        let eval = ExpressionEvaluator::new();
        let resolver = InputResolver::new(&doc, &eval);
        let spec = TransformSpec::Filter {
            items: items_input(),
            field: "x".to_string(),
            operator: "equals".to_string(),
            value: json!(1),
        };
        let err = apply_transform(&spec, &resolver, &ctx, &Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    // -----------------------------------------------------------------------
    // Template
    // -----------------------------------------------------------------------

    #[test]
    fn template_substitutes_inputs() {
        let ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        let inputs = Map::from_iter([
            ("user".to_string(), json!("jdoe")),
            ("count".to_string(), json!(3)),
        ]);
        let spec = TransformSpec::Template {
            template: "Hi ${user}, you have ${count} tasks".to_string(),
        };
        assert_eq!(
            run(&spec, &ctx, &inputs),
            json!("Hi jdoe, you have 3 tasks")
        );
    }

    #[test]
    fn template_unknown_key_left_as_is() {
        let ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        let spec = TransformSpec::Template {
            template: "value: ${missing}".to_string(),
        };
        assert_eq!(run(&spec, &ctx, &Map::new()), json!("value: ${missing}"));
    }

    #[test]
    fn template_unterminated_token_kept() {
        let ctx = ExecutionContext::new("main".to_string(), Uuid::now_v7(), None);
        let spec = TransformSpec::Template {
            template: "broken ${token".to_string(),
        };
        assert_eq!(run(&spec, &ctx, &Map::new()), json!("broken ${token"));
    }

    // -----------------------------------------------------------------------
    // path_value
    // -----------------------------------------------------------------------

    #[test]
    fn path_value_walks_arrays_and_objects() {
        let value = json!({"a": {"b": [10, {"c": 20}]}});
        assert_eq!(path_value(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(path_value(&value, "a.b.1.c"), Some(&json!(20)));
        assert_eq!(path_value(&value, "a.z"), None);
        assert_eq!(path_value(&value, ""), Some(&value));
    }
}
