//! Per-run execution context.
//!
//! [`ExecutionContext`] is the mutable state that flows through a run:
//! variables (seeded from the flow definition and the caller's input), step
//! results, and the accumulated error list. It is created at run start,
//! mutated only by the scheduler, and discarded (or persisted by a
//! collaborator) at run end. Size limits keep a single runaway step from
//! growing the context without bound.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use trellis_types::error::{EngineError, ErrorDetail};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step result (1 MiB).
pub const MAX_STEP_RESULT_SIZE: usize = 1_048_576;

/// Maximum total serialized size of all context data (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable per-run state: variables, step results, and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Named variables, written by `Output::Variable` bindings.
    pub variables: BTreeMap<String, Value>,
    /// Completed step results keyed by step id.
    pub step_results: BTreeMap<String, Value>,
    /// Errors tolerated during the run (recovered failures, handler notes).
    pub errors: Vec<ErrorDetail>,
    /// The initial input the run was triggered with.
    pub trigger_payload: Option<Value>,
    /// Flow being executed.
    pub flow_id: String,
    /// Run id.
    pub run_id: Uuid,
}

impl ExecutionContext {
    /// Create a fresh context for a run.
    pub fn new(flow_id: String, run_id: Uuid, trigger_payload: Option<Value>) -> Self {
        Self {
            variables: BTreeMap::new(),
            step_results: BTreeMap::new(),
            errors: Vec::new(),
            trigger_payload,
            flow_id,
            run_id,
        }
    }

    /// Store a completed step's result.
    ///
    /// Results over [`MAX_STEP_RESULT_SIZE`] are replaced with a truncation
    /// marker; exceeding [`MAX_CONTEXT_SIZE`] in total is an error.
    pub fn set_step_result(&mut self, step_id: &str, result: Value) -> Result<(), EngineError> {
        let serialized = serde_json::to_string(&result)
            .map_err(|e| EngineError::Validation(format!("unserializable step result: {e}")))?;

        if serialized.len() > MAX_STEP_RESULT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized.len(),
                max = MAX_STEP_RESULT_SIZE,
                "step result exceeds size limit, truncating"
            );
            self.step_results.insert(
                step_id.to_string(),
                json!({
                    "_truncated": true,
                    "_original_size": serialized.len(),
                }),
            );
        } else {
            self.step_results.insert(step_id.to_string(), result);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(EngineError::Validation(format!(
                "total context size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
            )));
        }
        Ok(())
    }

    /// The result of a completed step, if present.
    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id)
    }

    /// Set a variable at a dotted path, creating intermediate objects.
    ///
    /// `"user.mail"` writes `variables["user"]["mail"]`; a bare name writes
    /// the variable directly. Writing through a non-object replaces it.
    pub fn set_variable_path(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return;
        };
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            self.variables.insert(first.to_string(), value);
            return;
        }

        let slot = self
            .variables
            .entry(first.to_string())
            .or_insert_with(|| json!({}));
        let mut current = slot;
        for (i, segment) in rest.iter().enumerate() {
            if !current.is_object() {
                *current = json!({});
            }
            let Some(map) = current.as_object_mut() else {
                return;
            };
            if i == rest.len() - 1 {
                map.insert(segment.to_string(), value);
                return;
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| json!({}));
        }
    }

    /// Record a tolerated (recovered) error.
    pub fn record_error(&mut self, detail: ErrorDetail) {
        self.errors.push(detail);
    }

    /// Total serialized size of variables, step results, and trigger payload.
    pub fn total_size(&self) -> usize {
        let json_len = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
        let results: usize = self.step_results.values().map(json_len).sum();
        let variables: usize = self.variables.values().map(json_len).sum();
        let trigger = self.trigger_payload.as_ref().map(json_len).unwrap_or(0);
        results + variables + trigger
    }

    /// The read-only JSON surface expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "steps": { "<step_id>": { "result": <value> }, ... },
    ///   "variables": { ... },
    ///   "trigger": <payload or {}>,
    ///   "flow": { "id": "...", "run_id": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (id, result) in &self.step_results {
            steps.insert(id.clone(), json!({ "result": result }));
        }
        json!({
            "steps": steps,
            "variables": self.variables,
            "trigger": self.trigger_payload.clone().unwrap_or(json!({})),
            "flow": {
                "id": self.flow_id,
                "run_id": self.run_id.to_string(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            "main".to_string(),
            Uuid::now_v7(),
            Some(json!({"department": "engineering"})),
        )
    }

    #[test]
    fn set_and_get_step_result() {
        let mut ctx = context();
        ctx.set_step_result("lookup", json!({"mail": "j@example.com"}))
            .unwrap();
        assert_eq!(
            ctx.step_result("lookup").unwrap()["mail"],
            json!("j@example.com")
        );
        assert!(ctx.step_result("missing").is_none());
    }

    #[test]
    fn oversized_result_is_truncated() {
        let mut ctx = context();
        let big = "x".repeat(MAX_STEP_RESULT_SIZE + 10);
        ctx.set_step_result("big", json!(big)).unwrap();
        let stored = ctx.step_result("big").unwrap();
        assert_eq!(stored["_truncated"], json!(true));
    }

    #[test]
    fn variable_path_writes_nested() {
        let mut ctx = context();
        ctx.set_variable_path("user.mail", json!("j@example.com"));
        ctx.set_variable_path("user.name", json!("J. Doe"));
        ctx.set_variable_path("region", json!("eu-west"));

        assert_eq!(ctx.variables["user"]["mail"], json!("j@example.com"));
        assert_eq!(ctx.variables["user"]["name"], json!("J. Doe"));
        assert_eq!(ctx.variables["region"], json!("eu-west"));
    }

    #[test]
    fn variable_path_replaces_non_object() {
        let mut ctx = context();
        ctx.set_variable_path("slot", json!(5));
        ctx.set_variable_path("slot.inner", json!(true));
        assert_eq!(ctx.variables["slot"]["inner"], json!(true));
    }

    #[test]
    fn expression_context_shape() {
        let mut ctx = context();
        ctx.set_step_result("lookup", json!("found")).unwrap();
        ctx.variables.insert("region".to_string(), json!("eu-west"));

        let surface = ctx.to_expression_context();
        assert_eq!(surface["steps"]["lookup"]["result"], json!("found"));
        assert_eq!(surface["variables"]["region"], json!("eu-west"));
        assert_eq!(surface["trigger"]["department"], json!("engineering"));
        assert_eq!(surface["flow"]["id"], json!("main"));
    }

    #[test]
    fn errors_accumulate() {
        let mut ctx = context();
        ctx.record_error(ErrorDetail {
            code: "step_execution".to_string(),
            message: "recovered".to_string(),
            step_id: Some("a".to_string()),
            attempts: Some(2),
        });
        assert_eq!(ctx.errors.len(), 1);
    }
}
