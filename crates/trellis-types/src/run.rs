//! Execution-tracking types returned to callers.
//!
//! The engine does not persist anything; a [`RunOutcome`] is handed back to
//! the embedding caller, which may store it through its own persistence
//! layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::document::Output;
use crate::error::ErrorDetail;

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Terminal state of a single flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// UUIDv7 run id.
    pub run_id: Uuid,
    /// Flow that was executed.
    pub flow_id: String,
    /// Final run status.
    pub status: RunStatus,
    /// Evaluated flow outputs. Empty when the run did not complete.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Per-step execution records, including partial state on failure.
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,
    /// Terminal error, when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub completed_at: DateTime<Utc>,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// Execution record for a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    /// Current step status.
    pub status: StepStatus,
    /// Attempts made (1-based; 0 if never dispatched).
    pub attempts: u32,
    /// Step result value, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error detail, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Non-variable output bindings recorded for downstream consumers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_targets: Vec<Output>,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    /// A fresh pending state.
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            write_targets: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_roundtrip() {
        let outcome = RunOutcome {
            run_id: Uuid::now_v7(),
            flow_id: "main".to_string(),
            status: RunStatus::Failed,
            outputs: BTreeMap::new(),
            step_states: BTreeMap::from([(
                "lookup".to_string(),
                StepState {
                    status: StepStatus::Failed,
                    attempts: 3,
                    result: None,
                    error: Some(ErrorDetail {
                        code: "step_execution".to_string(),
                        message: "boom".to_string(),
                        step_id: Some("lookup".to_string()),
                        attempts: Some(3),
                    }),
                    write_targets: vec![Output::File {
                        path: "/tmp/out".to_string(),
                    }],
                    started_at: Some(Utc::now()),
                    completed_at: Some(Utc::now()),
                },
            )]),
            error: Some(ErrorDetail {
                code: "step_execution".to_string(),
                message: "boom".to_string(),
                step_id: Some("lookup".to_string()),
                attempts: Some(3),
            }),
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };

        let text = serde_json::to_string(&outcome).unwrap();
        let parsed: RunOutcome = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.status, RunStatus::Failed);
        assert_eq!(parsed.step_states["lookup"].attempts, 3);
    }

    #[test]
    fn pending_state_is_empty() {
        let state = StepState::pending();
        assert_eq!(state.status, StepStatus::Pending);
        assert_eq!(state.attempts, 0);
        assert!(state.result.is_none());
        assert!(state.error.is_none());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Skipped).unwrap(),
            "\"skipped\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let v = json!("completed");
        let parsed: RunStatus = serde_json::from_value(v).unwrap();
        assert_eq!(parsed, RunStatus::Completed);
    }
}
