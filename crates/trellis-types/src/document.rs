//! Workflow document model for Trellis.
//!
//! Defines the canonical intermediate representation for workflows: the
//! immutable [`WorkflowDocument`] owned by the caller, its [`Flow`]s, and the
//! polymorphic [`Step`] with kind-specific configuration payloads. The
//! document is read-only to the engine; all mutable run state lives in the
//! execution context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Document (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow document.
///
/// JSON and YAML files both deserialize into this struct; the canvas
/// compiler produces it directly. It is the single source of truth for a
/// workflow's shape and is never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// Document format version (e.g. "1").
    pub version: String,
    /// Document metadata.
    pub metadata: DocumentMetadata,
    /// Document-wide execution defaults. Step-level settings override these.
    #[serde(default)]
    pub config: DocumentConfig,
    /// Static resource definitions resolvable via `Input::Resource`.
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
    /// Trigger definitions referenced by flows.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Executable flows.
    pub flows: Vec<Flow>,
    /// Document-level recovery steps run when a flow fails terminally.
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,
}

/// Descriptive metadata for a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Human-readable document name.
    pub name: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the document was created.
    pub created: DateTime<Utc>,
    /// When the document was last modified.
    pub modified: DateTime<Utc>,
}

/// Document-wide execution defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentConfig {
    /// Whole-run timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default retry policy for steps that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Maximum concurrent branches inside `parallel` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
}

/// A static configuration blob addressable by id from step inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource id, unique within the document.
    pub id: String,
    /// Resource kind (e.g. "database", "queue"). Opaque to the engine.
    pub kind: String,
    /// Arbitrary configuration payload.
    #[serde(default)]
    pub config: Value,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// A trigger definition referenced by `Flow::trigger_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Trigger id, unique within the document.
    pub id: String,
    /// Trigger kind and configuration.
    #[serde(flatten)]
    pub kind: TriggerKind,
}

/// How a flow can be triggered.
///
/// The engine only validates the trigger reference and applies the `when`
/// filter to the run's initial input; actually firing triggers (cron jobs,
/// webhook listeners, event buses) is a collaborator concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Manually invoked via the embedding caller.
    Manual {},
    /// Incoming webhook.
    Webhook {
        /// Webhook endpoint path.
        path: String,
        /// Optional expression filtered against the trigger payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
    /// Time-based schedule.
    Schedule {
        /// Cron expression or schedule string. Opaque to the engine.
        schedule: String,
        /// Optional timezone name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
    /// Internal event bus trigger.
    Event {
        /// Event source identifier.
        source: String,
        /// Event type to match.
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
}

impl TriggerKind {
    /// The `when` filter expression, if this trigger kind carries one.
    pub fn when(&self) -> Option<&str> {
        match self {
            TriggerKind::Manual {} => None,
            TriggerKind::Webhook { when, .. }
            | TriggerKind::Schedule { when, .. }
            | TriggerKind::Event { when, .. } => when.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// One executable workflow: an ordered step collection plus variables and
/// named outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Flow id, unique within the document.
    pub id: String,
    /// Human-readable flow name.
    pub name: String,
    /// Reference into `WorkflowDocument::triggers`. None means manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    /// Ordered step definitions. Declaration order is the encounter order
    /// for the demand-driven scheduler.
    pub steps: Vec<Step>,
    /// Initial variable bindings, merged with the caller's input at run start.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Named output expressions evaluated after the flow completes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single unit of work with typed inputs/outputs and a kind-specific
/// executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id, unique within its flow.
    pub id: String,
    /// The kind of step. Must agree with the `config` payload variant.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Kind-specific configuration payload.
    pub config: StepSpec,
    /// Named inputs. A `step`-kind input is also a dependency edge.
    ///
    /// Ordered map so dependency traversal is deterministic.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Input>,
    /// Named write targets applied after the step completes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
    /// Steps activated after this step succeeds (or a condition holds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<String>,
    /// Steps activated after this step fails terminally (or a condition
    /// does not hold).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for this step. Falls back to the document default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// The kind of step in a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Loop,
    Parallel,
    Transform,
    Wait,
    Custom,
}

impl StepType {
    /// Lowercase name used in circuit-breaker keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Action => "action",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Parallel => "parallel",
            StepType::Transform => "transform",
            StepType::Wait => "wait",
            StepType::Custom => "custom",
        }
    }
}

/// Kind-specific step configuration payload.
///
/// Internally tagged by `type` to match the document structure:
/// ```yaml
/// config:
///   type: action
///   component_id: directory.lookup-user
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    /// Invoke a registered component from the component library.
    Action {
        /// Component id looked up in the injected library.
        component_id: String,
        /// Component-specific parameters, passed through unresolved.
        #[serde(default)]
        params: Value,
    },
    /// Evaluate a structured condition; the step result is the boolean.
    Condition { condition: ConditionSpec },
    /// Apply a data transform to resolved inputs.
    Transform { transform: TransformSpec },
    /// Suspend execution for a fixed duration.
    Wait { duration_ms: u64 },
    /// Bounded iteration over a collection input.
    ///
    /// Each iteration binds the current item to `bind` and runs the body
    /// steps sequentially; the step result is the array of per-iteration
    /// results (the last body step's result each time around).
    Loop {
        /// The collection to iterate. Must resolve to an array.
        over: Input,
        /// Variable name the current item is bound to.
        #[serde(default = "default_loop_bind")]
        bind: String,
        /// Steps executed once per item, in order.
        body: Vec<Step>,
        /// Hard cap on iterations regardless of collection length.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    /// Concurrent execution of independent sub-steps with a join barrier.
    Parallel {
        /// Sub-steps executed concurrently. Results are keyed by sub-step id.
        branches: Vec<Step>,
        /// Branch concurrency cap. Falls back to the document limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<u32>,
    },
    /// Externally supplied logic run through the sandbox capability.
    Custom {
        /// Source text handed to the injected `CustomStepRunner`.
        code: String,
        /// Optional language hint for the runner.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

fn default_loop_bind() -> String {
    "item".to_string()
}

impl StepSpec {
    /// The step type this payload belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepSpec::Action { .. } => StepType::Action,
            StepSpec::Condition { .. } => StepType::Condition,
            StepSpec::Transform { .. } => StepType::Transform,
            StepSpec::Wait { .. } => StepType::Wait,
            StepSpec::Loop { .. } => StepType::Loop,
            StepSpec::Parallel { .. } => StepType::Parallel,
            StepSpec::Custom { .. } => StepType::Custom,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// How a step input value is obtained at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Input {
    /// The embedded value, returned unchanged.
    Literal { value: Value },
    /// A context variable. Absent variables resolve to null, not an error.
    Variable { name: String },
    /// A static resource definition from the document.
    Resource { id: String },
    /// Another step's result. Implies a dependency edge on that step.
    Step { id: String },
    /// A restricted expression evaluated against the run context.
    Expression { expression: String },
}

/// Where a step's result is written after completion.
///
/// Only `Variable` is applied by the engine; the other kinds are recorded on
/// the step state as write targets for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
    /// Write into the context variables at a dotted path.
    Variable { path: String },
    /// Hand off to a resource writer (collaborator concern).
    Resource { id: String },
    /// Hand off to a file writer (collaborator concern).
    File { path: String },
    /// Hand off to a database writer (collaborator concern).
    Database { path: String },
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry configuration for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3). 1 means no retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff growth between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base backoff delay in milliseconds (default 1000).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay: `backoff_ms` between every attempt.
    #[default]
    Linear,
    /// Doubling delay: `backoff_ms * 2^(attempt - 1)`.
    Exponential,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.backoff {
            BackoffKind::Linear => self.backoff_ms.saturating_mul(attempt as u64),
            BackoffKind::Exponential => self
                .backoff_ms
                .saturating_mul(1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX)),
        };
        std::time::Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A structured condition evaluated by condition steps and filter transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    /// A restricted expression coerced to boolean.
    Expression { expression: String },
    /// Binary comparison over two resolved inputs.
    ///
    /// The operator is a free string so that unknown operators degrade to
    /// `false` rather than failing deserialization.
    Comparison {
        left: Input,
        operator: String,
        right: Input,
    },
    /// True iff the resolved value is non-null.
    Existence { value: Input },
    /// Caller-defined predicate expression with bound arguments.
    Custom {
        predicate: String,
        #[serde(default)]
        args: Value,
    },
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// A data transform applied by transform steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Per-item field rename / path projection.
    Map {
        /// The collection to project. Must resolve to an array.
        items: Input,
        /// Target field name -> dotted source path within each item.
        mapping: BTreeMap<String, String>,
    },
    /// Per-item boolean predicate using the condition operator table.
    Filter {
        items: Input,
        /// Dotted path into each item.
        field: String,
        /// Comparison operator (same table as condition steps).
        operator: String,
        /// Right-hand comparison value.
        value: Value,
    },
    /// Numeric aggregation over a field path.
    Aggregate {
        items: Input,
        function: AggregateFn,
        /// Dotted path into each item. Unused by `count`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// String interpolation substituting `${key}` tokens from the step's
    /// resolved inputs.
    Template { template: String },
}

/// Aggregation function for the `aggregate` transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Average,
    Max,
    Min,
}

// ---------------------------------------------------------------------------
// Error handlers
// ---------------------------------------------------------------------------

/// Document-level recovery steps run best-effort when a flow fails
/// terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandler {
    /// Handler id, unique within the document.
    pub id: String,
    /// Error codes this handler matches. Empty matches every code.
    #[serde(default)]
    pub error_codes: Vec<String>,
    /// Steps executed in order when the handler matches.
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a document exercising every step kind and input kind.
    fn sample_document() -> WorkflowDocument {
        WorkflowDocument {
            version: "1".to_string(),
            metadata: DocumentMetadata {
                name: "provision-account".to_string(),
                tags: vec!["onboarding".to_string()],
                created: Utc::now(),
                modified: Utc::now(),
            },
            config: DocumentConfig {
                timeout_secs: Some(600),
                retry: Some(RetryPolicy::default()),
                concurrency_limit: Some(4),
            },
            resources: vec![ResourceDefinition {
                id: "hr-db".to_string(),
                kind: "database".to_string(),
                config: json!({"host": "db.internal"}),
            }],
            triggers: vec![
                TriggerDefinition {
                    id: "manual".to_string(),
                    kind: TriggerKind::Manual {},
                },
                TriggerDefinition {
                    id: "new-hire".to_string(),
                    kind: TriggerKind::Event {
                        source: "hr".to_string(),
                        event_type: "hire_created".to_string(),
                        when: Some("trigger.department == 'engineering'".to_string()),
                    },
                },
            ],
            flows: vec![Flow {
                id: "main".to_string(),
                name: "Provision account".to_string(),
                trigger_id: Some("new-hire".to_string()),
                steps: vec![
                    Step {
                        id: "lookup".to_string(),
                        step_type: StepType::Action,
                        config: StepSpec::Action {
                            component_id: "directory.lookup-user".to_string(),
                            params: json!({"attributes": ["mail"]}),
                        },
                        inputs: BTreeMap::from([
                            (
                                "username".to_string(),
                                Input::Variable {
                                    name: "username".to_string(),
                                },
                            ),
                            (
                                "database".to_string(),
                                Input::Resource {
                                    id: "hr-db".to_string(),
                                },
                            ),
                        ]),
                        outputs: BTreeMap::from([(
                            "user".to_string(),
                            Output::Variable {
                                path: "user".to_string(),
                            },
                        )]),
                        on_success: vec![],
                        on_failure: vec![],
                        timeout_secs: Some(30),
                        retry: Some(RetryPolicy {
                            max_attempts: 2,
                            backoff: BackoffKind::Exponential,
                            backoff_ms: 200,
                        }),
                    },
                    Step {
                        id: "check-active".to_string(),
                        step_type: StepType::Condition,
                        config: StepSpec::Condition {
                            condition: ConditionSpec::Comparison {
                                left: Input::Step {
                                    id: "lookup".to_string(),
                                },
                                operator: "exists".to_string(),
                                right: Input::Literal { value: json!(null) },
                            },
                        },
                        inputs: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                        on_success: vec![],
                        on_failure: vec![],
                        timeout_secs: None,
                        retry: None,
                    },
                ],
                variables: BTreeMap::from([("region".to_string(), json!("eu-west"))]),
                outputs: BTreeMap::from([(
                    "active".to_string(),
                    "steps['check-active'].result".to_string(),
                )]),
            }],
            error_handlers: vec![ErrorHandler {
                id: "notify-ops".to_string(),
                error_codes: vec!["step_execution".to_string()],
                steps: vec![],
            }],
        }
    }

    // -----------------------------------------------------------------------
    // Roundtrips
    // -----------------------------------------------------------------------

    #[test]
    fn document_json_roundtrip() {
        let doc = sample_document();
        let text = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: WorkflowDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.metadata.name, doc.metadata.name);
        assert_eq!(parsed.flows.len(), 1);
        assert_eq!(parsed.flows[0].steps.len(), 2);
        assert_eq!(parsed.resources.len(), 1);
        assert_eq!(parsed.triggers.len(), 2);
    }

    #[test]
    fn document_yaml_roundtrip() {
        let doc = sample_document();
        let yaml = serde_yaml_ng::to_string(&doc).unwrap();
        assert!(yaml.contains("provision-account"));
        assert!(yaml.contains("type: action"));
        assert!(yaml.contains("kind: variable"));
        let parsed: WorkflowDocument = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed.flows[0].id, "main");
    }

    // -----------------------------------------------------------------------
    // Tagged unions
    // -----------------------------------------------------------------------

    #[test]
    fn input_kinds_serde() {
        let inputs = vec![
            Input::Literal { value: json!(42) },
            Input::Variable {
                name: "user".to_string(),
            },
            Input::Resource {
                id: "hr-db".to_string(),
            },
            Input::Step {
                id: "lookup".to_string(),
            },
            Input::Expression {
                expression: "variables.region".to_string(),
            },
        ];
        for input in inputs {
            let text = serde_json::to_string(&input).unwrap();
            assert!(text.contains("\"kind\":"));
            let parsed: Input = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, input);
        }
    }

    #[test]
    fn output_kinds_serde() {
        let outputs = vec![
            Output::Variable {
                path: "user.mail".to_string(),
            },
            Output::Resource {
                id: "hr-db".to_string(),
            },
            Output::File {
                path: "/tmp/out.json".to_string(),
            },
            Output::Database {
                path: "audit.events".to_string(),
            },
        ];
        for output in outputs {
            let text = serde_json::to_string(&output).unwrap();
            let parsed: Output = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, output);
        }
    }

    #[test]
    fn step_spec_tag_matches_step_type() {
        let spec = StepSpec::Wait { duration_ms: 250 };
        assert_eq!(spec.step_type(), StepType::Wait);
        let text = serde_json::to_string(&spec).unwrap();
        assert!(text.contains("\"type\":\"wait\""));

        let spec = StepSpec::Custom {
            code: "inputs.a + inputs.b".to_string(),
            language: None,
        };
        assert_eq!(spec.step_type(), StepType::Custom);
    }

    #[test]
    fn loop_spec_default_bind() {
        let yaml = r#"
type: loop
over:
  kind: variable
  name: users
body: []
"#;
        let spec: StepSpec = serde_yaml_ng::from_str(yaml).unwrap();
        match spec {
            StepSpec::Loop { bind, .. } => assert_eq!(bind, "item"),
            other => panic!("expected loop spec, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Retry policy
    // -----------------------------------------------------------------------

    #[test]
    fn retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, BackoffKind::Linear);
        assert_eq!(policy.backoff_ms, 1000);
    }

    #[test]
    fn linear_backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Linear,
            backoff_ms: 100,
        };
        assert_eq!(policy.delay_after(1).as_millis(), 100);
        assert_eq!(policy.delay_after(2).as_millis(), 200);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: BackoffKind::Exponential,
            backoff_ms: 100,
        };
        assert_eq!(policy.delay_after(1).as_millis(), 100);
        assert_eq!(policy.delay_after(2).as_millis(), 200);
        assert_eq!(policy.delay_after(3).as_millis(), 400);
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    #[test]
    fn trigger_when_accessor() {
        let manual = TriggerKind::Manual {};
        assert!(manual.when().is_none());

        let event = TriggerKind::Event {
            source: "hr".to_string(),
            event_type: "hire_created".to_string(),
            when: Some("trigger.active".to_string()),
        };
        assert_eq!(event.when(), Some("trigger.active"));
    }

    #[test]
    fn trigger_definition_flattens_kind() {
        let text = r#"{"id":"t1","type":"webhook","path":"/hook"}"#;
        let parsed: TriggerDefinition = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.id, "t1");
        assert!(matches!(parsed.kind, TriggerKind::Webhook { .. }));
    }

    // -----------------------------------------------------------------------
    // Transforms and conditions
    // -----------------------------------------------------------------------

    #[test]
    fn transform_spec_serde() {
        let spec = TransformSpec::Aggregate {
            items: Input::Step {
                id: "gather".to_string(),
            },
            function: AggregateFn::Average,
            field: Some("score".to_string()),
        };
        let text = serde_json::to_string(&spec).unwrap();
        assert!(text.contains("\"op\":\"aggregate\""));
        assert!(text.contains("\"function\":\"average\""));
        let parsed: TransformSpec = serde_json::from_str(&text).unwrap();
        assert!(matches!(parsed, TransformSpec::Aggregate { .. }));
    }

    #[test]
    fn condition_spec_unknown_operator_still_parses() {
        let text = r#"
{"type":"comparison",
 "left":{"kind":"literal","value":1},
 "operator":"approximately_equals",
 "right":{"kind":"literal","value":1}}
"#;
        let parsed: ConditionSpec = serde_json::from_str(text).unwrap();
        match parsed {
            ConditionSpec::Comparison { operator, .. } => {
                assert_eq!(operator, "approximately_equals");
            }
            other => panic!("expected comparison, got {other:?}"),
        }
    }
}
