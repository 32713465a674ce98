//! Demand-driven workflow scheduler.
//!
//! `Scheduler::run` is the engine's execution entry point. Steps execute
//! depth-first in declaration order: each step first ensures its `step`-input
//! dependencies have run, then executes under the retry policy and circuit
//! breaker. Steps named in `on_success`/`on_failure` lists are edge-gated --
//! excluded from the primary walk and activated only when their edge fires.
//! A condition step that evaluates false activates its failure edges without
//! being treated as an error.
//!
//! Composite step kinds are orchestrated here: `loop` iterates its body over
//! a collection, `parallel` runs branches concurrently behind a semaphore
//! and merges their writes at the join barrier so no interleaving is
//! observable. All context writes happen on the scheduler's own task; each
//! step's output write is atomic.
//!
//! Collaborators (component library, auth manager, custom-step sandbox) are
//! injected per scheduler. There is no process-wide state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use trellis_types::document::{
    Flow, Input, Output, RetryPolicy, Step, StepSpec, StepType, WorkflowDocument,
};
use trellis_types::error::EngineError;
use trellis_types::run::{RunOutcome, RunStatus, StepState, StepStatus};
use uuid::Uuid;

use crate::auth::AuthManager;
use crate::component::ComponentLibrary;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::custom::{CustomStepRunner, ExpressionStepRunner};
use crate::expression::ExpressionEvaluator;
use crate::resolver::InputResolver;
use crate::retry::{CircuitBreaker, execute_with_policy};
use crate::step_runner::StepRunner;
use crate::validate::{input_step_refs, validate_document};

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Workflow execution engine with injected collaborators.
pub struct Scheduler {
    components: Arc<dyn ComponentLibrary>,
    auth: Arc<dyn AuthManager>,
    custom: Arc<dyn CustomStepRunner>,
    evaluator: ExpressionEvaluator,
    breaker: CircuitBreaker,
    config: EngineConfig,
}

impl Scheduler {
    /// Create a scheduler with default configuration and the built-in
    /// expression sandbox for custom steps.
    pub fn new(components: Arc<dyn ComponentLibrary>, auth: Arc<dyn AuthManager>) -> Self {
        let config = EngineConfig::default();
        Self {
            components,
            auth,
            custom: Arc::new(ExpressionStepRunner::new(config.custom_step_timeout())),
            evaluator: ExpressionEvaluator::new(),
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_recovery_timeout(),
            ),
            config,
        }
    }

    /// Replace the engine configuration (rebuilds the circuit breaker).
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout(),
        );
        self.custom = Arc::new(ExpressionStepRunner::new(config.custom_step_timeout()));
        self.config = config;
        self
    }

    /// Replace the custom-step sandbox.
    pub fn with_custom_runner(mut self, runner: Arc<dyn CustomStepRunner>) -> Self {
        self.custom = runner;
        self
    }

    // -----------------------------------------------------------------------
    // Run entry point
    // -----------------------------------------------------------------------

    /// Execute a flow to completion.
    ///
    /// Pre-flight failures (validation, cycles, unknown flow, trigger
    /// rejection) return `Err` and execute nothing. Runtime failures return
    /// `Ok` with `status: Failed`, the terminal error, and partial step
    /// states for diagnostics.
    pub async fn run(
        &self,
        document: &WorkflowDocument,
        flow_id: &str,
        initial_input: Map<String, Value>,
    ) -> Result<RunOutcome, EngineError> {
        self.run_with_cancellation(document, flow_id, initial_input, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), with a caller-owned cancellation token.
    ///
    /// Cancelling the token aborts unstarted steps, in-flight backoff
    /// sleeps, and waits promptly. A step already dispatched to an external
    /// component is best-effort cancelled: the component call itself may run
    /// to completion.
    pub async fn run_with_cancellation(
        &self,
        document: &WorkflowDocument,
        flow_id: &str,
        initial_input: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        validate_document(document)?;

        let flow = document
            .flows
            .iter()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| EngineError::UnknownReference(format!("flow '{flow_id}'")))?;

        self.check_trigger(document, flow, &initial_input)?;

        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        tracing::info!(
            run_id = %run_id,
            flow_id = flow.id.as_str(),
            steps = flow.steps.len(),
            "starting run"
        );

        let mut ctx = ExecutionContext::new(
            flow.id.clone(),
            run_id,
            Some(Value::Object(initial_input.clone())),
        );
        for (name, value) in &flow.variables {
            ctx.variables.insert(name.clone(), value.clone());
        }
        for (name, value) in &initial_input {
            // Caller input wins over flow defaults.
            ctx.variables.insert(name.clone(), value.clone());
        }

        let mut state = RunState::new(flow);

        let run_timeout = document
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_run_timeout());

        let walk = async {
            for step in &flow.steps {
                if state.gated.contains(step.id.as_str()) {
                    continue;
                }
                self.ensure_step(document, flow, &step.id, &mut ctx, &mut state, &cancel)
                    .await?;
            }
            let mut outputs = BTreeMap::new();
            for (name, expression) in &flow.outputs {
                outputs.insert(
                    name.clone(),
                    self.evaluator.evaluate_in_context(expression, &ctx)?,
                );
            }
            Ok::<BTreeMap<String, Value>, EngineError>(outputs)
        };

        let walk_result = match tokio::time::timeout(run_timeout, walk).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::RunTimeout),
        };

        let (status, outputs, error) = match walk_result {
            Ok(outputs) => {
                // Edge-gated steps that were never activated.
                for step_state in state.states.values_mut() {
                    if step_state.status == StepStatus::Pending {
                        step_state.status = StepStatus::Skipped;
                    }
                }
                (RunStatus::Completed, outputs, None)
            }
            Err(EngineError::Cancelled) => {
                tracing::info!(run_id = %run_id, "run cancelled");
                (
                    RunStatus::Cancelled,
                    BTreeMap::new(),
                    Some(EngineError::Cancelled.to_detail()),
                )
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "run failed");
                self.run_error_handlers(document, &err, &mut ctx, &mut state, &cancel)
                    .await;
                (RunStatus::Failed, BTreeMap::new(), Some(err.to_detail()))
            }
        };

        tracing::info!(run_id = %run_id, status = ?status, "run finished");
        Ok(RunOutcome {
            run_id,
            flow_id: flow.id.clone(),
            status,
            outputs,
            step_states: state.states,
            error,
            started_at,
            completed_at: Utc::now(),
        })
    }

    // -----------------------------------------------------------------------
    // Trigger filter
    // -----------------------------------------------------------------------

    fn check_trigger(
        &self,
        document: &WorkflowDocument,
        flow: &Flow,
        initial_input: &Map<String, Value>,
    ) -> Result<(), EngineError> {
        let Some(trigger_id) = &flow.trigger_id else {
            return Ok(());
        };
        let trigger = document
            .triggers
            .iter()
            .find(|t| t.id == *trigger_id)
            .ok_or_else(|| EngineError::UnknownReference(format!("trigger '{trigger_id}'")))?;

        if let Some(when) = trigger.kind.when() {
            let surface = json!({ "trigger": initial_input });
            let accepted = self
                .evaluator
                .evaluate_bool(when, &surface)
                .map_err(|e| EngineError::Trigger(e.to_string()))?;
            if !accepted {
                return Err(EngineError::Trigger(format!(
                    "filter '{when}' rejected the input"
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Demand-driven walk
    // -----------------------------------------------------------------------

    /// Execute a top-level step (and, recursively, anything it depends on).
    fn ensure_step<'a>(
        &'a self,
        document: &'a WorkflowDocument,
        flow: &'a Flow,
        step_id: &'a str,
        ctx: &'a mut ExecutionContext,
        state: &'a mut RunState,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            if let Some(existing) = state.states.get(step_id) {
                if existing.status != StepStatus::Pending {
                    return Ok(());
                }
            }
            let step = flow
                .steps
                .iter()
                .find(|s| s.id == step_id)
                .ok_or_else(|| EngineError::UnknownReference(format!("step '{step_id}'")))?;

            // The in-progress set is distinct from completed state: hitting
            // an in-progress step again is a cycle. Validation already
            // rejected cyclic documents, so this is a defensive invariant.
            if !state.in_progress.insert(step_id.to_string()) {
                return Err(EngineError::CircularDependency {
                    id: step_id.to_string(),
                });
            }

            for dep in input_step_refs(step) {
                if dep != step.id && flow.steps.iter().any(|s| s.id == dep) {
                    self.ensure_step(document, flow, dep, &mut *ctx, &mut *state, cancel)
                        .await?;
                }
            }

            if cancel.is_cancelled() {
                state.in_progress.remove(step_id);
                return Err(EngineError::Cancelled);
            }

            {
                let entry = state
                    .states
                    .entry(step_id.to_string())
                    .or_insert_with(StepState::pending);
                entry.status = StepStatus::Running;
                entry.started_at = Some(Utc::now());
            }
            tracing::debug!(
                step_id,
                step_type = step.step_type.as_str(),
                "executing step"
            );

            let result = {
                let ctx_shared: &ExecutionContext = &*ctx;
                self.run_with_policy(document, step, ctx_shared, cancel).await
            };
            state.in_progress.remove(step_id);

            match result {
                Ok((outcome, attempts)) => {
                    let write_targets = commit(ctx, step, &outcome)?;
                    let entry = state
                        .states
                        .entry(step_id.to_string())
                        .or_insert_with(StepState::pending);
                    entry.status = StepStatus::Completed;
                    entry.attempts = attempts;
                    entry.result = Some(outcome.value.clone());
                    entry.write_targets = write_targets;
                    entry.completed_at = Some(Utc::now());

                    // A condition that does not hold routes to its failure
                    // edges (IF/ELSE sugar); everything else follows success
                    // edges.
                    let condition_failed = step.step_type == StepType::Condition
                        && outcome.value == Value::Bool(false);
                    let targets = if condition_failed {
                        &step.on_failure
                    } else {
                        &step.on_success
                    };
                    for target in targets {
                        self.ensure_step(document, flow, target, &mut *ctx, &mut *state, cancel)
                            .await?;
                    }
                    Ok(())
                }
                Err(EngineError::Cancelled) => {
                    let entry = state
                        .states
                        .entry(step_id.to_string())
                        .or_insert_with(StepState::pending);
                    entry.status = StepStatus::Failed;
                    entry.error = Some(EngineError::Cancelled.to_detail());
                    Err(EngineError::Cancelled)
                }
                Err(err) => {
                    let attempts = match &err {
                        EngineError::StepExecution { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    let detail = err.to_detail();
                    {
                        let entry = state
                            .states
                            .entry(step_id.to_string())
                            .or_insert_with(StepState::pending);
                        entry.status = StepStatus::Failed;
                        entry.attempts = attempts;
                        entry.error = Some(detail.clone());
                        entry.completed_at = Some(Utc::now());
                    }
                    ctx.record_error(detail);

                    if step.on_failure.is_empty() {
                        Err(err)
                    } else {
                        tracing::info!(
                            step_id,
                            targets = ?step.on_failure,
                            "step failed terminally, activating failure edges"
                        );
                        for target in &step.on_failure {
                            self.ensure_step(
                                document, flow, target, &mut *ctx, &mut *state, cancel,
                            )
                            .await?;
                        }
                        // Failure edges completed: the error is recovered.
                        Ok(())
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Step execution under policy
    // -----------------------------------------------------------------------

    /// One step, wrapped in retry policy, per-attempt timeout, and breaker.
    async fn run_with_policy(
        &self,
        document: &WorkflowDocument,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<(AttemptOutcome, u32), EngineError> {
        let policy = step
            .retry
            .or(document.config.retry)
            .unwrap_or(SINGLE_ATTEMPT);
        let attempt_timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_step_timeout());
        let breaker_key = format!("{}:{}", step.id, step.step_type.as_str());

        execute_with_policy(
            &step.id,
            &breaker_key,
            &policy,
            attempt_timeout,
            &self.breaker,
            cancel,
            |_attempt| self.attempt_once(document, step, ctx, cancel),
        )
        .await
    }

    /// A single attempt of one step. Never mutates the context; all writes
    /// are returned in the outcome and committed by the caller.
    async fn attempt_once(
        &self,
        document: &WorkflowDocument,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, EngineError> {
        match &step.config {
            StepSpec::Loop {
                over,
                bind,
                body,
                max_iterations,
            } => {
                let value = self
                    .run_loop(document, over, bind, body, *max_iterations, ctx, cancel)
                    .await?;
                Ok(AttemptOutcome {
                    value,
                    commits: Vec::new(),
                })
            }
            StepSpec::Parallel {
                branches,
                max_concurrent,
            } => {
                self.run_parallel(document, branches, *max_concurrent, ctx, cancel)
                    .await
            }
            _ => {
                let resolver = InputResolver::new(document, &self.evaluator);
                let resolved = resolver.resolve_all(&step.inputs, ctx)?;
                let runner = StepRunner::new(
                    Arc::clone(&self.components),
                    Arc::clone(&self.auth),
                    Arc::clone(&self.custom),
                );
                let value = runner
                    .execute(step, &resolved, &resolver, &self.evaluator, ctx, cancel)
                    .await?;
                Ok(AttemptOutcome {
                    value,
                    commits: Vec::new(),
                })
            }
        }
    }

    /// Execute a nested sub-step (loop body, parallel branch, error handler)
    /// against a locally owned context.
    fn run_nested<'a>(
        &'a self,
        document: &'a WorkflowDocument,
        step: &'a Step,
        ctx: &'a mut ExecutionContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        Box::pin(async move {
            let (outcome, _attempts) = {
                let ctx_shared: &ExecutionContext = &*ctx;
                self.run_with_policy(document, step, ctx_shared, cancel).await?
            };
            commit(ctx, step, &outcome)?;
            Ok(outcome.value)
        })
    }

    // -----------------------------------------------------------------------
    // Composite kinds
    // -----------------------------------------------------------------------

    /// Bounded iteration over a collection input.
    ///
    /// Each iteration runs the body steps sequentially against a context
    /// clone with the current item bound; the per-iteration result is the
    /// last body step's value. Iteration-local writes are discarded.
    async fn run_loop(
        &self,
        document: &WorkflowDocument,
        over: &Input,
        bind: &str,
        body: &[Step],
        max_iterations: Option<u32>,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let resolver = InputResolver::new(document, &self.evaluator);
        let collection = match resolver.resolve(over, ctx)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(EngineError::Validation(format!(
                    "loop collection must be an array, got {}",
                    other
                )));
            }
        };

        let cap = max_iterations.map(|m| m as usize).unwrap_or(usize::MAX);
        if collection.len() > cap {
            tracing::warn!(
                items = collection.len(),
                cap,
                "loop collection exceeds max_iterations, truncating"
            );
        }

        let mut results = Vec::new();
        for item in collection.into_iter().take(cap) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let mut iteration_ctx = ctx.clone();
            iteration_ctx.variables.insert(bind.to_string(), item);

            let mut last = Value::Null;
            for sub in body {
                last = self
                    .run_nested(document, sub, &mut iteration_ctx, cancel)
                    .await?;
            }
            results.push(last);
        }
        Ok(Value::Array(results))
    }

    /// Concurrent branch execution with a join barrier.
    ///
    /// Branches run against clones of the context snapshot, bounded by a
    /// semaphore; their results and variable writes are merged in branch
    /// order after the barrier, so writes never interleave.
    async fn run_parallel(
        &self,
        document: &WorkflowDocument,
        branches: &[Step],
        max_concurrent: Option<u32>,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, EngineError> {
        let limit = max_concurrent
            .or(document.config.concurrency_limit)
            .unwrap_or(self.config.max_parallel_branches)
            .max(1) as usize;
        let semaphore = Semaphore::new(limit);

        let branch_futures = branches.iter().map(|sub| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::Cancelled)?;
                let mut branch_ctx = ctx.clone();
                self.run_nested(document, sub, &mut branch_ctx, cancel).await
            }
        });
        let results = futures_util::future::join_all(branch_futures).await;

        let mut merged = Map::new();
        let mut commits = Vec::new();
        for (sub, result) in branches.iter().zip(results) {
            let value = result?;
            for output in sub.outputs.values() {
                if let Output::Variable { path } = output {
                    commits.push(Commit::Variable {
                        path: path.clone(),
                        value: value.clone(),
                    });
                }
            }
            commits.push(Commit::StepResult {
                id: sub.id.clone(),
                value: value.clone(),
            });
            merged.insert(sub.id.clone(), value);
        }
        Ok(AttemptOutcome {
            value: Value::Object(merged),
            commits,
        })
    }

    // -----------------------------------------------------------------------
    // Error handlers
    // -----------------------------------------------------------------------

    /// Run document-level error handlers matching the terminal error.
    /// Best-effort: handler failures are recorded, never propagated.
    async fn run_error_handlers(
        &self,
        document: &WorkflowDocument,
        error: &EngineError,
        ctx: &mut ExecutionContext,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) {
        let code = error.code();
        for handler in &document.error_handlers {
            let matches =
                handler.error_codes.is_empty() || handler.error_codes.iter().any(|c| c == code);
            if !matches {
                continue;
            }
            tracing::info!(handler_id = handler.id.as_str(), code, "running error handler");
            for step in &handler.steps {
                match self.run_nested(document, step, &mut *ctx, cancel).await {
                    Ok(value) => {
                        state.states.insert(
                            step.id.clone(),
                            StepState {
                                status: StepStatus::Completed,
                                attempts: 1,
                                result: Some(value),
                                error: None,
                                write_targets: Vec::new(),
                                started_at: None,
                                completed_at: Some(Utc::now()),
                            },
                        );
                    }
                    Err(handler_err) => {
                        tracing::warn!(
                            handler_id = handler.id.as_str(),
                            step_id = step.id.as_str(),
                            error = %handler_err,
                            "error handler step failed"
                        );
                        ctx.record_error(handler_err.to_detail());
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Retry policy for steps that declare none anywhere: one attempt.
const SINGLE_ATTEMPT: RetryPolicy = RetryPolicy {
    max_attempts: 1,
    backoff: trellis_types::document::BackoffKind::Linear,
    backoff_ms: 0,
};

/// The result of one (successful) step attempt, plus deferred context writes.
struct AttemptOutcome {
    value: Value,
    commits: Vec<Commit>,
}

/// A context write deferred until the scheduler commits a step.
enum Commit {
    StepResult { id: String, value: Value },
    Variable { path: String, value: Value },
}

/// Apply a completed step's writes to the context. Returns the non-variable
/// output bindings for the step state record.
fn commit(
    ctx: &mut ExecutionContext,
    step: &Step,
    outcome: &AttemptOutcome,
) -> Result<Vec<Output>, EngineError> {
    ctx.set_step_result(&step.id, outcome.value.clone())?;
    let mut write_targets = Vec::new();
    for output in step.outputs.values() {
        match output {
            Output::Variable { path } => ctx.set_variable_path(path, outcome.value.clone()),
            other => write_targets.push(other.clone()),
        }
    }
    for pending in &outcome.commits {
        match pending {
            Commit::StepResult { id, value } => ctx.set_step_result(id, value.clone())?,
            Commit::Variable { path, value } => ctx.set_variable_path(path, value.clone()),
        }
    }
    Ok(write_targets)
}

/// Mutable bookkeeping for one run.
struct RunState {
    states: BTreeMap<String, StepState>,
    in_progress: HashSet<String>,
    /// Steps named in success/failure edge lists; excluded from the primary
    /// walk.
    gated: HashSet<String>,
}

impl RunState {
    fn new(flow: &Flow) -> Self {
        let mut gated = HashSet::new();
        for step in &flow.steps {
            for target in step.on_success.iter().chain(step.on_failure.iter()) {
                gated.insert(target.clone());
            }
        }
        let states = flow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::pending()))
            .collect();
        Self {
            states,
            in_progress: HashSet::new(),
            gated,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
