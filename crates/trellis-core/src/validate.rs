//! Document validation, parsing, and filesystem operations.
//!
//! Every structural constraint is checked here, before execution: malformed
//! documents are rejected with `Validation`/`UnknownReference` errors and
//! cyclic flows with `CircularDependency`. A document that passes
//! [`validate_document`] will not produce dangling-reference failures on the
//! scheduler's primary path.

use std::collections::HashSet;
use std::path::Path;

use trellis_types::document::{Flow, Input, Step, StepSpec, WorkflowDocument};
use trellis_types::error::EngineError;

use crate::graph::DependencyGraph;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON string into a validated document.
pub fn parse_document_json(text: &str) -> Result<WorkflowDocument, EngineError> {
    let doc: WorkflowDocument =
        serde_json::from_str(text).map_err(|e| EngineError::Parse(e.to_string()))?;
    validate_document(&doc)?;
    Ok(doc)
}

/// Parse a YAML string into a validated document.
pub fn parse_document_yaml(text: &str) -> Result<WorkflowDocument, EngineError> {
    let doc: WorkflowDocument =
        serde_yaml_ng::from_str(text).map_err(|e| EngineError::Parse(e.to_string()))?;
    validate_document(&doc)?;
    Ok(doc)
}

/// Serialize a document to YAML.
pub fn serialize_document_yaml(doc: &WorkflowDocument) -> Result<String, EngineError> {
    serde_yaml_ng::to_string(doc).map_err(|e| EngineError::Parse(e.to_string()))
}

/// Load a document from a `.json`, `.yaml`, or `.yml` file.
pub fn load_document_file(path: &Path) -> Result<WorkflowDocument, EngineError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_document_json(&content),
        _ => parse_document_yaml(&content),
    }
}

/// Save a document as YAML, creating parent directories as needed.
pub fn save_document_file(path: &Path, doc: &WorkflowDocument) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_document_yaml(doc)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a document.
///
/// Checks:
/// - non-empty version and metadata name, at least one flow
/// - unique flow / trigger / resource / error-handler ids
/// - per flow: unique step ids (including loop bodies and parallel
///   branches), valid trigger reference, step/resource input references,
///   `on_success`/`on_failure` targets, positive timeouts and attempt counts
/// - `step.type` agrees with the `config` payload variant
/// - each flow's induced graph (input dependencies plus success/failure
///   edges) is acyclic
pub fn validate_document(doc: &WorkflowDocument) -> Result<(), EngineError> {
    if doc.version.is_empty() {
        return Err(EngineError::Validation(
            "document version must not be empty".to_string(),
        ));
    }
    if doc.metadata.name.is_empty() {
        return Err(EngineError::Validation(
            "document name must not be empty".to_string(),
        ));
    }
    if doc.flows.is_empty() {
        return Err(EngineError::Validation(
            "document must contain at least one flow".to_string(),
        ));
    }

    unique_ids("flow", doc.flows.iter().map(|f| f.id.as_str()))?;
    unique_ids("trigger", doc.triggers.iter().map(|t| t.id.as_str()))?;
    unique_ids("resource", doc.resources.iter().map(|r| r.id.as_str()))?;
    unique_ids(
        "error handler",
        doc.error_handlers.iter().map(|h| h.id.as_str()),
    )?;

    let trigger_ids: HashSet<&str> = doc.triggers.iter().map(|t| t.id.as_str()).collect();
    let resource_ids: HashSet<&str> = doc.resources.iter().map(|r| r.id.as_str()).collect();

    for flow in &doc.flows {
        validate_flow(flow, &trigger_ids, &resource_ids)?;
    }

    for handler in &doc.error_handlers {
        let mut seen = HashSet::new();
        for step in &handler.steps {
            collect_step_ids(step, &mut seen, &format!("error handler '{}'", handler.id))?;
            validate_step_shape(step, &resource_ids)?;
        }
    }

    Ok(())
}

fn validate_flow(
    flow: &Flow,
    trigger_ids: &HashSet<&str>,
    resource_ids: &HashSet<&str>,
) -> Result<(), EngineError> {
    if flow.steps.is_empty() {
        return Err(EngineError::Validation(format!(
            "flow '{}' must have at least one step",
            flow.id
        )));
    }

    if let Some(trigger_id) = &flow.trigger_id {
        if !trigger_ids.contains(trigger_id.as_str()) {
            return Err(EngineError::UnknownReference(format!(
                "flow '{}' references unknown trigger '{trigger_id}'",
                flow.id
            )));
        }
    }

    // Unique ids across the flow, including nested sub-steps.
    let mut all_ids: HashSet<String> = HashSet::new();
    for step in &flow.steps {
        collect_step_ids(step, &mut all_ids, &format!("flow '{}'", flow.id))?;
    }

    let top_level: HashSet<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &flow.steps {
        validate_step_shape(step, resource_ids)?;

        for input_ref in input_step_refs(step) {
            if !all_ids.contains(input_ref) {
                return Err(EngineError::UnknownReference(format!(
                    "step '{}' reads unknown step '{input_ref}'",
                    step.id
                )));
            }
        }
        for target in step.on_success.iter().chain(step.on_failure.iter()) {
            if !top_level.contains(target.as_str()) {
                return Err(EngineError::UnknownReference(format!(
                    "step '{}' routes to unknown step '{target}'",
                    step.id
                )));
            }
        }
    }

    // Cycle check over the induced graph: input dependencies plus explicit
    // success/failure edges.
    let mut graph = DependencyGraph::new(flow.steps.iter().map(|s| s.id.clone()));
    for step in &flow.steps {
        for dep in input_step_refs(step) {
            // Nested sub-steps may reference ids that are not top-level
            // steps; only top-level references create scheduling edges.
            if graph.contains(dep) && dep != step.id {
                graph.add_edge(dep, &step.id)?;
            }
        }
        for target in step.on_success.iter().chain(step.on_failure.iter()) {
            graph.add_edge(&step.id, target)?;
        }
    }
    graph.toposort()?;

    Ok(())
}

/// Per-step checks that do not need flow context.
fn validate_step_shape(step: &Step, resource_ids: &HashSet<&str>) -> Result<(), EngineError> {
    if step.config.step_type() != step.step_type {
        return Err(EngineError::Validation(format!(
            "step '{}' is declared '{}' but its config is '{}'",
            step.id,
            step.step_type.as_str(),
            step.config.step_type().as_str()
        )));
    }
    if step.timeout_secs == Some(0) {
        return Err(EngineError::Validation(format!(
            "step '{}' has a zero timeout",
            step.id
        )));
    }
    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(EngineError::Validation(format!(
                "step '{}' has zero max_attempts",
                step.id
            )));
        }
    }
    for input in step.inputs.values() {
        if let Input::Resource { id } = input {
            if !resource_ids.contains(id.as_str()) {
                return Err(EngineError::UnknownReference(format!(
                    "step '{}' reads unknown resource '{id}'",
                    step.id
                )));
            }
        }
    }

    match &step.config {
        StepSpec::Loop {
            body,
            max_iterations,
            ..
        } => {
            if *max_iterations == Some(0) {
                return Err(EngineError::Validation(format!(
                    "loop step '{}' has zero max_iterations",
                    step.id
                )));
            }
            for sub in body {
                validate_step_shape(sub, resource_ids)?;
            }
        }
        StepSpec::Parallel { branches, .. } => {
            if branches.is_empty() {
                return Err(EngineError::Validation(format!(
                    "parallel step '{}' has no branches",
                    step.id
                )));
            }
            for sub in branches {
                validate_step_shape(sub, resource_ids)?;
            }
        }
        StepSpec::Wait { duration_ms } => {
            if *duration_ms == 0 {
                return Err(EngineError::Validation(format!(
                    "wait step '{}' has a zero duration",
                    step.id
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Record the step's id (and its sub-steps' ids) into `seen`, rejecting
/// duplicates.
fn collect_step_ids(
    step: &Step,
    seen: &mut HashSet<String>,
    scope: &str,
) -> Result<(), EngineError> {
    if !seen.insert(step.id.clone()) {
        return Err(EngineError::Validation(format!(
            "duplicate step id '{}' in {scope}",
            step.id
        )));
    }
    match &step.config {
        StepSpec::Loop { body, .. } => {
            for sub in body {
                collect_step_ids(sub, seen, scope)?;
            }
        }
        StepSpec::Parallel { branches, .. } => {
            for sub in branches {
                collect_step_ids(sub, seen, scope)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// All step ids this step's inputs reference, including nested sub-steps.
pub(crate) fn input_step_refs(step: &Step) -> Vec<&str> {
    let mut refs = Vec::new();
    collect_input_refs(step, &mut refs);
    refs
}

fn collect_input_refs<'a>(step: &'a Step, refs: &mut Vec<&'a str>) {
    for input in step.inputs.values() {
        if let Input::Step { id } = input {
            if !refs.contains(&id.as_str()) {
                refs.push(id);
            }
        }
    }
    match &step.config {
        StepSpec::Loop { over, body, .. } => {
            if let Input::Step { id } = over {
                if !refs.contains(&id.as_str()) {
                    refs.push(id);
                }
            }
            for sub in body {
                collect_input_refs(sub, refs);
            }
        }
        StepSpec::Parallel { branches, .. } => {
            for sub in branches {
                collect_input_refs(sub, refs);
            }
        }
        StepSpec::Transform { transform } => {
            use trellis_types::document::TransformSpec;
            let items = match transform {
                TransformSpec::Map { items, .. }
                | TransformSpec::Filter { items, .. }
                | TransformSpec::Aggregate { items, .. } => Some(items),
                TransformSpec::Template { .. } => None,
            };
            if let Some(Input::Step { id }) = items {
                if !refs.contains(&id.as_str()) {
                    refs.push(id);
                }
            }
        }
        StepSpec::Condition { condition } => {
            use trellis_types::document::ConditionSpec;
            let mut push = |input: &'a Input| {
                if let Input::Step { id } = input {
                    if !refs.contains(&id.as_str()) {
                        refs.push(id);
                    }
                }
            };
            match condition {
                ConditionSpec::Comparison { left, right, .. } => {
                    push(left);
                    push(right);
                }
                ConditionSpec::Existence { value } => push(value),
                ConditionSpec::Expression { .. } | ConditionSpec::Custom { .. } => {}
            }
        }
        _ => {}
    }
}

fn unique_ids<'a>(
    kind: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(EngineError::Validation(format!(
                "duplicate {kind} id: '{id}'"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
