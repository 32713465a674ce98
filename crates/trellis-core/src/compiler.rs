//! Canvas-to-document compiler.
//!
//! Converts a visual node/port/connection graph into a [`WorkflowDocument`]
//! the scheduler can run unmodified. Pure function: no side effects, and a
//! cyclic canvas aborts compilation with no partial document.
//!
//! Data flows between compiled steps through generated variables: every
//! output port becomes a `variable` output named `<nodeId>_<portName>`, and
//! every connected input port reads that variable. Step ordering comes from
//! the topological sort, so the demand-driven scheduler sees each variable
//! written before it is read.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use trellis_types::canvas::{CanvasDocument, CanvasNode, CanvasNodeType, Connection};
use trellis_types::capability::ComponentCategory;
use trellis_types::document::{
    DocumentMetadata, Flow, Input, Output, ResourceDefinition, Step, StepSpec, StepType,
    TriggerDefinition, TriggerKind, WorkflowDocument,
};
use trellis_types::error::EngineError;

use crate::graph::DependencyGraph;
use crate::validate::validate_document;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Compile a canvas into a validated workflow document.
pub fn compile(canvas: &CanvasDocument) -> Result<WorkflowDocument, EngineError> {
    // 1. Partition nodes by role.
    let mut resources = Vec::new();
    let mut triggers = Vec::new();
    let mut components = Vec::new();
    for node in &canvas.nodes {
        match node.node_type {
            CanvasNodeType::Resource => resources.push(node),
            CanvasNodeType::Trigger => triggers.push(node),
            CanvasNodeType::Component => components.push(node),
        }
    }

    // 2-3. Dependency graph over component nodes, explicit pre-pass sort.
    // Same depth-first demand order as the scheduler, with canvas node order
    // as the encounter order, so compilation is deterministic.
    let mut graph = DependencyGraph::new(components.iter().map(|n| n.id.clone()));
    for connection in &canvas.connections {
        if graph.contains(&connection.source_node_id) && graph.contains(&connection.target_node_id)
        {
            graph.add_edge(&connection.source_node_id, &connection.target_node_id)?;
        }
    }
    let encounter: Vec<&str> = components.iter().map(|n| n.id.as_str()).collect();
    let order = graph.demand_order(&encounter)?;

    // 4-5. Map nodes to steps in sort order.
    let node_by_id: BTreeMap<&str, &CanvasNode> =
        canvas.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut steps = Vec::with_capacity(order.len());
    for id in &order {
        let node = node_by_id[id.as_str()];
        steps.push(compile_component_node(node, canvas, &node_by_id)?);
    }

    // 6. Output ports with no outgoing connection become flow outputs.
    let mut flow_outputs = BTreeMap::new();
    for node in &components {
        for port in &node.output_ports {
            let connected = canvas.connections.iter().any(|c| {
                c.source_node_id == node.id && c.source_port == port.name
            });
            if !connected {
                let path = port_variable(&node.id, &port.name);
                flow_outputs.insert(path.clone(), format!("variables['{path}']"));
            }
        }
    }

    let document = WorkflowDocument {
        version: "1".to_string(),
        metadata: DocumentMetadata {
            name: canvas.name.clone(),
            tags: vec!["canvas".to_string()],
            created: Utc::now(),
            modified: Utc::now(),
        },
        config: Default::default(),
        resources: resources
            .iter()
            .map(|node| compile_resource_node(node))
            .collect(),
        triggers: triggers
            .iter()
            .map(|node| compile_trigger_node(node))
            .collect::<Result<_, _>>()?,
        flows: vec![Flow {
            id: canvas.id.clone(),
            name: canvas.name.clone(),
            trigger_id: triggers.first().map(|n| n.id.clone()),
            steps,
            variables: BTreeMap::new(),
            outputs: flow_outputs,
        }],
        error_handlers: vec![],
    };

    validate_document(&document)?;
    Ok(document)
}

// ---------------------------------------------------------------------------
// Node mapping
// ---------------------------------------------------------------------------

/// The generated variable name carrying one output port's value.
fn port_variable(node_id: &str, port_name: &str) -> String {
    format!("{node_id}_{port_name}")
}

fn compile_component_node(
    node: &CanvasNode,
    canvas: &CanvasDocument,
    node_by_id: &BTreeMap<&str, &CanvasNode>,
) -> Result<Step, EngineError> {
    let step_type = map_category(node.category);

    let mut inputs = BTreeMap::new();
    for port in &node.input_ports {
        let connection = canvas
            .connections
            .iter()
            .find(|c| c.target_node_id == node.id && c.target_port == port.name);
        match connection {
            Some(connection) => {
                inputs.insert(port.name.clone(), connected_input(connection, node_by_id)?);
            }
            None => {
                // Unconnected ports fall back to the node's stored config.
                if let Some(value) = node.config.get(&port.name) {
                    inputs.insert(
                        port.name.clone(),
                        Input::Literal {
                            value: value.clone(),
                        },
                    );
                }
            }
        }
    }

    let outputs = node
        .output_ports
        .iter()
        .map(|port| {
            (
                port.name.clone(),
                Output::Variable {
                    path: port_variable(&node.id, &port.name),
                },
            )
        })
        .collect();

    let config = compile_step_spec(node, step_type)?;
    Ok(Step {
        id: node.id.clone(),
        step_type,
        config,
        inputs,
        outputs,
        on_success: vec![],
        on_failure: vec![],
        timeout_secs: None,
        retry: None,
    })
}

fn connected_input(
    connection: &Connection,
    node_by_id: &BTreeMap<&str, &CanvasNode>,
) -> Result<Input, EngineError> {
    let source = node_by_id
        .get(connection.source_node_id.as_str())
        .ok_or_else(|| {
            EngineError::UnknownReference(format!(
                "connection references unknown node '{}'",
                connection.source_node_id
            ))
        })?;
    Ok(match source.node_type {
        CanvasNodeType::Component => Input::Variable {
            name: port_variable(&connection.source_node_id, &connection.source_port),
        },
        CanvasNodeType::Resource => Input::Resource {
            id: connection.source_node_id.clone(),
        },
        CanvasNodeType::Trigger => Input::Expression {
            expression: "trigger".to_string(),
        },
    })
}

/// Capability category to step type:
/// identity/productivity/communication/cloud are actions, data transforms,
/// governance conditions, anything unmapped a custom step.
fn map_category(category: Option<ComponentCategory>) -> StepType {
    match category {
        Some(
            ComponentCategory::Identity
            | ComponentCategory::Productivity
            | ComponentCategory::Communication
            | ComponentCategory::Cloud,
        ) => StepType::Action,
        Some(ComponentCategory::Data) => StepType::Transform,
        Some(ComponentCategory::Governance) => StepType::Condition,
        Some(ComponentCategory::Unknown) | None => StepType::Custom,
    }
}

fn compile_step_spec(node: &CanvasNode, step_type: StepType) -> Result<StepSpec, EngineError> {
    match step_type {
        StepType::Action => {
            let component_id = node.component_id.clone().ok_or_else(|| {
                EngineError::Validation(format!(
                    "component node '{}' has no component_id",
                    node.id
                ))
            })?;
            Ok(StepSpec::Action {
                component_id,
                params: Value::Object(node.config.clone().into_iter().collect()),
            })
        }
        StepType::Transform => {
            let spec = node.config.get("transform").ok_or_else(|| {
                EngineError::Validation(format!(
                    "data node '{}' has no 'transform' config",
                    node.id
                ))
            })?;
            serde_json::from_value(spec.clone())
                .map(|transform| StepSpec::Transform { transform })
                .map_err(|e| {
                    EngineError::Validation(format!(
                        "data node '{}' has an invalid transform: {e}",
                        node.id
                    ))
                })
        }
        StepType::Condition => {
            let spec = node.config.get("condition").ok_or_else(|| {
                EngineError::Validation(format!(
                    "governance node '{}' has no 'condition' config",
                    node.id
                ))
            })?;
            serde_json::from_value(spec.clone())
                .map(|condition| StepSpec::Condition { condition })
                .map_err(|e| {
                    EngineError::Validation(format!(
                        "governance node '{}' has an invalid condition: {e}",
                        node.id
                    ))
                })
        }
        StepType::Custom => {
            let code = node
                .config
                .get("code")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "unmapped node '{}' has no 'code' config",
                        node.id
                    ))
                })?;
            Ok(StepSpec::Custom {
                code: code.to_string(),
                language: None,
            })
        }
        // Canvas nodes never map to the remaining kinds.
        StepType::Loop | StepType::Parallel | StepType::Wait => Err(EngineError::Validation(
            format!("node '{}' maps to unsupported step type", node.id),
        )),
    }
}

fn compile_resource_node(node: &CanvasNode) -> ResourceDefinition {
    let kind = node
        .config
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or("generic")
        .to_string();
    ResourceDefinition {
        id: node.id.clone(),
        kind,
        config: Value::Object(node.config.clone().into_iter().collect()),
    }
}

fn compile_trigger_node(node: &CanvasNode) -> Result<TriggerDefinition, EngineError> {
    let kind = match node.config.get("trigger") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            EngineError::Validation(format!(
                "trigger node '{}' has an invalid trigger: {e}",
                node.id
            ))
        })?,
        None => TriggerKind::Manual {},
    };
    Ok(TriggerDefinition {
        id: node.id.clone(),
        kind,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
