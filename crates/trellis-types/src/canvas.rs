//! Visual canvas model: nodes, typed ports, and connections.
//!
//! A [`CanvasDocument`] is what a visual editor persists. The engine never
//! executes it directly -- the compiler converts it into a
//! [`WorkflowDocument`](crate::document::WorkflowDocument) first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::ComponentCategory;

// ---------------------------------------------------------------------------
// Canvas document
// ---------------------------------------------------------------------------

/// A visual node/port/connection graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasDocument {
    /// Canvas id, also used as the compiled flow id.
    pub id: String,
    /// Human-readable canvas name.
    pub name: String,
    /// All nodes on the canvas.
    pub nodes: Vec<CanvasNode>,
    /// Directed connections between node ports.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// A single node on the canvas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasNode {
    /// Node id, unique within the canvas.
    pub id: String,
    /// What this node represents.
    #[serde(rename = "type")]
    pub node_type: CanvasNodeType,
    /// Capability category, set on component nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ComponentCategory>,
    /// Component id, set on component nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Stored node configuration (port defaults, transform/condition specs).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,
    /// Typed input ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_ports: Vec<NodePort>,
    /// Typed output ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_ports: Vec<NodePort>,
    /// Editor position. Ignored by the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CanvasPosition>,
}

/// The role a canvas node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasNodeType {
    /// Compiles into a document resource.
    Resource,
    /// Compiles into a document trigger.
    Trigger,
    /// Compiles into a step.
    Component,
}

/// A named, optionally typed port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePort {
    /// Port name, unique per direction within a node.
    pub name: String,
    /// Declared data type. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// A directed connection from a source port to a target port.
///
/// `source -> target` means the target node depends on the source node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source_node_id: String,
    pub source_port: String,
    pub target_node_id: String,
    pub target_port: String,
}

/// Editor coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CanvasPosition {
    pub x: f64,
    pub y: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canvas_roundtrip() {
        let canvas = CanvasDocument {
            id: "onboard".to_string(),
            name: "Onboarding".to_string(),
            nodes: vec![
                CanvasNode {
                    id: "lookup".to_string(),
                    node_type: CanvasNodeType::Component,
                    category: Some(ComponentCategory::Identity),
                    component_id: Some("directory.lookup-user".to_string()),
                    config: BTreeMap::from([("username".to_string(), json!("jdoe"))]),
                    input_ports: vec![NodePort {
                        name: "username".to_string(),
                        data_type: Some("string".to_string()),
                    }],
                    output_ports: vec![NodePort {
                        name: "user".to_string(),
                        data_type: None,
                    }],
                    position: Some(CanvasPosition { x: 10.0, y: 20.0 }),
                },
                CanvasNode {
                    id: "notify".to_string(),
                    node_type: CanvasNodeType::Component,
                    category: Some(ComponentCategory::Communication),
                    component_id: Some("chat.post-message".to_string()),
                    config: BTreeMap::new(),
                    input_ports: vec![NodePort {
                        name: "user".to_string(),
                        data_type: None,
                    }],
                    output_ports: vec![],
                    position: None,
                },
            ],
            connections: vec![Connection {
                source_node_id: "lookup".to_string(),
                source_port: "user".to_string(),
                target_node_id: "notify".to_string(),
                target_port: "user".to_string(),
            }],
        };

        let text = serde_json::to_string(&canvas).unwrap();
        let parsed: CanvasDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.connections.len(), 1);
        assert_eq!(parsed.nodes[0].node_type, CanvasNodeType::Component);
    }

    #[test]
    fn unknown_category_on_node_maps_to_unknown() {
        let text = r#"
{"id":"n1","type":"component","category":"blockchain",
 "component_id":"x","input_ports":[],"output_ports":[]}
"#;
        let node: CanvasNode = serde_json::from_str(text).unwrap();
        assert_eq!(node.category, Some(ComponentCategory::Unknown));
    }
}
