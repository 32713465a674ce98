//! Capability-boundary types shared with external collaborators.
//!
//! Component implementations live outside the engine; this module defines the
//! descriptor surface they expose so that the canvas compiler and the action
//! executor can reason about them without depending on concrete integrations.

use schemars::Schema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Component category
// ---------------------------------------------------------------------------

/// Coarse capability category of a component.
///
/// The canvas compiler maps categories to step types:
/// identity / productivity / communication / cloud become `action` steps,
/// `data` becomes `transform`, `governance` becomes `condition`, and anything
/// unrecognized becomes `custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    /// Directory and identity-provider integrations.
    Identity,
    /// Productivity-suite integrations (licenses, mailboxes, drives).
    Productivity,
    /// Chat and notification integrations.
    Communication,
    /// Cloud-provider IAM and infrastructure integrations.
    Cloud,
    /// Data shaping and movement.
    Data,
    /// Policy and approval gates.
    Governance,
    /// Catch-all for categories this engine version does not know.
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Component descriptor
// ---------------------------------------------------------------------------

/// Self-description a component registers alongside its executable body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Stable component id (e.g. "directory.lookup-user").
    pub id: String,
    /// Capability category, used by the canvas compiler.
    pub category: ComponentCategory,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the expected input map.
    pub input_schema: Schema,
    /// JSON Schema of the produced output value.
    pub output_schema: Schema,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
