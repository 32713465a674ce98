//! Shared domain types for Trellis.
//!
//! This crate contains the canonical workflow document model, the visual
//! canvas model consumed by the compiler, execution-tracking types, and the
//! structured error taxonomy.
//!
//! Zero engine dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror, and schemars.

pub mod canvas;
pub mod capability;
pub mod document;
pub mod error;
pub mod run;
