//! Observability setup for Trellis embedders.
//!
//! The engine itself only emits `tracing` events; this crate wires up a
//! subscriber for hosts that do not already have one.

pub mod tracing_setup;
