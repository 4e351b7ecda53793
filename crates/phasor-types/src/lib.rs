//! Shared domain types for the phasor workflow orchestration engine.
//!
//! Everything here is plain data: workflow definitions (the declarative IR
//! parsed from YAML), run state, checkpoints, history records, engine
//! configuration, and the error enums shared across layers.

pub mod config;
pub mod error;
pub mod run;
pub mod workflow;
