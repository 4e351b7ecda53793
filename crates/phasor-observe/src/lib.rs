//! Observability setup for the phasor engine.

pub mod tracing_setup;

pub use tracing_setup::init_tracing;
