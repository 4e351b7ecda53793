//! Persistence adapters for the phasor engine.
//!
//! Implements the `phasor-core` state store seam on top of the local
//! filesystem: an atomically-replaced current-run document with timestamped
//! backups, and an append-only newline-delimited JSON history log.

pub mod fs;

pub use fs::store::FsStateStore;
