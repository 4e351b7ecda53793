//! Filesystem-backed state storage.

pub mod store;
