//! Core logic for the phasor workflow orchestration engine.
//!
//! Layering follows the data flow: the [`catalog`] loads and validates
//! declarative workflow definitions, the [`matcher`] scores them against a
//! classified task, the [`resolver`] orders phases, and the [`orchestrator`]
//! drives execution against [`provider`] implementations while persisting
//! progress through a [`store`]. The [`engine`] module ties the pieces into
//! a single facade.
//!
//! Storage and provider seams are traits; filesystem implementations live in
//! `phasor-infra`, and an in-memory store ships here for tests.

pub mod catalog;
pub mod engine;
pub mod matcher;
pub mod orchestrator;
pub mod provider;
pub mod resolver;
pub mod store;
