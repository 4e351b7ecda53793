//! Dependency resolver: deterministic topological ordering of phases.
//!
//! Models phase dependencies as a `petgraph` directed graph (edge from
//! dependency to dependent) and orders phases with Kahn's algorithm: compute
//! in-degrees, repeatedly extract zero-in-degree phases, decrement their
//! dependents. Ties among ready phases are broken by declaration order, so
//! the same definition always yields the same order.
//!
//! Missing dependency references are rejected before the sort runs; a cycle
//! is reported naming one of its member phases.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use phasor_types::workflow::Phase;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from dependency resolution.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The dependency graph contains a cycle.
    #[error("circular dependency involving phase '{0}'")]
    CircularDependency(String),

    /// A phase depends on an ID that does not exist in the workflow.
    #[error("phase '{phase}' depends on unknown phase '{dependency}'")]
    MissingDependency { phase: String, dependency: String },
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Produce a deterministic execution order for `phases`.
///
/// The returned slice references the input phases; index 0 runs first.
/// Every phase appears after all of its dependencies, and phases whose
/// dependencies are equally satisfied keep their declaration order.
pub fn resolve_order<'a>(phases: &'a [Phase]) -> Result<Vec<&'a Phase>, ResolverError> {
    if phases.is_empty() {
        return Ok(vec![]);
    }

    let id_to_idx: HashMap<&str, usize> = phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.as_str(), i))
        .collect();

    // Reject unknown references before building the graph.
    for phase in phases {
        for dep in &phase.dependencies {
            if !id_to_idx.contains_key(dep.as_str()) {
                return Err(ResolverError::MissingDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Edge direction: dependency -> dependent, so in-degree counts
    // unsatisfied dependencies.
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..phases.len()).map(|i| graph.add_node(i)).collect();
    for (i, phase) in phases.iter().enumerate() {
        for dep in &phase.dependencies {
            graph.add_edge(nodes[id_to_idx[dep.as_str()]], nodes[i], ());
        }
    }

    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut emitted = vec![false; phases.len()];
    let mut order = Vec::with_capacity(phases.len());

    // Kahn's algorithm. Scanning from index 0 each round keeps the
    // declaration-order tie-break without a priority queue; phase counts
    // are small enough that the quadratic scan is irrelevant.
    while order.len() < phases.len() {
        let next = (0..phases.len()).find(|&i| !emitted[i] && in_degree[i] == 0);
        let Some(i) = next else {
            // Everything left has in-degree > 0: a cycle. Name the first
            // remaining phase in declaration order.
            let stuck = emitted.iter().position(|&e| !e).unwrap_or(0);
            return Err(ResolverError::CircularDependency(phases[stuck].id.clone()));
        };
        emitted[i] = true;
        order.push(&phases[i]);
        for dependent in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            in_degree[graph[dependent]] -= 1;
        }
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: build a phase with given ID and dependencies.
    fn phase(id: &str, dependencies: Vec<&str>) -> Phase {
        Phase {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            timeout_ms: None,
            dependencies: dependencies.into_iter().map(String::from).collect(),
            on_failure: None,
            on_timeout: None,
            optional: false,
            invocations: vec![],
            skip_if_unavailable: false,
        }
    }

    fn ids(order: &[&Phase]) -> Vec<String> {
        order.iter().map(|p| p.id.clone()).collect()
    }

    #[test]
    fn empty_phase_list() {
        let order = resolve_order(&[]).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn independent_phases_keep_declaration_order() {
        let phases = vec![phase("c", vec![]), phase("a", vec![]), phase("b", vec![])];
        let order = resolve_order(&phases).unwrap();
        assert_eq!(ids(&order), vec!["c", "a", "b"]);
    }

    #[test]
    fn fan_out_after_root_keeps_declaration_order() {
        // a (no deps), b (deps: a), c (deps: a) -> a, then b and c in
        // declaration order.
        let phases = vec![
            phase("a", vec![]),
            phase("b", vec!["a"]),
            phase("c", vec!["a"]),
        ];
        let order = resolve_order(&phases).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn linear_chain() {
        let phases = vec![
            phase("third", vec!["second"]),
            phase("second", vec!["first"]),
            phase("first", vec![]),
        ];
        let order = resolve_order(&phases).unwrap();
        assert_eq!(ids(&order), vec!["first", "second", "third"]);
    }

    #[test]
    fn diamond_is_a_valid_topological_order() {
        let phases = vec![
            phase("a", vec![]),
            phase("b", vec!["a"]),
            phase("c", vec!["a"]),
            phase("d", vec!["b", "c"]),
        ];
        let order = resolve_order(&phases).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c", "d"]);

        // every phase appears after all of its dependencies
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        for p in &phases {
            for dep in &p.dependencies {
                assert!(pos[dep.as_str()] < pos[p.id.as_str()]);
            }
        }
    }

    #[test]
    fn two_phase_cycle_detected() {
        let phases = vec![phase("a", vec!["b"]), phase("b", vec!["a"])];
        let err = resolve_order(&phases).unwrap_err();
        match err {
            ResolverError::CircularDependency(id) => {
                assert!(id == "a" || id == "b");
            }
            other => panic!("expected CircularDependency, got {other}"),
        }
    }

    #[test]
    fn three_phase_cycle_detected_behind_valid_prefix() {
        let phases = vec![
            phase("setup", vec![]),
            phase("a", vec!["setup", "c"]),
            phase("b", vec!["a"]),
            phase("c", vec!["b"]),
        ];
        let err = resolve_order(&phases).unwrap_err();
        assert!(matches!(err, ResolverError::CircularDependency(_)));
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let phases = vec![phase("a", vec!["a"])];
        let err = resolve_order(&phases).unwrap_err();
        assert!(matches!(err, ResolverError::CircularDependency(id) if id == "a"));
    }

    #[test]
    fn missing_dependency_reported_before_sort() {
        // the cycle between a and b must not mask the missing reference
        let phases = vec![
            phase("a", vec!["b"]),
            phase("b", vec!["a"]),
            phase("c", vec!["ghost"]),
        ];
        let err = resolve_order(&phases).unwrap_err();
        match err {
            ResolverError::MissingDependency { phase, dependency } => {
                assert_eq!(phase, "c");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected MissingDependency, got {other}"),
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let phases = vec![
            phase("a", vec![]),
            phase("d", vec!["a"]),
            phase("c", vec!["a"]),
            phase("b", vec!["a"]),
        ];
        let first = ids(&resolve_order(&phases).unwrap());
        for _ in 0..10 {
            assert_eq!(ids(&resolve_order(&phases).unwrap()), first);
        }
        assert_eq!(first, vec!["a", "d", "c", "b"]);
    }
}
