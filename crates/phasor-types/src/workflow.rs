//! Workflow definition types for phasor.
//!
//! Defines the canonical intermediate representation for declarative workflow
//! documents: ordered phases with dependencies, timeout/failure policies, and
//! capability invocations. One YAML document describes one workflow; the
//! catalog parses documents into `WorkflowDefinition` and never mutates them
//! afterwards -- cache invalidation replaces the whole value.
//!
//! Serde aliases accept the document key spellings (`intendedFor`,
//! `timeoutMs`, `optionalPhases`, ...) alongside snake_case.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition, immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Identity and matching metadata.
    pub metadata: WorkflowMetadata,
    /// Workflow-level defaults inherited by phases that leave policy unset.
    #[serde(default)]
    pub defaults: PhaseDefaults,
    /// Capabilities and external services the workflow cannot run without.
    #[serde(default)]
    pub required: RequiredResources,
    /// Ordered list of phases forming the dependency graph.
    pub phases: Vec<Phase>,
    /// Phases that may be dropped entirely when their resources are missing.
    #[serde(default, alias = "optionalPhases")]
    pub optional_phases: Vec<Phase>,
}

impl WorkflowDefinition {
    /// Look up a phase (required or optional) by ID.
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases
            .iter()
            .chain(self.optional_phases.iter())
            .find(|p| p.id == id)
    }

    /// All phases in declaration order, required first, then optional.
    pub fn all_phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().chain(self.optional_phases.iter())
    }

    /// Effective failure policy for a phase (phase override or workflow default).
    pub fn failure_policy(&self, phase: &Phase) -> FailurePolicy {
        phase.on_failure.unwrap_or(self.defaults.on_failure)
    }

    /// Effective timeout policy for a phase (phase override or workflow default).
    pub fn timeout_policy(&self, phase: &Phase) -> TimeoutPolicy {
        phase.on_timeout.unwrap_or(self.defaults.on_timeout)
    }

    /// Effective timeout in milliseconds for a phase.
    pub fn timeout_ms(&self, phase: &Phase) -> u64 {
        phase.timeout_ms.unwrap_or(self.defaults.timeout_ms)
    }
}

/// Identity and matching metadata for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Workflow name, unique within a catalog.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Intent labels this workflow is designed for.
    #[serde(default, alias = "intendedFor")]
    pub intended_for: Vec<String>,
    /// Complexity tier the workflow targets.
    #[serde(default, alias = "complexityTier")]
    pub complexity: ComplexityTier,
    /// Rough expected duration, used for match scoring.
    #[serde(default, alias = "estimatedDurationMinutes")]
    pub estimated_duration_minutes: u32,
    /// Free-form keywords for match scoring.
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowMetadata {
    /// Parse the declared version as semver.
    pub fn parsed_version(&self) -> Result<semver::Version, semver::Error> {
        self.version.parse()
    }
}

/// Capabilities and external services a workflow requires up front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredResources {
    /// Capability provider IDs that must be resolvable before a run starts.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// External service IDs that must be reachable before a run starts.
    #[serde(default, alias = "externalServices")]
    pub external_services: Vec<String>,
}

/// Complexity tier of a workflow or classified task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Small,
    #[default]
    Medium,
    Large,
}

impl ComplexityTier {
    /// Whether two tiers are adjacent (small<->medium or medium<->large).
    ///
    /// Small and large are not adjacent.
    pub fn is_adjacent(self, other: ComplexityTier) -> bool {
        use ComplexityTier::*;
        matches!(
            (self, other),
            (Small, Medium) | (Medium, Small) | (Medium, Large) | (Large, Medium)
        )
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A single phase in a workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Phase ID, unique within the workflow. Pattern `[a-z0-9-]+`.
    pub id: String,
    /// Human-readable phase name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Phase-level timeout in milliseconds (workflow default if unset).
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Phase IDs this phase depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Failure policy override (workflow default if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailurePolicy>,
    /// Timeout policy override (workflow default if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<TimeoutPolicy>,
    /// Whether the phase as a whole may be skipped on failure of its resources.
    #[serde(default)]
    pub optional: bool,
    /// Ordered capability invocations executed when the phase runs.
    #[serde(default, alias = "capabilityInvocations", alias = "hooks")]
    pub invocations: Vec<CapabilityInvocation>,
    /// For optional phases: skip silently when a provider is unavailable.
    #[serde(default)]
    pub skip_if_unavailable: bool,
}

/// One call from a phase out to a capability provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInvocation {
    /// Provider to invoke.
    #[serde(alias = "providerId")]
    pub provider_id: String,
    /// Action within the provider.
    #[serde(alias = "actionId")]
    pub action_id: String,
    /// If true, provider unavailability fails the phase; if false, the
    /// invocation is skipped with a warning recorded in the results.
    #[serde(default = "default_true")]
    pub required: bool,
    /// External service this invocation talks to, if any.
    #[serde(default, alias = "externalServiceId", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Overrides `required` when set. Kept separate because optional phases
    /// may still carry individual invocations that must not be skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
}

impl CapabilityInvocation {
    /// Effective required flag: `mandatory` wins over `required` when set.
    pub fn is_required(&self) -> bool {
        self.mandatory.unwrap_or(self.required)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Policies and defaults
// ---------------------------------------------------------------------------

/// What to do when a phase invocation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run with a terminal error.
    #[default]
    Abort,
    /// Re-run the phase up to `max_retries` times, then abort.
    Retry,
    /// Mark the phase skipped and continue.
    Skip,
    /// Pause the run and wait for an explicit resume decision.
    Prompt,
}

/// What to do when a phase exceeds its timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Stop the run with a terminal error.
    #[default]
    Abort,
    /// Re-run the phase once with 1.5x the timeout.
    Extend,
    /// Mark the phase skipped and continue.
    Skip,
    /// Pause the run and wait for an explicit resume decision.
    Prompt,
}

/// Workflow-level defaults inherited by phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefaults {
    /// Default phase timeout in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
    /// Default failure policy.
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Default timeout policy.
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Maximum retries for `FailurePolicy::Retry` phases.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for PhaseDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            on_failure: FailurePolicy::default(),
            on_timeout: TimeoutPolicy::default(),
            max_retries: default_max_retries(),
        }
    }
}

// ---------------------------------------------------------------------------
// Classified task (external classifier output)
// ---------------------------------------------------------------------------

/// Output of the external task classifier: the matcher's input.
///
/// The engine treats the task description as pre-classified and opaque; it
/// never does language analysis itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedTask {
    /// Intent label (e.g. "bugfix", "feature", "migration").
    pub intent: String,
    /// Complexity tier estimated by the classifier.
    #[serde(default)]
    pub complexity: ComplexityTier,
    /// Keywords extracted from the task description.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Estimated duration in minutes.
    #[serde(default)]
    pub estimated_duration_minutes: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// A workflow document written with the external key spellings.
    const DOCUMENT: &str = r#"
metadata:
  name: bugfix-flow
  description: Reproduce, fix, and verify a reported bug
  version: "1.2.0"
  intendedFor: [bugfix]
  complexityTier: small
  estimatedDurationMinutes: 45
  keywords: [fix, bug, regression]
defaults:
  timeoutMs: 120000
  on_failure: retry
  on_timeout: extend
  max_retries: 2
required:
  capabilities: [code-editor, test-runner]
  externalServices: [ci]
phases:
  - id: reproduce
    name: Reproduce
    timeoutMs: 60000
    capabilityInvocations:
      - providerId: test-runner
        actionId: run-failing-test
  - id: fix
    name: Fix
    dependencies: [reproduce]
    on_failure: prompt
    capabilityInvocations:
      - providerId: code-editor
        actionId: apply-patch
      - providerId: test-runner
        actionId: run-tests
        required: false
optionalPhases:
  - id: lint
    name: Lint
    skip_if_unavailable: true
    capabilityInvocations:
      - providerId: linter
        actionId: check
"#;

    #[test]
    fn parse_document_with_external_key_spellings() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(DOCUMENT).unwrap();
        assert_eq!(def.metadata.name, "bugfix-flow");
        assert_eq!(def.metadata.intended_for, vec!["bugfix"]);
        assert_eq!(def.metadata.complexity, ComplexityTier::Small);
        assert_eq!(def.metadata.estimated_duration_minutes, 45);
        assert_eq!(def.defaults.timeout_ms, 120_000);
        assert_eq!(def.defaults.on_failure, FailurePolicy::Retry);
        assert_eq!(def.defaults.max_retries, 2);
        assert_eq!(def.required.external_services, vec!["ci"]);
        assert_eq!(def.phases.len(), 2);
        assert_eq!(def.optional_phases.len(), 1);
        assert!(def.optional_phases[0].skip_if_unavailable);
        assert_eq!(def.phases[1].dependencies, vec!["reproduce"]);
        assert_eq!(def.phases[1].invocations.len(), 2);
        assert!(!def.phases[1].invocations[1].required);
    }

    #[test]
    fn yaml_roundtrip_preserves_shape() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(DOCUMENT).unwrap();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let again: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(again.metadata.name, def.metadata.name);
        assert_eq!(again.phases.len(), def.phases.len());
        assert_eq!(again.optional_phases.len(), def.optional_phases.len());
        assert_eq!(again.defaults.max_retries, def.defaults.max_retries);
    }

    #[test]
    fn effective_policies_inherit_workflow_defaults() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(DOCUMENT).unwrap();
        let reproduce = def.phase("reproduce").unwrap();
        let fix = def.phase("fix").unwrap();

        // reproduce leaves policies unset -> workflow defaults apply
        assert_eq!(def.failure_policy(reproduce), FailurePolicy::Retry);
        assert_eq!(def.timeout_policy(reproduce), TimeoutPolicy::Extend);
        assert_eq!(def.timeout_ms(reproduce), 60_000);

        // fix overrides on_failure
        assert_eq!(def.failure_policy(fix), FailurePolicy::Prompt);
        assert_eq!(def.timeout_ms(fix), 120_000);
    }

    #[test]
    fn invocation_mandatory_overrides_required() {
        let inv = CapabilityInvocation {
            provider_id: "p".to_string(),
            action_id: "a".to_string(),
            required: false,
            service_id: None,
            mandatory: Some(true),
        };
        assert!(inv.is_required());

        let inv = CapabilityInvocation {
            mandatory: None,
            ..inv
        };
        assert!(!inv.is_required());
    }

    #[test]
    fn complexity_adjacency() {
        use ComplexityTier::*;
        assert!(Small.is_adjacent(Medium));
        assert!(Medium.is_adjacent(Small));
        assert!(Medium.is_adjacent(Large));
        assert!(!Small.is_adjacent(Large));
        assert!(!Small.is_adjacent(Small));
    }

    #[test]
    fn policy_serde_spellings() {
        let p: FailurePolicy = serde_yaml_ng::from_str("prompt").unwrap();
        assert_eq!(p, FailurePolicy::Prompt);
        let t: TimeoutPolicy = serde_yaml_ng::from_str("extend").unwrap();
        assert_eq!(t, TimeoutPolicy::Extend);
        assert_eq!(serde_json::to_string(&FailurePolicy::Skip).unwrap(), "\"skip\"");
    }

    #[test]
    fn defaults_when_sections_missing() {
        let yaml = r#"
metadata:
  name: minimal
  description: smallest valid document
phases:
  - id: only
    name: Only
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.metadata.version, "1.0.0");
        assert_eq!(def.defaults.timeout_ms, 300_000);
        assert_eq!(def.defaults.on_failure, FailurePolicy::Abort);
        assert_eq!(def.defaults.max_retries, 3);
        assert!(def.required.capabilities.is_empty());
        assert!(def.phases[0].invocations.is_empty());
        assert!(!def.phases[0].optional);
    }
}
