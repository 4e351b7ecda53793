//! Workflow catalog: loading, validation, and caching of definitions.
//!
//! Definitions live as YAML documents, one workflow per file. Parsing
//! collects *every* structural violation into one error instead of failing
//! on the first, so an author can fix a broken document in a single pass.
//! Parsed definitions are cached keyed by canonical path and invalidated
//! when the backing file's modification time changes; a cache refresh
//! replaces the definition wholesale, it is never patched in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use phasor_types::workflow::{Phase, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML deserialization failure.
    #[error("parse error in {file}: {message}")]
    Parse { file: String, message: String },

    /// Structural validation failure. Carries every violation found.
    #[error("invalid definition in {file}: {}", violations.join("; "))]
    Invalid {
        file: String,
        violations: Vec<String>,
    },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing and validation
// ---------------------------------------------------------------------------

/// Parse a YAML document into a validated `WorkflowDefinition`.
///
/// `source` names the document in error messages (a path, or "<inline>").
pub fn parse_workflow_yaml(
    yaml: &str,
    source: &str,
) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse {
            file: source.to_string(),
            message: e.to_string(),
        })?;
    let violations = validate_definition(&def);
    if !violations.is_empty() {
        return Err(DefinitionError::Invalid {
            file: source.to_string(),
            violations,
        });
    }
    Ok(def)
}

/// Collect all structural violations in a definition.
///
/// Returns an empty vec when the definition is valid. Checks:
/// - `metadata.name` and `metadata.description` non-empty
/// - `metadata.version` parses as semver
/// - `metadata.intended_for` non-empty
/// - at least one required phase
/// - phase IDs match `[a-z0-9-]+` and are unique across required and
///   optional phases
/// - phase timeouts are > 0 when set
pub fn validate_definition(def: &WorkflowDefinition) -> Vec<String> {
    let mut violations = Vec::new();

    if def.metadata.name.is_empty() {
        violations.push("metadata.name must not be empty".to_string());
    }
    if def.metadata.description.is_empty() {
        violations.push("metadata.description must not be empty".to_string());
    }
    if def.metadata.parsed_version().is_err() {
        violations.push(format!(
            "metadata.version '{}' is not a valid semver version",
            def.metadata.version
        ));
    }
    if def.metadata.intended_for.is_empty() {
        violations.push("metadata.intendedFor must list at least one intent".to_string());
    }
    if def.phases.is_empty() {
        violations.push("workflow must have at least one phase".to_string());
    }

    let mut seen_ids = HashSet::new();
    for phase in def.all_phases() {
        if !is_valid_phase_id(&phase.id) {
            violations.push(format!(
                "phase ID '{}' is invalid (expected pattern [a-z0-9-]+)",
                phase.id
            ));
        }
        if !seen_ids.insert(phase.id.as_str()) {
            violations.push(format!("duplicate phase ID: '{}'", phase.id));
        }
        if let Some(0) = phase.timeout_ms {
            violations.push(format!("phase '{}' timeout must be > 0", phase.id));
        }
        validate_phase(phase, &mut violations);
    }

    violations
}

fn validate_phase(phase: &Phase, violations: &mut Vec<String>) {
    if phase.name.is_empty() {
        violations.push(format!("phase '{}' name must not be empty", phase.id));
    }
    for inv in &phase.invocations {
        if inv.provider_id.is_empty() {
            violations.push(format!(
                "phase '{}' has an invocation with an empty providerId",
                phase.id
            ));
        }
        if inv.action_id.is_empty() {
            violations.push(format!(
                "phase '{}' has an invocation with an empty actionId",
                phase.id
            ));
        }
    }
}

fn is_valid_phase_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct CacheEntry {
    modified: SystemTime,
    definition: Arc<WorkflowDefinition>,
}

/// Directory-backed workflow catalog with an mtime-keyed parse cache.
pub struct WorkflowCatalog {
    dir: PathBuf,
    cache: DashMap<PathBuf, CacheEntry>,
}

impl WorkflowCatalog {
    /// Create a catalog over a directory of workflow YAML files.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// The catalog directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load one definition, reusing the cache when the file is unchanged.
    pub fn load_file(&self, path: &Path) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let modified = std::fs::metadata(path)?.modified()?;

        if let Some(entry) = self.cache.get(path) {
            if entry.modified == modified {
                return Ok(Arc::clone(&entry.definition));
            }
        }

        let content = std::fs::read_to_string(path)?;
        let def = Arc::new(parse_workflow_yaml(&content, &path.display().to_string())?);
        tracing::debug!(path = %path.display(), workflow = def.metadata.name.as_str(), "parsed workflow definition");
        self.cache.insert(
            path.to_path_buf(),
            CacheEntry {
                modified,
                definition: Arc::clone(&def),
            },
        );
        Ok(def)
    }

    /// Load every definition in the catalog directory.
    ///
    /// Files are visited in sorted path order, which fixes the catalog
    /// declaration order used for match tie-breaking. Invalid documents
    /// fail the whole load (fail closed -- a broken catalog is reported
    /// before any run starts).
    pub fn load_all(&self) -> Result<Vec<Arc<WorkflowDefinition>>, DefinitionError> {
        Ok(self.load_entries()?.into_iter().map(|(_, def)| def).collect())
    }

    /// Like [`load_all`](Self::load_all), keeping each definition's source
    /// path alongside it.
    pub fn load_entries(
        &self,
    ) -> Result<Vec<(PathBuf, Arc<WorkflowDefinition>)>, DefinitionError> {
        let mut paths = Vec::new();
        if self.dir.exists() {
            collect_yaml_files(&self.dir, &mut paths)?;
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let def = self.load_file(&path)?;
            entries.push((path, def));
        }
        Ok(entries)
    }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                out.push(path);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
