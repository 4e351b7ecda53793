//! Engine facade: task text in, execution outcome out.
//!
//! Wires the pipeline end to end: the classifier turns free text into a
//! [`ClassifiedTask`], the catalog supplies candidates, the matcher picks a
//! workflow, and the orchestrator runs it. Each stage is also reachable on
//! its own through the accessors for callers that drive the steps manually.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use phasor_types::config::EngineConfig;
use phasor_types::run::HistoryFilter;
use phasor_types::workflow::ClassifiedTask;
use thiserror::Error;

use crate::catalog::{DefinitionError, WorkflowCatalog};
use crate::matcher::{MatchError, MatchResult, WorkflowMatcher};
use crate::orchestrator::{
    ExecutionOutcome, Orchestrator, OrchestratorError, ResumeStrategy,
};
use crate::provider::{ProviderRegistry, TaskClassifier};
use crate::store::StateStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] phasor_types::error::StateStoreError),

    #[error("task classification failed: {0}")]
    Classifier(String),
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Everything `handle_task` produced: how the task was classified, what was
/// matched, and how the execution went.
#[derive(Debug)]
pub struct TaskOutcome {
    pub classified: ClassifiedTask,
    pub matched: MatchResult,
    pub execution: ExecutionOutcome,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One engine instance: a catalog directory, a provider registry, a state
/// store, and a classifier.
pub struct WorkflowEngine<S: StateStore> {
    catalog: WorkflowCatalog,
    matcher: WorkflowMatcher,
    orchestrator: Orchestrator<S>,
    registry: Arc<ProviderRegistry>,
    classifier: Box<dyn TaskClassifier>,
    config: EngineConfig,
}

impl<S: StateStore> WorkflowEngine<S> {
    pub fn new(
        catalog_dir: impl Into<PathBuf>,
        store: S,
        registry: Arc<ProviderRegistry>,
        classifier: Box<dyn TaskClassifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog: WorkflowCatalog::new(catalog_dir),
            matcher: WorkflowMatcher::new(&config),
            orchestrator: Orchestrator::new(store, Arc::clone(&registry), config.clone()),
            registry,
            classifier,
            config,
        }
    }

    /// Classify a task, pick the best workflow, and execute it.
    pub async fn handle_task(&self, task_text: &str) -> Result<TaskOutcome, EngineError> {
        let classified = self
            .classifier
            .classify(task_text)
            .await
            .map_err(|e| EngineError::Classifier(e.to_string()))?;
        tracing::debug!(
            intent = classified.intent.as_str(),
            complexity = ?classified.complexity,
            "task classified"
        );

        let entries = self.catalog.load_entries()?;
        let candidates: Vec<_> = entries.iter().map(|(_, def)| Arc::clone(def)).collect();
        let history = self
            .orchestrator
            .store()
            .query_history(&HistoryFilter::default())
            .await?;

        let matched =
            self.matcher
                .recommend(&classified, &candidates, &history, self.registry.as_ref())?;

        let definition = Arc::clone(&matched.recommendation.definition);
        let workflow_file = entries
            .iter()
            .find(|(_, def)| Arc::ptr_eq(def, &definition))
            .map(|(path, _)| path.display().to_string());

        let execution = self
            .orchestrator
            .execute(&definition, workflow_file, task_text)
            .await?;

        Ok(TaskOutcome {
            classified,
            matched,
            execution,
        })
    }

    /// Resume the current run, looking its definition up in the catalog.
    pub async fn resume(&self, strategy: ResumeStrategy) -> Result<ExecutionOutcome, EngineError> {
        let run = self
            .orchestrator
            .store()
            .load_current()
            .await?
            .ok_or(OrchestratorError::NoCurrentRun)?;
        let entries = self.catalog.load_entries()?;
        let definition = entries
            .iter()
            .map(|(_, def)| def)
            .find(|def| def.metadata.name == run.workflow_name)
            .ok_or_else(|| OrchestratorError::WorkflowMismatch {
                run: run.workflow_name.clone(),
                definition: "<not in catalog>".to_string(),
            })?;
        Ok(self.orchestrator.resume(definition, strategy).await?)
    }

    /// Roll the current run back and close it out.
    pub async fn rollback(&self) -> Result<ExecutionOutcome, EngineError> {
        Ok(self.orchestrator.rollback().await?)
    }

    /// Drop history entries older than the configured retention window.
    /// Returns how many were removed.
    pub async fn prune_history(&self) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - Duration::days(self.config.history_retention_days);
        let removed = self.orchestrator.store().prune_history(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "pruned old history entries");
        }
        Ok(removed)
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn orchestrator(&self) -> &Orchestrator<S> {
        &self.orchestrator
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxedResult, CapabilityProvider, InvocationContext};
    use crate::store::MemoryStateStore;
    use phasor_types::error::ProviderError;
    use phasor_types::run::RunStatus;
    use phasor_types::workflow::ComplexityTier;
    use serde_json::{Value, json};
    use std::pin::Pin;

    /// Classifier that keys intent off a leading word in the task text.
    struct WordClassifier;

    impl TaskClassifier for WordClassifier {
        fn classify<'a>(
            &'a self,
            description: &'a str,
        ) -> Pin<
            Box<
                dyn std::future::Future<Output = Result<ClassifiedTask, ProviderError>>
                    + Send
                    + 'a,
            >,
        > {
            Box::pin(async move {
                let intent = description
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_lowercase();
                let keywords = description
                    .split_whitespace()
                    .map(|w| w.to_lowercase())
                    .collect();
                Ok(ClassifiedTask {
                    intent,
                    complexity: ComplexityTier::Small,
                    keywords,
                    estimated_duration_minutes: 45,
                })
            })
        }
    }

    struct OkProvider;

    impl CapabilityProvider for OkProvider {
        fn id(&self) -> &str {
            "worker"
        }
        fn invoke(&self, _action: &str, _ctx: InvocationContext) -> BoxedResult<'_, Value> {
            Box::pin(async { Ok(json!({"done": 1})) })
        }
    }

    const BUGFIX: &str = r#"
metadata:
  name: bugfix-flow
  description: Reproduce and fix a bug
  intendedFor: [bugfix]
  complexityTier: small
  estimatedDurationMinutes: 45
  keywords: [fix, bug]
phases:
  - id: fix
    name: Fix
    capabilityInvocations:
      - providerId: worker
        actionId: go
"#;

    const MIGRATION: &str = r#"
metadata:
  name: migration-flow
  description: Run a schema migration
  intendedFor: [migration]
  complexityTier: large
  estimatedDurationMinutes: 240
  keywords: [schema, database]
phases:
  - id: migrate
    name: Migrate
    capabilityInvocations:
      - providerId: worker
        actionId: go
"#;

    fn engine(dir: &std::path::Path) -> WorkflowEngine<MemoryStateStore> {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(OkProvider));
        WorkflowEngine::new(
            dir,
            MemoryStateStore::new(),
            Arc::new(registry),
            Box::new(WordClassifier),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn task_text_flows_through_to_a_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bugfix.yaml"), BUGFIX).unwrap();
        std::fs::write(dir.path().join("migration.yaml"), MIGRATION).unwrap();

        let engine = engine(dir.path());
        let outcome = engine.handle_task("bugfix the login bug").await.unwrap();

        assert_eq!(outcome.classified.intent, "bugfix");
        assert_eq!(
            outcome.matched.recommendation.definition.metadata.name,
            "bugfix-flow"
        );
        assert_eq!(outcome.execution.status, RunStatus::Completed);

        // subsequent runs see the first in history
        let history = engine
            .orchestrator()
            .store()
            .query_history(&HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].workflow_name == "bugfix-flow");
    }

    #[tokio::test]
    async fn unmatched_task_reports_no_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("migration.yaml"), MIGRATION).unwrap();

        let engine = engine(dir.path());
        let err = engine.handle_task("juggle some oranges").await.unwrap_err();
        assert!(matches!(err, EngineError::Match(MatchError::NoWorkflowMatch { .. })));
    }

    #[tokio::test]
    async fn resume_without_current_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine.resume(ResumeStrategy::RetryCurrent).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Orchestrator(OrchestratorError::NoCurrentRun)
        ));
    }

    #[tokio::test]
    async fn prune_history_is_a_noop_on_fresh_history() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bugfix.yaml"), BUGFIX).unwrap();
        let engine = engine(dir.path());
        engine.handle_task("bugfix the login bug").await.unwrap();
        assert_eq!(engine.prune_history().await.unwrap(), 0);
    }
}
