//! State persistence seam.
//!
//! The orchestrator persists through this trait at every state transition:
//! the run is saved *before* the engine acts on the new state, so a crash at
//! any point leaves a resumable record behind. Filesystem-backed stores live
//! in `phasor-infra`; [`MemoryStateStore`] here backs tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use phasor_types::error::StateStoreError;
use phasor_types::run::{HistoryEntry, HistoryFilter, WorkflowRun};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable storage for the current run and the append-only history log.
///
/// There is a single current-run slot. History entries are immutable once
/// appended; `prune_history` is the only operation that removes them.
pub trait StateStore: Send + Sync {
    /// Persist the current run, replacing any previous snapshot.
    fn save_current(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Load the current run, if one exists.
    fn load_current(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, StateStoreError>> + Send;

    /// Clear the current-run slot.
    fn clear_current(
        &self,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Append a terminal-run summary to the history log.
    fn append_history(
        &self,
        entry: &HistoryEntry,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Query history entries matching the filter, oldest first.
    fn query_history(
        &self,
        filter: &HistoryFilter,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryEntry>, StateStoreError>> + Send;

    /// Remove history entries older than the cutoff. Returns how many were
    /// removed.
    fn prune_history(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<usize, StateStoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-durable store for tests and ephemeral engines.
#[derive(Default)]
pub struct MemoryStateStore {
    current: Mutex<Option<WorkflowRun>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// Lock acquisition that survives poisoning from a panicked test thread.
fn recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateStore for MemoryStateStore {
    async fn save_current(&self, run: &WorkflowRun) -> Result<(), StateStoreError> {
        *recover(&self.current) = Some(run.clone());
        Ok(())
    }

    async fn load_current(&self) -> Result<Option<WorkflowRun>, StateStoreError> {
        Ok(recover(&self.current).clone())
    }

    async fn clear_current(&self) -> Result<(), StateStoreError> {
        *recover(&self.current) = None;
        Ok(())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StateStoreError> {
        recover(&self.history).push(entry.clone());
        Ok(())
    }

    async fn query_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<HistoryEntry>, StateStoreError> {
        Ok(recover(&self.history)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<usize, StateStoreError> {
        let mut history = recover(&self.history);
        let before = history.len();
        history.retain(|e| e.timestamp >= older_than);
        Ok(before - history.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use phasor_types::run::RunStatus;

    fn run() -> WorkflowRun {
        WorkflowRun::new("wf", None, "task", 2)
    }

    #[tokio::test]
    async fn current_slot_save_load_clear() {
        let store = MemoryStateStore::new();
        assert!(store.load_current().await.unwrap().is_none());

        let r = run();
        store.save_current(&r).await.unwrap();
        let loaded = store.load_current().await.unwrap().unwrap();
        assert_eq!(loaded.id, r.id);

        store.clear_current().await.unwrap();
        assert!(store.load_current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_previous_run() {
        let store = MemoryStateStore::new();
        let first = run();
        let second = run();
        store.save_current(&first).await.unwrap();
        store.save_current(&second).await.unwrap();
        assert_eq!(store.load_current().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn history_append_query_prune() {
        let store = MemoryStateStore::new();
        let mut r = run();
        r.mark_completed();
        store.append_history(&HistoryEntry::from_run(&r)).await.unwrap();

        let mut errored = run();
        errored.status = RunStatus::Error;
        store
            .append_history(&HistoryEntry::from_run(&errored))
            .await
            .unwrap();

        let all = store.query_history(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let completed_only = store
            .query_history(&HistoryFilter {
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed_only.len(), 1);

        // nothing is older than an hour ago
        let removed = store
            .prune_history(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // everything is older than an hour from now
        let removed = store
            .prune_history(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(
            store
                .query_history(&HistoryFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
