//! Filesystem state store.
//!
//! Layout under the store root:
//!
//! ```text
//! root/
//!   current.json          one active run
//!   backups/              timestamped copies of earlier current.json states
//!   history.ndjson        append-only terminal-run log
//! ```
//!
//! `current.json` is replaced atomically (write to a temp file in the same
//! directory, then rename), so readers never observe a partial write. Every
//! save first copies the previous document into `backups/`; if the current
//! document later fails to parse, load falls back to the newest structurally
//! valid backup. A corrupted document with no valid backup is discarded, not
//! trusted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use phasor_types::error::StateStoreError;
use phasor_types::run::{HistoryEntry, HistoryFilter, WorkflowRun};
use phasor_core::store::StateStore;
use tokio::io::AsyncWriteExt;

const CURRENT_FILE: &str = "current.json";
const BACKUP_DIR: &str = "backups";
const HISTORY_FILE: &str = "history.ndjson";

/// Durable state store rooted at a directory.
pub struct FsStateStore {
    root: PathBuf,
    max_backups: usize,
}

impl FsStateStore {
    /// Create a store rooted at `root`, keeping at most `max_backups`
    /// backup documents. Directories are created lazily on first write.
    pub fn new(root: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            root: root.into(),
            max_backups,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn current_path(&self) -> PathBuf {
        self.root.join(CURRENT_FILE)
    }

    fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    /// Copy the existing current document into `backups/` and drop the
    /// oldest backups past the retention limit.
    async fn rotate_backup(&self) -> Result<(), StateStoreError> {
        let current = self.current_path();
        if !tokio::fs::try_exists(&current).await? {
            return Ok(());
        }

        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
        tokio::fs::copy(&current, dir.join(format!("current-{stamp}.json"))).await?;

        let mut backups = self.backup_paths().await?;
        while backups.len() > self.max_backups {
            // sorted ascending, oldest first
            let oldest = backups.remove(0);
            tokio::fs::remove_file(&oldest).await?;
        }
        Ok(())
    }

    /// Backup file paths sorted ascending by name (the timestamp in the
    /// name makes that chronological).
    async fn backup_paths(&self) -> Result<Vec<PathBuf>, StateStoreError> {
        let dir = self.backup_dir();
        let mut paths = Vec::new();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(paths);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Write `content` to `path` atomically via a sibling temp file.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Scan backups newest-first for a structurally valid run.
    async fn recover_from_backups(&self) -> Result<Option<WorkflowRun>, StateStoreError> {
        let mut backups = self.backup_paths().await?;
        backups.reverse();
        for path in backups {
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<WorkflowRun>(&content) {
                Ok(run) => {
                    tracing::warn!(
                        backup = %path.display(),
                        run_id = %run.id,
                        "recovered current run from backup"
                    );
                    // the recovered document becomes the current one again
                    self.write_atomic(&self.current_path(), &content).await?;
                    return Ok(Some(run));
                }
                Err(e) => {
                    tracing::warn!(backup = %path.display(), error = %e, "backup invalid, trying older");
                }
            }
        }
        Ok(None)
    }

    async fn read_history(&self) -> Result<Vec<HistoryEntry>, StateStoreError> {
        let path = self.history_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable history line");
                }
            }
        }
        Ok(entries)
    }
}

impl StateStore for FsStateStore {
    async fn save_current(&self, run: &WorkflowRun) -> Result<(), StateStoreError> {
        let content = serde_json::to_string_pretty(run)?;
        self.rotate_backup().await?;
        self.write_atomic(&self.current_path(), &content).await?;
        tracing::trace!(run_id = %run.id, status = ?run.status, "run state saved");
        Ok(())
    }

    async fn load_current(&self) -> Result<Option<WorkflowRun>, StateStoreError> {
        let path = self.current_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<WorkflowRun>(&content) {
            Ok(run) => Ok(Some(run)),
            Err(parse_err) => {
                tracing::error!(error = %parse_err, "current run state unreadable");
                if let Some(recovered) = self.recover_from_backups().await? {
                    return Ok(Some(recovered));
                }
                // nothing valid anywhere: clear the slot so the engine can
                // start fresh, and report the corruption
                tokio::fs::remove_file(&path).await?;
                Err(StateStoreError::Corruption(format!(
                    "current run state invalid and no valid backup found: {parse_err}"
                )))
            }
        }
    }

    async fn clear_current(&self) -> Result<(), StateStoreError> {
        match tokio::fs::remove_file(self.current_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn query_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<HistoryEntry>, StateStoreError> {
        Ok(self
            .read_history()
            .await?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<usize, StateStoreError> {
        let entries = self.read_history().await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let kept: Vec<&HistoryEntry> = entries
            .iter()
            .filter(|e| e.timestamp >= older_than)
            .collect();
        let removed = entries.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut content = String::new();
        for entry in &kept {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        self.write_atomic(&self.history_path(), &content).await?;
        tracing::debug!(removed, kept = kept.len(), "history pruned");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
