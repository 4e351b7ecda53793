//! Run state, checkpoints, and execution history records.
//!
//! `WorkflowRun` is the single mutable piece of engine state: it tracks one
//! active run of a workflow against a task. The orchestrator is its only
//! writer. Terminal runs (completed, errored, rolled back) are summarized
//! into an append-only `HistoryEntry` and cleared from the current-run slot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// State machine for a workflow run.
///
/// `Initializing -> Executing <-> Paused -> Completed`;
/// `Executing -> Error -> RolledBack`. `Completed` and `RolledBack` are
/// terminal; `Error` may still be resumed or rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initializing,
    Executing,
    Paused,
    Completed,
    Error,
    RolledBack,
}

impl RunStatus {
    /// Whether the run can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::RolledBack)
    }

    /// Whether a resume request is legal from this status.
    pub fn is_resumable(self) -> bool {
        matches!(self, RunStatus::Paused | RunStatus::Error)
    }
}

// ---------------------------------------------------------------------------
// Run error
// ---------------------------------------------------------------------------

/// Kind of failure recorded on an errored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    PhaseError,
    PhaseTimeout,
    CapabilityUnavailable,
    PrerequisitesNotMet,
    StateIo,
}

/// Error details attached to a run in `Error` status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    /// Phase that was executing when the error occurred, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Whether the run can be resumed or rolled back past this error.
    pub recoverable: bool,
}

impl RunError {
    /// Build an error record stamped with the current time.
    pub fn new(kind: RunErrorKind, message: impl Into<String>, phase: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            phase,
            timestamp: Utc::now(),
            recoverable: !matches!(kind, RunErrorKind::StateIo),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable rollback point captured at configurable phase intervals.
///
/// The snapshot payload is provider-defined and opaque to the engine
/// (file hashes, schema versions, ...). It is only ever handed back to the
/// provider layer during rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7 checkpoint ID.
    pub id: Uuid,
    /// Phase after which this checkpoint was taken.
    pub phase_id: String,
    pub created_at: DateTime<Utc>,
    /// Opaque provider resource snapshot.
    pub snapshot: Value,
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// One execution of a workflow against a task. At most one run is "current"
/// per engine instance; the state store enforces the single slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow definition being executed.
    pub workflow_name: String,
    /// Source file of the definition, when loaded from a catalog directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_file: Option<String>,
    /// The original task description this run serves.
    pub task_description: String,
    pub status: RunStatus,
    /// Phase currently executing (set while status is `Executing`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub skipped_phases: Vec<String>,
    #[serde(default)]
    pub failed_phases: Vec<String>,
    /// Phase ID -> output payload (opaque provider output).
    #[serde(default)]
    pub results: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Phase ID -> number of retries consumed.
    #[serde(default)]
    pub retry_counts: HashMap<String, u32>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Provider IDs invoked so far.
    #[serde(default)]
    pub capabilities_used: Vec<String>,
    /// External service IDs touched so far.
    #[serde(default)]
    pub services_used: Vec<String>,
    /// Total number of phases planned for this run.
    pub total_phases: u32,
}

impl WorkflowRun {
    /// Create a fresh run in `Initializing` status.
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_file: Option<String>,
        task_description: impl Into<String>,
        total_phases: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            workflow_file,
            task_description: task_description.into(),
            status: RunStatus::Initializing,
            current_phase: None,
            started_at: Utc::now(),
            finished_at: None,
            completed_phases: Vec::new(),
            skipped_phases: Vec::new(),
            failed_phases: Vec::new(),
            results: HashMap::new(),
            error: None,
            retry_counts: HashMap::new(),
            checkpoints: Vec::new(),
            capabilities_used: Vec::new(),
            services_used: Vec::new(),
            total_phases,
        }
    }

    /// Record a phase as completed with its output.
    ///
    /// Keeps the invariant that a phase ID is never in both
    /// `completed_phases` and `failed_phases`.
    pub fn record_completed(&mut self, phase_id: &str, output: Value) {
        self.failed_phases.retain(|p| p != phase_id);
        if !self.completed_phases.iter().any(|p| p == phase_id) {
            self.completed_phases.push(phase_id.to_string());
        }
        self.results.insert(phase_id.to_string(), output);
    }

    /// Record a phase as failed.
    pub fn record_failed(&mut self, phase_id: &str) {
        self.completed_phases.retain(|p| p != phase_id);
        if !self.failed_phases.iter().any(|p| p == phase_id) {
            self.failed_phases.push(phase_id.to_string());
        }
    }

    /// Record a phase as skipped.
    pub fn record_skipped(&mut self, phase_id: &str) {
        if !self.skipped_phases.iter().any(|p| p == phase_id) {
            self.skipped_phases.push(phase_id.to_string());
        }
    }

    /// Record a provider (and optionally a service) as used.
    pub fn record_usage(&mut self, provider_id: &str, service_id: Option<&str>) {
        if !self.capabilities_used.iter().any(|c| c == provider_id) {
            self.capabilities_used.push(provider_id.to_string());
        }
        if let Some(svc) = service_id {
            if !self.services_used.iter().any(|s| s == svc) {
                self.services_used.push(svc.to_string());
            }
        }
    }

    /// Mark the run completed, stamping `finished_at`.
    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.current_phase = None;
        self.finished_at = Some(Utc::now());
    }

    /// Mark the run errored with the given error record.
    pub fn mark_error(&mut self, error: RunError) {
        self.status = RunStatus::Error;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration so far (or total, once finished).
    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Append-only summary of one terminal run. Written exactly once per
/// terminal outcome (completed, error, rolled back) and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub workflow_name: String,
    pub task_description: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub phases_completed: u32,
    pub phases_failed: u32,
    pub phases_skipped: u32,
    #[serde(default)]
    pub capabilities_used: Vec<String>,
    #[serde(default)]
    pub services_used: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    /// Summarize a run for the history log.
    pub fn from_run(run: &WorkflowRun) -> Self {
        Self {
            id: run.id,
            workflow_name: run.workflow_name.clone(),
            task_description: run.task_description.clone(),
            status: run.status,
            duration_ms: run.duration_ms(),
            phases_completed: run.completed_phases.len() as u32,
            phases_failed: run.failed_phases.len() as u32,
            phases_skipped: run.skipped_phases.len() as u32,
            capabilities_used: run.capabilities_used.clone(),
            services_used: run.services_used.clone(),
            timestamp: Utc::now(),
            error: run.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    /// Whether an entry passes the filter.
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(name) = &self.workflow_name {
            if &entry.workflow_name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> WorkflowRun {
        WorkflowRun::new("bugfix-flow", Some("bugfix.yaml".to_string()), "fix the login bug", 3)
    }

    #[test]
    fn completed_and_failed_stay_disjoint() {
        let mut run = sample_run();
        run.record_failed("fix");
        run.record_completed("fix", json!({"tests_passed": 12}));
        assert_eq!(run.completed_phases, vec!["fix"]);
        assert!(run.failed_phases.is_empty());

        run.record_failed("fix");
        assert!(run.completed_phases.is_empty());
        assert_eq!(run.failed_phases, vec!["fix"]);
    }

    #[test]
    fn record_completed_is_idempotent() {
        let mut run = sample_run();
        run.record_completed("a", json!(1));
        run.record_completed("a", json!(2));
        assert_eq!(run.completed_phases.len(), 1);
        assert_eq!(run.results["a"], json!(2));
    }

    #[test]
    fn mark_completed_sets_finished_at_after_start() {
        let mut run = sample_run();
        run.mark_completed();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.unwrap() >= run.started_at);
        assert!(run.current_phase.is_none());
    }

    #[test]
    fn mark_error_sets_error() {
        let mut run = sample_run();
        let err = RunError::new(RunErrorKind::PhaseError, "boom", Some("fix".to_string()));
        run.mark_error(err);
        assert_eq!(run.status, RunStatus::Error);
        let recorded = run.error.as_ref().unwrap();
        assert_eq!(recorded.phase.as_deref(), Some("fix"));
        assert!(recorded.recoverable);
    }

    #[test]
    fn state_io_errors_are_not_recoverable() {
        let err = RunError::new(RunErrorKind::StateIo, "disk gone", None);
        assert!(!err.recoverable);
    }

    #[test]
    fn status_predicates() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::RolledBack.is_terminal());
        assert!(!RunStatus::Error.is_terminal());
        assert!(RunStatus::Paused.is_resumable());
        assert!(RunStatus::Error.is_resumable());
        assert!(!RunStatus::Completed.is_resumable());
        assert!(!RunStatus::Executing.is_resumable());
    }

    #[test]
    fn run_json_roundtrip() {
        let mut run = sample_run();
        run.record_completed("reproduce", json!({"filesChanged": 0}));
        run.record_usage("test-runner", Some("ci"));
        run.checkpoints.push(Checkpoint {
            id: Uuid::now_v7(),
            phase_id: "reproduce".to_string(),
            created_at: Utc::now(),
            snapshot: json!({"hash": "abc"}),
        });
        let json_str = serde_json::to_string(&run).unwrap();
        let parsed: WorkflowRun = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.id, run.id);
        assert_eq!(parsed.completed_phases, run.completed_phases);
        assert_eq!(parsed.checkpoints.len(), 1);
        assert_eq!(parsed.capabilities_used, vec!["test-runner"]);
        assert_eq!(parsed.services_used, vec!["ci"]);
    }

    #[test]
    fn history_entry_summarizes_run() {
        let mut run = sample_run();
        run.record_completed("a", json!(null));
        run.record_skipped("b");
        run.mark_completed();
        let entry = HistoryEntry::from_run(&run);
        assert_eq!(entry.workflow_name, "bugfix-flow");
        assert_eq!(entry.status, RunStatus::Completed);
        assert_eq!(entry.phases_completed, 1);
        assert_eq!(entry.phases_skipped, 1);
        assert_eq!(entry.phases_failed, 0);
        assert!(entry.error.is_none());
    }

    #[test]
    fn history_filter_combinations() {
        let mut run = sample_run();
        run.mark_completed();
        let entry = HistoryEntry::from_run(&run);

        let all = HistoryFilter::default();
        assert!(all.matches(&entry));

        let by_name = HistoryFilter {
            workflow_name: Some("bugfix-flow".to_string()),
            ..Default::default()
        };
        assert!(by_name.matches(&entry));

        let wrong_name = HistoryFilter {
            workflow_name: Some("other".to_string()),
            ..Default::default()
        };
        assert!(!wrong_name.matches(&entry));

        let wrong_status = HistoryFilter {
            status: Some(RunStatus::Error),
            ..Default::default()
        };
        assert!(!wrong_status.matches(&entry));

        let future_only = HistoryFilter {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(!future_only.matches(&entry));
    }
}
