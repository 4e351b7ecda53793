//! Execution orchestrator: drives a run phase by phase.
//!
//! The run state machine is `Initializing -> Executing <-> Paused ->
//! Completed`, with `Executing -> Error -> RolledBack` on the failure side.
//! Phases execute strictly in resolved dependency order; each phase's
//! invocation sequence races against its timeout, and the outcome is routed
//! through the phase's declared timeout/failure policy.
//!
//! Every state transition is persisted before the orchestrator acts on it
//! (write-before-acknowledge), so a crash loses at most the phase in flight.
//! A timed-out invocation future is dropped at the timeout boundary; its
//! result, if the provider eventually produces one, is never applied to the
//! run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use phasor_types::config::EngineConfig;
use phasor_types::error::ProviderError;
use phasor_types::run::{Checkpoint, HistoryEntry, RunError, RunErrorKind, RunStatus, WorkflowRun};
use phasor_types::workflow::{FailurePolicy, Phase, TimeoutPolicy, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::provider::{AvailabilityProbe, InvocationContext, ProviderRegistry};
use crate::resolver::{ResolverError, resolve_order};
use crate::store::StateStore;

/// Multiplier applied to the phase timeout on `TimeoutPolicy::Extend`.
const EXTEND_FACTOR_PERCENT: u64 = 150;

/// Extended timeout for the retry attempt, saturating instead of
/// overflowing for very large configured timeouts.
fn extended_timeout_ms(timeout_ms: u64) -> u64 {
    timeout_ms
        .checked_mul(EXTEND_FACTOR_PERCENT)
        .map_or(u64::MAX, |scaled| scaled / 100)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Required capabilities or services are missing; no run was created.
    #[error("prerequisites not met: {0}")]
    PrerequisitesNotMet(String),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Store(#[from] phasor_types::error::StateStoreError),

    /// A non-terminal run already occupies the current-run slot.
    #[error("run {0} is already active")]
    RunAlreadyActive(Uuid),

    /// No current run exists for resume/rollback/cancel.
    #[error("no current run")]
    NoCurrentRun,

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// Resume requested on a run that is not paused or errored.
    #[error("cannot resume a run in status {0:?}")]
    InvalidResumeState(RunStatus),

    /// Checkpoint ID does not exist on the current run.
    #[error("checkpoint {0} not found on the current run")]
    InvalidCheckpoint(Uuid),

    /// The supplied definition does not match the current run's workflow.
    #[error("current run executes '{run}', not '{definition}'")]
    WorkflowMismatch { run: String, definition: String },
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Why the orchestrator is asking the caller for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Timeout,
    Failure,
}

/// Returned with a `Paused` outcome when a `prompt` policy fires. The caller
/// answers by invoking [`Orchestrator::resume`] with a strategy.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub phase_id: String,
    pub reason: DecisionReason,
    pub message: String,
}

/// How to continue a paused or errored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Re-run the phase that was executing when the run stopped.
    RetryCurrent,
    /// Un-complete the most recently completed phase and re-run it.
    RetryPrevious,
    /// Skip the stopped phase and continue with the next one.
    SkipCurrent,
    /// Roll back to the given checkpoint, then resume forward from there.
    FromCheckpoint(Uuid),
}

/// Aggregated view of a run's results.
///
/// Numeric fields appearing across phase outputs are summed by key;
/// `recommendations` and `next_steps` string lists are concatenated in
/// phase-completion order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub phases_completed: u32,
    pub phases_skipped: u32,
    pub phases_failed: u32,
    pub duration_ms: u64,
    pub totals: HashMap<String, f64>,
    pub recommendations: Vec<String>,
    pub next_steps: Vec<String>,
}

impl RunReport {
    pub fn from_run(run: &WorkflowRun) -> Self {
        let mut totals = HashMap::new();
        let mut recommendations = Vec::new();
        let mut next_steps = Vec::new();

        // completion order keeps the concatenated lists deterministic
        for phase_id in &run.completed_phases {
            let Some(Value::Object(map)) = run.results.get(phase_id) else {
                continue;
            };
            for (key, value) in map {
                if let Some(n) = value.as_f64() {
                    *totals.entry(key.clone()).or_insert(0.0) += n;
                } else if let Value::Array(items) = value {
                    let dest = match key.as_str() {
                        "recommendations" => &mut recommendations,
                        "next_steps" | "nextSteps" => &mut next_steps,
                        _ => continue,
                    };
                    for item in items {
                        if let Value::String(s) = item {
                            dest.push(s.clone());
                        }
                    }
                }
            }
        }

        Self {
            phases_completed: run.completed_phases.len() as u32,
            phases_skipped: run.skipped_phases.len() as u32,
            phases_failed: run.failed_phases.len() as u32,
            duration_ms: run.duration_ms(),
            totals,
            recommendations,
            next_steps,
        }
    }
}

/// What an `execute`/`resume`/`rollback` call produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub report: RunReport,
    /// Present when the run paused on a `prompt` policy.
    pub decision: Option<DecisionRequest>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn from_run(run: &WorkflowRun, decision: Option<DecisionRequest>) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            report: RunReport::from_run(run),
            decision,
            error: run.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase execution internals
// ---------------------------------------------------------------------------

struct PhaseFailure {
    kind: RunErrorKind,
    message: String,
}

struct PhaseSuccess {
    output: Value,
    /// (provider_id, service_id) pairs actually invoked.
    used: Vec<(String, Option<String>)>,
}

enum PhaseControl {
    Advance { completed: bool },
    Repeat,
    Pause(DecisionRequest),
    Abort(RunError),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives workflow runs against registered capability providers, persisting
/// every transition through the state store.
pub struct Orchestrator<S: StateStore> {
    store: S,
    registry: Arc<ProviderRegistry>,
    config: EngineConfig,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<S: StateStore> Orchestrator<S> {
    pub fn new(store: S, registry: Arc<ProviderRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
            cancellations: DashMap::new(),
        }
    }

    /// The underlying state store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute a workflow against a task, start to finish (or until a pause,
    /// error, or cancellation stops it).
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        workflow_file: Option<String>,
        task_description: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let missing = self.missing_prerequisites(definition);
        if !missing.is_empty() {
            return Err(OrchestratorError::PrerequisitesNotMet(missing.join(", ")));
        }

        if let Some(existing) = self.store.load_current().await? {
            if !existing.status.is_terminal() {
                return Err(OrchestratorError::RunAlreadyActive(existing.id));
            }
        }

        let plan: Vec<Phase> = definition.all_phases().cloned().collect();
        let order: Vec<Phase> = resolve_order(&plan)?.into_iter().cloned().collect();

        let run = WorkflowRun::new(
            definition.metadata.name.clone(),
            workflow_file,
            task_description,
            order.len() as u32,
        );
        self.store.save_current(&run).await?;
        tracing::info!(
            run_id = %run.id,
            workflow = definition.metadata.name.as_str(),
            phases = order.len(),
            "starting workflow run"
        );

        self.drive(definition, run, &order).await
    }

    /// Continue a paused or errored run with an explicit strategy.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        strategy: ResumeStrategy,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut run = self
            .store
            .load_current()
            .await?
            .ok_or(OrchestratorError::NoCurrentRun)?;
        if !run.status.is_resumable() {
            return Err(OrchestratorError::InvalidResumeState(run.status));
        }
        if run.workflow_name != definition.metadata.name {
            return Err(OrchestratorError::WorkflowMismatch {
                run: run.workflow_name.clone(),
                definition: definition.metadata.name.clone(),
            });
        }

        match strategy {
            ResumeStrategy::RetryCurrent => {}
            ResumeStrategy::RetryPrevious => {
                if let Some(last) = run.completed_phases.pop() {
                    run.results.remove(&last);
                }
            }
            ResumeStrategy::SkipCurrent => {
                if let Some(current) = run.current_phase.take() {
                    run.record_skipped(&current);
                }
            }
            ResumeStrategy::FromCheckpoint(checkpoint_id) => {
                self.rollback_to_checkpoint(&mut run, checkpoint_id).await?;
            }
        }

        // Saved as Paused: the phase loop marks the run Executing only
        // together with the phase it is about to run.
        run.error = None;
        run.finished_at = None;
        run.status = RunStatus::Paused;
        self.store.save_current(&run).await?;
        tracing::info!(run_id = %run.id, ?strategy, "resuming workflow run");

        let plan: Vec<Phase> = definition.all_phases().cloned().collect();
        let order: Vec<Phase> = resolve_order(&plan)?.into_iter().cloned().collect();
        self.drive(definition, run, &order).await
    }

    /// Roll the current run back to its earliest checkpoint (a no-op revert
    /// when none exist) and close it out. A rolled-back run is terminal and
    /// cannot be resumed.
    pub async fn rollback(&self) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut run = self
            .store
            .load_current()
            .await?
            .ok_or(OrchestratorError::NoCurrentRun)?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::InvalidResumeState(run.status));
        }

        if let Some(earliest) = run.checkpoints.first().map(|c| c.id) {
            self.rollback_to_checkpoint(&mut run, earliest).await?;
        }

        run.status = RunStatus::RolledBack;
        run.current_phase = None;
        run.finished_at = Some(Utc::now());
        self.store.save_current(&run).await?;
        self.store.append_history(&HistoryEntry::from_run(&run)).await?;
        self.store.clear_current().await?;
        tracing::info!(run_id = %run.id, "run rolled back");
        Ok(ExecutionOutcome::from_run(&run, None))
    }

    /// Request cancellation of an in-flight run. Takes effect before the
    /// next phase begins; the phase currently executing is not interrupted.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        let token = self
            .cancellations
            .get(&run_id)
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut run: WorkflowRun,
        order: &[Phase],
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let token = CancellationToken::new();
        self.cancellations.insert(run.id, token.clone());
        let result = self.drive_inner(definition, &mut run, order, &token).await;
        self.cancellations.remove(&run.id);
        result
    }

    async fn drive_inner(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        order: &[Phase],
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut idx = 0;
        while idx < order.len() {
            let phase = &order[idx];
            if run.completed_phases.iter().any(|p| p == &phase.id)
                || run.skipped_phases.iter().any(|p| p == &phase.id)
            {
                idx += 1;
                continue;
            }

            if token.is_cancelled() {
                run.status = RunStatus::Paused;
                run.current_phase = None;
                self.store.save_current(run).await?;
                tracing::info!(run_id = %run.id, "run cancelled, pausing before next phase");
                return Ok(ExecutionOutcome::from_run(run, None));
            }

            // Optional phases with missing required providers are dropped up
            // front instead of failing.
            if (phase.optional || phase.skip_if_unavailable)
                && !self.phase_resources_available(phase)
            {
                tracing::warn!(
                    run_id = %run.id,
                    phase = phase.id.as_str(),
                    "skipping optional phase, required provider unavailable"
                );
                run.record_skipped(&phase.id);
                run.results.insert(
                    phase.id.clone(),
                    serde_json::json!({
                        "skipped": true,
                        "warning": "required provider unavailable",
                    }),
                );
                self.store.save_current(run).await?;
                idx += 1;
                continue;
            }

            run.status = RunStatus::Executing;
            run.current_phase = Some(phase.id.clone());
            self.store.save_current(run).await?;

            match self.execute_phase(definition, phase, run).await {
                PhaseControl::Advance { completed } => {
                    self.store.save_current(run).await?;
                    if completed {
                        self.maybe_checkpoint(phase, run).await?;
                    }
                    idx += 1;
                }
                PhaseControl::Repeat => {
                    self.store.save_current(run).await?;
                }
                PhaseControl::Pause(decision) => {
                    run.status = RunStatus::Paused;
                    self.store.save_current(run).await?;
                    tracing::info!(
                        run_id = %run.id,
                        phase = decision.phase_id.as_str(),
                        reason = ?decision.reason,
                        "run paused awaiting decision"
                    );
                    return Ok(ExecutionOutcome::from_run(run, Some(decision)));
                }
                PhaseControl::Abort(error) => {
                    run.record_failed(&phase.id);
                    run.mark_error(error);
                    self.store.save_current(run).await?;
                    self.store.append_history(&HistoryEntry::from_run(run)).await?;
                    tracing::error!(
                        run_id = %run.id,
                        phase = phase.id.as_str(),
                        "run aborted"
                    );
                    return Ok(ExecutionOutcome::from_run(run, None));
                }
            }
        }

        run.mark_completed();
        self.store.save_current(run).await?;
        self.store.append_history(&HistoryEntry::from_run(run)).await?;
        self.store.clear_current().await?;
        tracing::info!(
            run_id = %run.id,
            phases = run.completed_phases.len(),
            duration_ms = run.duration_ms(),
            "workflow run completed"
        );
        Ok(ExecutionOutcome::from_run(run, None))
    }

    async fn execute_phase(
        &self,
        definition: &WorkflowDefinition,
        phase: &Phase,
        run: &mut WorkflowRun,
    ) -> PhaseControl {
        let timeout_ms = definition.timeout_ms(phase);
        let raced = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.run_invocations(run, phase),
        )
        .await;

        match raced {
            Ok(Ok(success)) => {
                Self::complete_phase(run, phase, success);
                PhaseControl::Advance { completed: true }
            }
            Ok(Err(failure)) => self.apply_failure_policy(definition, phase, run, failure),
            Err(_) => {
                self.apply_timeout_policy(definition, phase, run, timeout_ms)
                    .await
            }
        }
    }

    /// Run a phase's invocations sequentially, merging provider outputs.
    ///
    /// Object outputs are flattened into the phase output map; scalar and
    /// array outputs are keyed by action ID.
    async fn run_invocations(
        &self,
        run: &WorkflowRun,
        phase: &Phase,
    ) -> Result<PhaseSuccess, PhaseFailure> {
        let mut merged = serde_json::Map::new();
        let mut used = Vec::new();

        for inv in &phase.invocations {
            let available = self.registry.is_capability_available(&inv.provider_id)
                && inv
                    .service_id
                    .as_deref()
                    .map_or(true, |s| self.registry.is_service_available(s));

            if !available {
                if inv.is_required() {
                    return Err(PhaseFailure {
                        kind: RunErrorKind::CapabilityUnavailable,
                        message: format!(
                            "required capability '{}' unavailable in phase '{}'",
                            inv.provider_id, phase.id
                        ),
                    });
                }
                tracing::warn!(
                    run_id = %run.id,
                    phase = phase.id.as_str(),
                    provider = inv.provider_id.as_str(),
                    "skipping optional invocation, provider unavailable"
                );
                merged.insert(
                    format!("warning_{}", inv.action_id),
                    Value::String(format!(
                        "skipped '{}': provider '{}' unavailable",
                        inv.action_id, inv.provider_id
                    )),
                );
                continue;
            }

            let provider = self.registry.get(&inv.provider_id).map_err(|e| PhaseFailure {
                kind: RunErrorKind::CapabilityUnavailable,
                message: e.to_string(),
            })?;
            let ctx = InvocationContext {
                run_id: run.id,
                workflow_name: run.workflow_name.clone(),
                phase_id: phase.id.clone(),
                task_description: run.task_description.clone(),
                prior_results: run.results.clone(),
            };
            match provider.invoke(&inv.action_id, ctx).await {
                Ok(Value::Object(map)) => {
                    for (k, v) in map {
                        merged.insert(k, v);
                    }
                }
                Ok(Value::Null) => {}
                Ok(other) => {
                    merged.insert(inv.action_id.clone(), other);
                }
                Err(e) => {
                    let kind = match e {
                        ProviderError::Unavailable(_) => RunErrorKind::CapabilityUnavailable,
                        _ => RunErrorKind::PhaseError,
                    };
                    return Err(PhaseFailure {
                        kind,
                        message: e.to_string(),
                    });
                }
            }
            used.push((inv.provider_id.clone(), inv.service_id.clone()));
        }

        Ok(PhaseSuccess {
            output: Value::Object(merged),
            used,
        })
    }

    // current_phase keeps naming the just-finished phase until the loop
    // assigns the next one; an Executing snapshot always carries a phase.
    fn complete_phase(run: &mut WorkflowRun, phase: &Phase, success: PhaseSuccess) {
        for (provider, service) in &success.used {
            run.record_usage(provider, service.as_deref());
        }
        run.record_completed(&phase.id, success.output);
        tracing::info!(run_id = %run.id, phase = phase.id.as_str(), "phase completed");
    }

    fn apply_failure_policy(
        &self,
        definition: &WorkflowDefinition,
        phase: &Phase,
        run: &mut WorkflowRun,
        failure: PhaseFailure,
    ) -> PhaseControl {
        match definition.failure_policy(phase) {
            FailurePolicy::Retry => {
                let count = run.retry_counts.entry(phase.id.clone()).or_insert(0);
                if *count < definition.defaults.max_retries {
                    *count += 1;
                    tracing::warn!(
                        run_id = %run.id,
                        phase = phase.id.as_str(),
                        attempt = *count,
                        max = definition.defaults.max_retries,
                        "phase failed, retrying"
                    );
                    PhaseControl::Repeat
                } else {
                    PhaseControl::Abort(RunError::new(
                        failure.kind,
                        failure.message,
                        Some(phase.id.clone()),
                    ))
                }
            }
            FailurePolicy::Skip => {
                tracing::warn!(
                    run_id = %run.id,
                    phase = phase.id.as_str(),
                    error = failure.message.as_str(),
                    "phase failed, skipping"
                );
                run.record_skipped(&phase.id);
                PhaseControl::Advance { completed: false }
            }
            FailurePolicy::Prompt => PhaseControl::Pause(DecisionRequest {
                phase_id: phase.id.clone(),
                reason: DecisionReason::Failure,
                message: failure.message,
            }),
            FailurePolicy::Abort => PhaseControl::Abort(RunError::new(
                failure.kind,
                failure.message,
                Some(phase.id.clone()),
            )),
        }
    }

    async fn apply_timeout_policy(
        &self,
        definition: &WorkflowDefinition,
        phase: &Phase,
        run: &mut WorkflowRun,
        timeout_ms: u64,
    ) -> PhaseControl {
        let timeout_error = || {
            RunError::new(
                RunErrorKind::PhaseTimeout,
                format!("phase '{}' exceeded {timeout_ms}ms timeout", phase.id),
                Some(phase.id.clone()),
            )
        };

        match definition.timeout_policy(phase) {
            TimeoutPolicy::Extend => {
                let extended = extended_timeout_ms(timeout_ms);
                tracing::warn!(
                    run_id = %run.id,
                    phase = phase.id.as_str(),
                    extended_ms = extended,
                    "phase timed out, retrying once with extended timeout"
                );
                match tokio::time::timeout(
                    Duration::from_millis(extended),
                    self.run_invocations(run, phase),
                )
                .await
                {
                    Ok(Ok(success)) => {
                        Self::complete_phase(run, phase, success);
                        PhaseControl::Advance { completed: true }
                    }
                    Ok(Err(failure)) => self.apply_failure_policy(definition, phase, run, failure),
                    Err(_) => PhaseControl::Abort(timeout_error()),
                }
            }
            TimeoutPolicy::Skip => {
                tracing::warn!(
                    run_id = %run.id,
                    phase = phase.id.as_str(),
                    "phase timed out, skipping"
                );
                run.record_skipped(&phase.id);
                PhaseControl::Advance { completed: false }
            }
            TimeoutPolicy::Prompt => PhaseControl::Pause(DecisionRequest {
                phase_id: phase.id.clone(),
                reason: DecisionReason::Timeout,
                message: format!("phase '{}' exceeded {timeout_ms}ms timeout", phase.id),
            }),
            TimeoutPolicy::Abort => PhaseControl::Abort(timeout_error()),
        }
    }

    // -----------------------------------------------------------------------
    // Checkpoints and rollback
    // -----------------------------------------------------------------------

    /// Create a checkpoint when the completed-phase count hits the
    /// configured interval. The snapshot collects each of the phase's
    /// providers' opaque state, keyed by provider ID.
    async fn maybe_checkpoint(
        &self,
        phase: &Phase,
        run: &mut WorkflowRun,
    ) -> Result<(), OrchestratorError> {
        let interval = self.config.checkpoint_interval as usize;
        if interval == 0 || run.completed_phases.len() % interval != 0 {
            return Ok(());
        }

        let mut snapshot = serde_json::Map::new();
        let mut seen = HashSet::new();
        for inv in &phase.invocations {
            if !seen.insert(inv.provider_id.as_str()) {
                continue;
            }
            if let Ok(provider) = self.registry.get(&inv.provider_id) {
                match provider.snapshot().await {
                    Ok(value) => {
                        snapshot.insert(inv.provider_id.clone(), value);
                    }
                    Err(e) => tracing::warn!(
                        provider = inv.provider_id.as_str(),
                        error = %e,
                        "provider snapshot failed, checkpoint entry omitted"
                    ),
                }
            }
        }

        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            phase_id: phase.id.clone(),
            created_at: Utc::now(),
            snapshot: Value::Object(snapshot),
        };
        tracing::debug!(
            run_id = %run.id,
            checkpoint = %checkpoint.id,
            phase = phase.id.as_str(),
            "checkpoint created"
        );
        run.checkpoints.push(checkpoint);
        self.store.save_current(run).await?;
        Ok(())
    }

    /// Truncate run progress back to a checkpoint and ask providers to
    /// revert their snapshots. Leaves the run `Paused`; the caller decides
    /// whether to resume forward or finish the rollback.
    async fn rollback_to_checkpoint(
        &self,
        run: &mut WorkflowRun,
        checkpoint_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let idx = run
            .checkpoints
            .iter()
            .position(|c| c.id == checkpoint_id)
            .ok_or(OrchestratorError::InvalidCheckpoint(checkpoint_id))?;
        let checkpoint = run.checkpoints[idx].clone();
        run.checkpoints.truncate(idx + 1);

        // If the checkpointed phase itself is no longer completed (a later
        // resume may have popped it), no completed progress predates the
        // checkpoint and everything is dropped.
        let keep = run
            .completed_phases
            .iter()
            .position(|p| p == &checkpoint.phase_id)
            .map_or(0, |pos| pos + 1);
        let removed = run.completed_phases.split_off(keep);
        for phase_id in &removed {
            run.results.remove(phase_id);
            run.retry_counts.remove(phase_id);
        }

        if let Value::Object(map) = &checkpoint.snapshot {
            for (provider_id, provider_snapshot) in map {
                match self.registry.get(provider_id) {
                    Ok(provider) => {
                        if let Err(e) = provider.revert(provider_snapshot).await {
                            tracing::warn!(
                                provider = provider_id.as_str(),
                                error = %e,
                                "provider revert failed"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(
                        provider = provider_id.as_str(),
                        error = %e,
                        "provider gone, snapshot not reverted"
                    ),
                }
            }
        }

        run.current_phase = None;
        run.status = RunStatus::Paused;
        tracing::info!(
            run_id = %run.id,
            checkpoint = %checkpoint_id,
            phase = checkpoint.phase_id.as_str(),
            "rolled back to checkpoint"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    fn missing_prerequisites(&self, definition: &WorkflowDefinition) -> Vec<String> {
        let mut missing = Vec::new();
        for cap in &definition.required.capabilities {
            if !self.registry.is_capability_available(cap) {
                missing.push(format!("capability '{cap}'"));
            }
        }
        for svc in &definition.required.external_services {
            if !self.registry.is_service_available(svc) {
                missing.push(format!("service '{svc}'"));
            }
        }
        missing
    }

    fn phase_resources_available(&self, phase: &Phase) -> bool {
        phase.invocations.iter().filter(|i| i.is_required()).all(|i| {
            self.registry.is_capability_available(&i.provider_id)
                && i.service_id
                    .as_deref()
                    .map_or(true, |s| self.registry.is_service_available(s))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
