//! Workflow matcher: scores the catalog against a classified task.
//!
//! Each candidate gets a score in `[0, 1]` from six weighted factors
//! (intent membership, complexity tier, keyword overlap, duration closeness,
//! historical preference, resource availability). The ranking is fully
//! deterministic: a given `(task, catalog, history)` triple always produces
//! the same recommendation, with catalog declaration order breaking ties.
//!
//! A top score below the configured confidence threshold is reported as
//! "no match" rather than returned as a low-confidence guess.

use std::collections::HashSet;
use std::sync::Arc;

use phasor_types::config::{EngineConfig, MatchWeights};
use phasor_types::run::HistoryEntry;
use phasor_types::workflow::{ClassifiedTask, WorkflowDefinition};
use thiserror::Error;

use crate::provider::AvailabilityProbe;

/// Denominator (minutes) for the duration-closeness factor.
const DURATION_SPREAD_MINUTES: f64 = 180.0;

/// History factor applied when no similar past runs exist.
const HISTORY_NEUTRAL: f64 = 0.5;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from workflow matching.
#[derive(Debug, Error)]
pub enum MatchError {
    /// No candidate reached the confidence threshold.
    #[error("no workflow matched the task (best score {best_score:.2}, threshold {threshold:.2})")]
    NoWorkflowMatch { best_score: f64, threshold: f64 },
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Per-factor contributions making up a candidate's score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub intent: f64,
    pub complexity: f64,
    pub keywords: f64,
    pub duration: f64,
    pub history: f64,
    pub availability: f64,
}

impl ScoreBreakdown {
    /// Weighted sum, capped at 1.0.
    pub fn total(&self) -> f64 {
        (self.intent
            + self.complexity
            + self.keywords
            + self.duration
            + self.history
            + self.availability)
            .min(1.0)
    }
}

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Ranked match output: the recommendation plus up to three alternatives.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub recommendation: ScoredWorkflow,
    pub alternatives: Vec<ScoredWorkflow>,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Scores and ranks cataloged workflows against a classified task.
pub struct WorkflowMatcher {
    weights: MatchWeights,
    confidence_threshold: f64,
}

impl WorkflowMatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            confidence_threshold: config.confidence_threshold,
        }
    }

    /// Rank the catalog against `task` and return the best candidate.
    ///
    /// `catalog` order is significant: candidates with equal scores keep
    /// their catalog position in the ranking.
    pub fn recommend(
        &self,
        task: &ClassifiedTask,
        catalog: &[Arc<WorkflowDefinition>],
        history: &[HistoryEntry],
        probe: &dyn AvailabilityProbe,
    ) -> Result<MatchResult, MatchError> {
        let similar = similar_entries(task, history);

        let mut scored: Vec<ScoredWorkflow> = catalog
            .iter()
            .map(|def| {
                let breakdown = self.score(task, def, &similar, probe);
                ScoredWorkflow {
                    definition: Arc::clone(def),
                    score: breakdown.total(),
                    breakdown,
                }
            })
            .collect();

        // Stable sort keeps catalog declaration order among equal scores.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        let candidates = scored.len();
        let mut iter = scored.into_iter();
        let Some(recommendation) = iter.next() else {
            return Err(MatchError::NoWorkflowMatch {
                best_score: 0.0,
                threshold: self.confidence_threshold,
            });
        };
        if recommendation.score < self.confidence_threshold {
            return Err(MatchError::NoWorkflowMatch {
                best_score: recommendation.score,
                threshold: self.confidence_threshold,
            });
        }

        tracing::debug!(
            workflow = recommendation.definition.metadata.name.as_str(),
            score = recommendation.score,
            candidates,
            "workflow recommendation"
        );

        let alternatives = iter.take(3).collect();
        Ok(MatchResult {
            recommendation,
            alternatives,
        })
    }

    fn score(
        &self,
        task: &ClassifiedTask,
        def: &WorkflowDefinition,
        similar: &[&HistoryEntry],
        probe: &dyn AvailabilityProbe,
    ) -> ScoreBreakdown {
        let w = &self.weights;
        let meta = &def.metadata;

        let intent = if meta
            .intended_for
            .iter()
            .any(|i| i.eq_ignore_ascii_case(&task.intent))
        {
            w.intent
        } else {
            0.0
        };

        let complexity = if meta.complexity == task.complexity {
            w.complexity_exact
        } else if meta.complexity.is_adjacent(task.complexity) {
            w.complexity_adjacent
        } else {
            0.0
        };

        let keywords = w.keywords * keyword_overlap(&meta.keywords, &task.keywords);

        let delta =
            (meta.estimated_duration_minutes as f64 - task.estimated_duration_minutes as f64).abs();
        let duration = w.duration * (1.0 - delta / DURATION_SPREAD_MINUTES).max(0.0);

        let history_factor = if similar.is_empty() {
            HISTORY_NEUTRAL
        } else {
            let own = similar
                .iter()
                .filter(|e| e.workflow_name == meta.name)
                .count();
            own as f64 / similar.len() as f64
        };
        let history = w.history * history_factor;

        let availability = w.availability * available_fraction(def, probe);

        ScoreBreakdown {
            intent,
            complexity,
            keywords,
            duration,
            history,
            availability,
        }
    }
}

/// `|a ∩ b| / max(|a|, |b|)`, case-insensitive; 0 when either set is empty.
fn keyword_overlap(workflow: &[String], task: &[String]) -> f64 {
    if workflow.is_empty() || task.is_empty() {
        return 0.0;
    }
    let wf: HashSet<String> = workflow.iter().map(|k| k.to_lowercase()).collect();
    let t: HashSet<String> = task.iter().map(|k| k.to_lowercase()).collect();
    let overlap = wf.intersection(&t).count();
    overlap as f64 / wf.len().max(t.len()) as f64
}

/// Fraction of the workflow's required capabilities and services that are
/// currently resolvable. 1.0 when the workflow requires nothing.
fn available_fraction(def: &WorkflowDefinition, probe: &dyn AvailabilityProbe) -> f64 {
    let total = def.required.capabilities.len() + def.required.external_services.len();
    if total == 0 {
        return 1.0;
    }
    let available = def
        .required
        .capabilities
        .iter()
        .filter(|c| probe.is_capability_available(c))
        .count()
        + def
            .required
            .external_services
            .iter()
            .filter(|s| probe.is_service_available(s))
            .count();
    available as f64 / total as f64
}

/// History entries whose task description shares at least one keyword with
/// the classified task.
fn similar_entries<'a>(task: &ClassifiedTask, history: &'a [HistoryEntry]) -> Vec<&'a HistoryEntry> {
    if task.keywords.is_empty() {
        return Vec::new();
    }
    let keywords: Vec<String> = task.keywords.iter().map(|k| k.to_lowercase()).collect();
    history
        .iter()
        .filter(|entry| {
            let desc = entry.task_description.to_lowercase();
            let tokens: HashSet<&str> = desc
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect();
            keywords.iter().any(|k| tokens.contains(k.as_str()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
