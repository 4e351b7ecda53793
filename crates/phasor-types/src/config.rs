//! Engine configuration.
//!
//! `EngineConfig` controls the tunable parts of the engine: match scoring
//! weights and confidence threshold, checkpoint cadence, backup retention,
//! and history retention. Loaded from TOML; every field has a default so an
//! empty document is a valid configuration.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum score for the matcher to return a recommendation at all.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Create a rollback checkpoint every N completed phases.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// How many timestamped state backups to keep for corruption recovery.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// History entries older than this many days are pruned.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: i64,

    /// Match scoring weights.
    #[serde(default)]
    pub weights: MatchWeights,
}

fn default_confidence_threshold() -> f64 {
    0.35
}

fn default_checkpoint_interval() -> u32 {
    3
}

fn default_max_backups() -> usize {
    5
}

fn default_history_retention_days() -> i64 {
    90
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            checkpoint_interval: default_checkpoint_interval(),
            max_backups: default_max_backups(),
            history_retention_days: default_history_retention_days(),
            weights: MatchWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document into a config, applying defaults for anything unset.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }
}

// ---------------------------------------------------------------------------
// MatchWeights
// ---------------------------------------------------------------------------

/// Weights for the matcher's scoring factors.
///
/// The defaults come from the observed behavior of the workflows this engine
/// replaces; they are tunable configuration, not invariants. The sum of the
/// maximum contributions is 1.0 with the default values (complexity counts
/// once, exact or adjacent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchWeights {
    /// Awarded in full when the task intent is in `intended_for`.
    #[serde(default = "default_w_intent")]
    pub intent: f64,
    /// Awarded in full on an exact complexity tier match.
    #[serde(default = "default_w_complexity_exact")]
    pub complexity_exact: f64,
    /// Awarded in full on an adjacent tier match.
    #[serde(default = "default_w_complexity_adjacent")]
    pub complexity_adjacent: f64,
    /// Scaled by keyword overlap ratio.
    #[serde(default = "default_w_keywords")]
    pub keywords: f64,
    /// Scaled by estimated-duration closeness.
    #[serde(default = "default_w_duration")]
    pub duration: f64,
    /// Scaled by the workflow's share of task-similar history entries.
    #[serde(default = "default_w_history")]
    pub history: f64,
    /// Scaled by the fraction of required resources currently available.
    #[serde(default = "default_w_availability")]
    pub availability: f64,
}

fn default_w_intent() -> f64 {
    0.40
}
fn default_w_complexity_exact() -> f64 {
    0.20
}
fn default_w_complexity_adjacent() -> f64 {
    0.10
}
fn default_w_keywords() -> f64 {
    0.15
}
fn default_w_duration() -> f64 {
    0.10
}
fn default_w_history() -> f64 {
    0.10
}
fn default_w_availability() -> f64 {
    0.05
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            intent: default_w_intent(),
            complexity_exact: default_w_complexity_exact(),
            complexity_adjacent: default_w_complexity_adjacent(),
            keywords: default_w_keywords(),
            duration: default_w_duration(),
            history: default_w_history(),
            availability: default_w_availability(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.confidence_threshold, 0.35);
        assert_eq!(config.checkpoint_interval, 3);
        assert_eq!(config.max_backups, 5);
        assert_eq!(config.history_retention_days, 90);
        assert_eq!(config.weights.intent, 0.40);
        assert_eq!(config.weights.availability, 0.05);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let doc = r#"
confidence_threshold = 0.5

[weights]
intent = 0.6
"#;
        let config = EngineConfig::from_toml(doc).unwrap();
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.weights.intent, 0.6);
        // unnamed fields keep defaults
        assert_eq!(config.weights.keywords, 0.15);
        assert_eq!(config.checkpoint_interval, 3);
    }

    #[test]
    fn default_weights_cap_at_one() {
        let w = MatchWeights::default();
        // complexity contributes either exact or adjacent, never both
        let max_score = w.intent + w.complexity_exact + w.keywords + w.duration + w.history + w.availability;
        assert!((max_score - 1.0).abs() < 1e-9);
    }
}
