//! Exponential decay of stored importance over wall time.

use crate::config::AgingConfig;
use crate::types::Metadata;

/// Aging and decay of importance scores.
#[derive(Debug, Clone)]
pub struct AgingFunction {
    enabled: bool,
    decay_rate: f64,
    minimum_score: f64,
    refresh_threshold_days: f64,
}

impl AgingFunction {
    pub fn new(config: &AgingConfig) -> Self {
        AgingFunction {
            enabled: config.enabled,
            decay_rate: config.decay_rate,
            minimum_score: config.minimum_score,
            refresh_threshold_days: config.refresh_threshold_days,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn minimum_score(&self) -> f64 {
        self.minimum_score
    }

    /// Age decay factor for a memory created at `timestamp`, in
    /// [minimum_score, 1]. Returns 1.0 when aging is disabled.
    pub fn age_factor(&self, timestamp: f64, now: f64) -> f64 {
        if !self.enabled {
            return 1.0;
        }
        let age_days = (now - timestamp) / 86_400.0;
        (-self.decay_rate * age_days).exp().max(self.minimum_score)
    }

    /// Apply aging to an importance score, floored at half the minimum.
    pub fn apply(&self, score: f64, timestamp: f64, now: f64) -> f64 {
        (score * self.age_factor(timestamp, now)).max(self.minimum_score * 0.5)
    }

    /// Whether a document's stored score is stale enough to refresh, based
    /// on when it was last scored.
    pub fn needs_refresh(&self, metadata: &Metadata, now: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let last_scored = metadata
            .get_f64("importance_scored_at")
            .or_else(|| metadata.get_f64("timestamp"))
            .unwrap_or(now);
        (now - last_scored) / 86_400.0 > self.refresh_threshold_days
    }
}
