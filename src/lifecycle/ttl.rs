//! Importance-weighted time-to-live assignment.
//!
//! Each document lands in a TTL tier keyed by its importance score. The
//! base TTL is stretched by access frequency and recency multipliers and
//! randomized with per-tier jitter so expirations do not stampede.

use rand::Rng;

use crate::config::TtlConfig;
use crate::types::{Metadata, TtlTier};

/// Minimum TTL after all multipliers and jitter.
const MIN_TTL_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
struct TierSpec {
    tier: TtlTier,
    /// None means the tier never expires
    base_ttl: Option<f64>,
    jitter: f64,
    importance_range: (f64, f64),
}

/// Manages TTL tiers and expiry decisions.
#[derive(Debug, Clone)]
pub struct TtlManager {
    tiers: [TierSpec; 5],
}

impl TtlManager {
    pub fn new(config: &TtlConfig) -> Self {
        TtlManager {
            tiers: [
                TierSpec {
                    tier: TtlTier::HighFrequency,
                    base_ttl: Some(config.high_frequency_base),
                    jitter: config.high_frequency_jitter,
                    importance_range: (0.0, 0.3),
                },
                TierSpec {
                    tier: TtlTier::MediumFrequency,
                    base_ttl: Some(config.medium_frequency_base),
                    jitter: config.medium_frequency_jitter,
                    importance_range: (0.3, 0.5),
                },
                TierSpec {
                    tier: TtlTier::LowFrequency,
                    base_ttl: Some(config.low_frequency_base),
                    jitter: config.low_frequency_jitter,
                    importance_range: (0.5, 0.7),
                },
                TierSpec {
                    tier: TtlTier::Static,
                    base_ttl: Some(config.static_base),
                    jitter: config.static_jitter,
                    importance_range: (0.7, 0.95),
                },
                TierSpec {
                    tier: TtlTier::Permanent,
                    base_ttl: None,
                    jitter: 0.0,
                    importance_range: (0.95, 1.0),
                },
            ],
        }
    }

    /// Calculate (tier, ttl_seconds) for a document.
    ///
    /// Returns `(Permanent, f64::INFINITY)` for the permanent tier.
    pub fn calculate_ttl(
        &self,
        importance_score: f64,
        access_count: i64,
        last_accessed: Option<f64>,
        now: f64,
    ) -> (TtlTier, f64) {
        let spec = self
            .tiers
            .iter()
            .find(|spec| {
                let (lo, hi) = spec.importance_range;
                lo <= importance_score && importance_score <= hi
            })
            .copied()
            // Fail-open on out-of-range scores: treat as very low importance.
            .unwrap_or(self.tiers[0]);

        let base_ttl = match spec.base_ttl {
            Some(base) => base,
            None => return (TtlTier::Permanent, f64::INFINITY),
        };

        let access_multiplier = if access_count > 5 {
            (1.0 + (access_count - 5) as f64 * 0.1).min(2.0)
        } else {
            1.0
        };

        let recency_multiplier = match last_accessed {
            Some(last) => {
                let days_since = (now - last) / 86_400.0;
                if days_since < 1.0 {
                    1.5
                } else if days_since > 7.0 {
                    0.7
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let jitter = if spec.jitter > 0.0 {
            rand::thread_rng().gen_range(-spec.jitter..=spec.jitter)
        } else {
            0.0
        };

        let ttl = (base_ttl * access_multiplier * recency_multiplier + jitter).max(MIN_TTL_SECS);
        (spec.tier, ttl)
    }

    /// Whether a document should expire at `now`. Permanent content never
    /// expires; documents without a TTL stamp are kept.
    pub fn should_expire(&self, metadata: &Metadata, now: f64) -> bool {
        if metadata.get_bool("permanent_flag").unwrap_or(false) {
            return false;
        }
        if metadata.ttl_tier() == Some(TtlTier::Permanent) {
            return false;
        }
        match metadata.get_f64("ttl_expiry") {
            Some(expiry) => now > expiry,
            None => false,
        }
    }

    /// Stamp TTL metadata onto a document record.
    pub fn add_ttl_metadata(&self, metadata: &mut Metadata, importance_score: f64, now: f64) {
        let access_count = metadata.get_i64("access_count").unwrap_or(0);
        let last_accessed = metadata.get_f64("last_accessed").or(Some(now));

        let (tier, ttl_seconds) = self.calculate_ttl(importance_score, access_count, last_accessed, now);
        let is_permanent = tier == TtlTier::Permanent || ttl_seconds.is_infinite();

        metadata.insert("ttl_tier", tier.to_string());
        metadata.insert("ttl_created", now);
        metadata.insert("ttl_last_calculated", now);
        metadata.insert("permanent_flag", is_permanent);

        if is_permanent {
            metadata.insert("ttl_seconds", "infinite");
            metadata.remove("ttl_expiry");
            if !metadata.contains_key("permanence_reason") {
                metadata.insert("permanence_reason", "high_importance");
            }
        } else {
            metadata.insert("ttl_seconds", ttl_seconds);
            metadata.insert("ttl_expiry", now + ttl_seconds);
        }
    }
}
