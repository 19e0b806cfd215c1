//! Importance scoring for incoming documents and retrieval ranking for
//! stored chunks.
//!
//! Importance is a scalar in [0, 1] summarizing how much retention and
//! retrieval weight a document deserves. It combines a length term,
//! configurable keyword/regex pattern bonuses, caller-context hints, and
//! permanence triggers. Retrieval scoring blends semantic distance with
//! recency, access frequency, and stored importance.

use regex::Regex;
use tracing::debug;

use crate::config::{DomainPatternConfig, MatchMode, ScoringConfig};
use crate::types::Metadata;

/// Caller-supplied context hints for importance scoring.
pub type ScoreContext = serde_json::Map<String, serde_json::Value>;

/// Boost added when the caller explicitly requests permanence.
const EXPLICIT_PERMANENCE_BOOST: f64 = 0.25;

/// Ceiling applied when the caller explicitly signals `is_important: false`,
/// keeping ephemeral content below the permanent-tier threshold.
const NON_IMPORTANT_CAP: f64 = 0.94;

struct CompiledPattern {
    keywords: Vec<String>,
    regexes: Vec<Regex>,
    bonus: f64,
    match_mode: MatchMode,
}

struct CompiledTrigger {
    keywords: Vec<String>,
    regexes: Vec<Regex>,
    boost: f64,
}

/// Domain pattern matching engine for content analysis.
pub struct DomainPatternEngine {
    patterns: Vec<(String, CompiledPattern)>,
    triggers: Vec<(String, CompiledTrigger)>,
    case_sensitive: bool,
}

impl DomainPatternEngine {
    pub fn new(config: &DomainPatternConfig) -> Self {
        let case_sensitive = config.case_sensitive;

        let compile = |raw: &str| -> Option<Regex> {
            let source = if case_sensitive {
                raw.to_string()
            } else {
                format!("(?i){raw}")
            };
            match Regex::new(&source) {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!(pattern = raw, error = %e, "skipping invalid regex pattern");
                    None
                }
            }
        };

        let normalize = |kw: &str| {
            if case_sensitive {
                kw.to_string()
            } else {
                kw.to_lowercase()
            }
        };

        let patterns = config
            .patterns
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    CompiledPattern {
                        keywords: spec.keywords.iter().map(|k| normalize(k)).collect(),
                        regexes: spec.regex_patterns.iter().filter_map(|r| compile(r)).collect(),
                        bonus: spec.bonus,
                        match_mode: spec.match_mode,
                    },
                )
            })
            .collect();

        let triggers = config
            .permanence_triggers
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    CompiledTrigger {
                        keywords: spec.keywords.iter().map(|k| normalize(k)).collect(),
                        regexes: spec.regex_patterns.iter().filter_map(|r| compile(r)).collect(),
                        boost: spec.boost,
                    },
                )
            })
            .collect();

        DomainPatternEngine {
            patterns,
            triggers,
            case_sensitive,
        }
    }

    fn search_form(&self, content: &str) -> String {
        if self.case_sensitive {
            content.to_string()
        } else {
            content.to_lowercase()
        }
    }

    /// Analyze content against all patterns, returning per-pattern bonuses.
    pub fn analyze_content(&self, content: &str) -> Vec<(String, f64)> {
        let search = self.search_form(content);
        self.patterns
            .iter()
            .filter_map(|(name, pattern)| {
                let bonus = Self::pattern_bonus(&search, pattern);
                (bonus > 0.0).then(|| (name.clone(), bonus))
            })
            .collect()
    }

    /// The configured bonus for a named pattern (used for context hints).
    pub fn pattern_bonus_by_name(&self, name: &str) -> Option<f64> {
        self.patterns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.bonus)
    }

    /// Total permanence boost from content triggers plus explicit metadata
    /// signals (`type`, `permanence_flag`), capped at 1.0.
    pub fn analyze_permanence(&self, content: &str, metadata: &Metadata) -> f64 {
        let search = self.search_form(content);
        let mut total = 0.0;

        for (_, trigger) in &self.triggers {
            if Self::trigger_matches(&search, trigger) {
                total += trigger.boost;
            }
        }

        if let Some(content_type) = metadata.get_str("type") {
            if let Some(boost) = self.trigger_boost_by_name(content_type) {
                total += boost;
            }
        }

        if let Some(flag) = metadata.get_str("permanence_flag") {
            if let Some(boost) = self.trigger_boost_by_name(flag) {
                total += boost;
            }
        }

        total.min(1.0)
    }

    fn trigger_boost_by_name(&self, name: &str) -> Option<f64> {
        self.triggers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.boost)
    }

    fn pattern_bonus(search: &str, pattern: &CompiledPattern) -> f64 {
        let mut matches: Vec<bool> = pattern
            .keywords
            .iter()
            .map(|kw| search.contains(kw.as_str()))
            .collect();
        matches.extend(pattern.regexes.iter().map(|re| re.is_match(search)));

        if matches.is_empty() {
            return 0.0;
        }

        match pattern.match_mode {
            MatchMode::All => {
                if matches.iter().all(|m| *m) {
                    pattern.bonus
                } else {
                    0.0
                }
            }
            MatchMode::Weighted => {
                let hit = matches.iter().filter(|m| **m).count();
                pattern.bonus * hit as f64 / matches.len() as f64
            }
            MatchMode::Any => {
                if matches.iter().any(|m| *m) {
                    pattern.bonus
                } else {
                    0.0
                }
            }
        }
    }

    fn trigger_matches(search: &str, trigger: &CompiledTrigger) -> bool {
        trigger.keywords.iter().any(|kw| search.contains(kw.as_str()))
            || trigger.regexes.iter().any(|re| re.is_match(search))
    }
}

/// Memory importance scoring with configurable pattern matching.
pub struct ImportanceScorer {
    decay_constant: f64,
    max_access_count: u64,
    weights: crate::config::ScoringWeights,
    base_scoring: crate::config::BaseScoring,
    pattern_engine: DomainPatternEngine,
}

impl ImportanceScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        ImportanceScorer {
            decay_constant: config.decay_constant,
            max_access_count: config.max_access_count,
            weights: config.scoring_weights.clone(),
            base_scoring: config.base_scoring.clone(),
            pattern_engine: DomainPatternEngine::new(&config.domain_patterns),
        }
    }

    /// Calculate the importance score for a new document, in [0, 1].
    pub fn calculate_importance(
        &self,
        content: &str,
        metadata: &Metadata,
        context: Option<&ScoreContext>,
    ) -> f64 {
        let length_score = (content.len() as f64 / self.base_scoring.length_normalization)
            .min(self.base_scoring.max_length_score);

        let pattern_bonus: f64 = self
            .pattern_engine
            .analyze_content(content)
            .iter()
            .map(|(_, bonus)| bonus)
            .sum();

        let mut context_bonus = 0.0;
        let mut permanence_boost = self.pattern_engine.analyze_permanence(content, metadata);

        if let Some(ctx) = context {
            for (key, value) in ctx {
                if is_truthy(value) {
                    if let Some(bonus) = self.pattern_engine.pattern_bonus_by_name(key) {
                        context_bonus += bonus;
                    }
                }
            }

            if ctx
                .get("permanence_requested")
                .map(is_truthy)
                .unwrap_or(false)
            {
                permanence_boost += EXPLICIT_PERMANENCE_BOOST;
            }
        }

        let mut total = length_score + pattern_bonus + context_bonus + permanence_boost;

        // Content replace preserves the previous score as a floor.
        if let Some(preserved) = context
            .and_then(|c| c.get("preserved_importance"))
            .and_then(serde_json::Value::as_f64)
        {
            total = total.max(preserved);
        }

        // An explicit non-importance signal keeps the document out of the
        // permanent tier no matter what the patterns say.
        if context
            .and_then(|c| c.get("is_important"))
            .and_then(serde_json::Value::as_bool)
            == Some(false)
        {
            total = total.min(NON_IMPORTANT_CAP);
        }

        total.clamp(0.0, 1.0)
    }

    /// Dynamic retrieval score for an existing chunk.
    ///
    /// `distance` is the store's semantic distance (lower is closer);
    /// `now` is epoch seconds.
    pub fn calculate_retrieval_score(&self, distance: f64, metadata: &Metadata, now: f64) -> f64 {
        let semantic_score = 1.0 - distance.min(1.0);

        let timestamp = metadata.get_f64("timestamp").unwrap_or(now);
        let recency_score = (-(now - timestamp) / self.decay_constant).exp();

        let access_count = metadata.get_i64("access_count").unwrap_or(0).max(0) as f64;
        let frequency_score = (access_count / self.max_access_count as f64).min(1.0);

        let importance_score = metadata.get_f64("importance_score").unwrap_or(0.5);

        semantic_score * self.weights.semantic
            + recency_score * self.weights.recency
            + frequency_score * self.weights.frequency
            + importance_score * self.weights.importance
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}
