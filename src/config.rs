//! Hierarchical configuration for the memory engine.
//!
//! Every section deserializes with `#[serde(default)]`, so a config file
//! only needs the keys it wants to override. The `ENGRAM_CONFIG` environment
//! variable names a JSON file to load; when it is unset the documented
//! defaults apply.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MemoryError, MemoryResult};

/// Environment variable naming the config file to load.
pub const CONFIG_ENV_VAR: &str = "ENGRAM_CONFIG";

/// Top-level configuration map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngramConfig {
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingsConfig,
    pub reranker: RerankerConfig,
    pub memory_scoring: ScoringConfig,
    pub memory_management: MemoryManagementConfig,
    pub lifecycle: LifecycleConfig,
    pub deduplication: DeduplicationConfig,
}

impl EngramConfig {
    /// Load configuration from the file named by `ENGRAM_CONFIG`, falling
    /// back to defaults when the variable is unset.
    pub fn load() -> MemoryResult<EngramConfig> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(&path),
            _ => {
                info!("no {CONFIG_ENV_VAR} set, using default configuration");
                Ok(EngramConfig::default())
            }
        }
    }

    /// Load configuration from a JSON file. Omitted keys fall back to
    /// their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> MemoryResult<EngramConfig> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| MemoryError::Validation {
            reason: format!("cannot read config file {}: {e}", path.display()),
        })?;
        let config: EngramConfig =
            serde_json::from_str(&raw).map_err(|e| MemoryError::Validation {
                reason: format!("invalid config file {}: {e}", path.display()),
            })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }
}

/// Vector-store collection naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub short_term_collection: String,
    pub long_term_collection: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            short_term_collection: "short_term_memory".to_string(),
            long_term_collection: "long_term_memory".to_string(),
        }
    }
}

/// Embedding model parameters the engine needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Fixed embedding dimension produced upstream
    pub dimension: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        EmbeddingsConfig { dimension: 256 }
    }
}

/// Cross-encoder reranker wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    /// Apply the reranker to the final result page when one is wired
    pub enabled: bool,
}

/// How keyword/regex matches combine into a pattern bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Full bonus if any keyword or regex matches
    #[default]
    Any,
    /// Full bonus only if every keyword and regex matches
    All,
    /// Bonus scaled by the fraction of matches
    Weighted,
}

/// One configurable content pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSpec {
    pub keywords: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub bonus: f64,
    pub match_mode: MatchMode,
}

/// One permanence trigger: matching content or metadata adds `boost`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSpec {
    pub keywords: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub boost: f64,
}

/// Domain pattern tables driving content analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainPatternConfig {
    pub patterns: BTreeMap<String, PatternSpec>,
    pub permanence_triggers: BTreeMap<String, TriggerSpec>,
    pub case_sensitive: bool,
}

impl Default for DomainPatternConfig {
    fn default() -> Self {
        let mut patterns = BTreeMap::new();
        patterns.insert(
            "code".to_string(),
            PatternSpec {
                keywords: vec![
                    "fn ", "struct ", "impl ", "def ", "class ", "function", "import ", "return",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                regex_patterns: Vec::new(),
                bonus: 0.2,
                match_mode: MatchMode::Any,
            },
        );
        patterns.insert(
            "error".to_string(),
            PatternSpec {
                keywords: vec!["error", "exception", "failed", "bug", "panic"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                regex_patterns: Vec::new(),
                bonus: 0.2,
                match_mode: MatchMode::Any,
            },
        );
        patterns.insert(
            "solution".to_string(),
            PatternSpec {
                keywords: vec!["fix", "solution", "resolved", "workaround"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                regex_patterns: Vec::new(),
                bonus: 0.15,
                match_mode: MatchMode::Any,
            },
        );

        let mut permanence_triggers = BTreeMap::new();
        permanence_triggers.insert(
            "critical".to_string(),
            TriggerSpec {
                keywords: vec!["critical", "essential", "must not lose"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                regex_patterns: Vec::new(),
                boost: 0.4,
            },
        );
        permanence_triggers.insert(
            "permanent".to_string(),
            TriggerSpec {
                keywords: vec!["permanent", "never delete", "keep forever"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                regex_patterns: Vec::new(),
                boost: 0.5,
            },
        );
        permanence_triggers.insert(
            "configuration".to_string(),
            TriggerSpec {
                keywords: vec!["configuration", "config", "credentials"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                regex_patterns: Vec::new(),
                boost: 0.3,
            },
        );

        DomainPatternConfig {
            patterns,
            permanence_triggers,
            case_sensitive: false,
        }
    }
}

/// Retrieval-score weights; typically sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub semantic: f64,
    pub recency: f64,
    pub frequency: f64,
    pub importance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            semantic: 0.4,
            recency: 0.3,
            frequency: 0.2,
            importance: 0.1,
        }
    }
}

/// Base content scoring factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseScoring {
    /// Content length is normalized by this value
    pub length_normalization: f64,
    /// Maximum score obtainable from length alone
    pub max_length_score: f64,
}

impl Default for BaseScoring {
    fn default() -> Self {
        BaseScoring {
            length_normalization: 1000.0,
            max_length_score: 1.0,
        }
    }
}

/// Importance and retrieval scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub decay_constant: f64,
    pub max_access_count: u64,
    pub scoring_weights: ScoringWeights,
    pub base_scoring: BaseScoring,
    pub domain_patterns: DomainPatternConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            decay_constant: 86_400.0,
            max_access_count: 100,
            scoring_weights: ScoringWeights::default(),
            base_scoring: BaseScoring::default(),
            domain_patterns: DomainPatternConfig::default(),
        }
    }
}

/// Chunk-relationship tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkRelationshipConfig {
    /// Attach related-context blocks to query hits
    pub enable_related_retrieval: bool,
    /// Default number of related chunks returned per hit
    pub max_related_chunks: usize,
    /// Context window half-width stamped on each chunk
    pub context_window_size: usize,
    /// Minimum cosine similarity for a semantic edge
    pub semantic_similarity_threshold: f32,
    /// Top-k probe size when establishing semantic edges at ingest
    pub semantic_probe_k: usize,
    /// Minimum shared tokens for a co-occurrence edge
    pub co_occurrence_min_shared: usize,
}

impl Default for ChunkRelationshipConfig {
    fn default() -> Self {
        ChunkRelationshipConfig {
            enable_related_retrieval: true,
            max_related_chunks: 3,
            context_window_size: 2,
            semantic_similarity_threshold: 0.8,
            semantic_probe_k: 5,
            co_occurrence_min_shared: 2,
        }
    }
}

/// Query monitoring tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMonitoringConfig {
    /// Ring-buffer size for retained query records
    pub history_size: usize,
}

impl Default for QueryMonitoringConfig {
    fn default() -> Self {
        QueryMonitoringConfig { history_size: 1000 }
    }
}

/// Memory management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagementConfig {
    pub short_term_max_size: usize,
    pub short_term_threshold: f64,
    pub long_term_threshold: f64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunk_relationships: ChunkRelationshipConfig,
    pub query_monitoring: QueryMonitoringConfig,
}

impl Default for MemoryManagementConfig {
    fn default() -> Self {
        MemoryManagementConfig {
            short_term_max_size: 100,
            short_term_threshold: 0.7,
            long_term_threshold: 0.95,
            chunk_size: 1000,
            chunk_overlap: 100,
            chunk_relationships: ChunkRelationshipConfig::default(),
            query_monitoring: QueryMonitoringConfig::default(),
        }
    }
}

/// TTL tier table: base seconds and jitter per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub high_frequency_base: f64,
    pub high_frequency_jitter: f64,
    pub medium_frequency_base: f64,
    pub medium_frequency_jitter: f64,
    pub low_frequency_base: f64,
    pub low_frequency_jitter: f64,
    pub static_base: f64,
    pub static_jitter: f64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        TtlConfig {
            high_frequency_base: 300.0,
            high_frequency_jitter: 60.0,
            medium_frequency_base: 3600.0,
            medium_frequency_jitter: 600.0,
            low_frequency_base: 86_400.0,
            low_frequency_jitter: 7200.0,
            static_base: 604_800.0,
            static_jitter: 86_400.0,
        }
    }
}

/// Aging decay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    pub enabled: bool,
    /// Decay rate per day
    pub decay_rate: f64,
    /// Floor for the age factor and the half-floor for aged scores
    pub minimum_score: f64,
    /// Days before a stored score needs refreshing
    pub refresh_threshold_days: f64,
}

impl Default for AgingConfig {
    fn default() -> Self {
        AgingConfig {
            enabled: true,
            decay_rate: 0.1,
            minimum_score: 0.1,
            refresh_threshold_days: 7.0,
        }
    }
}

/// Background maintenance cadence, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceCadence {
    pub enabled: bool,
    /// Worker wake-up interval
    pub check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub statistics_interval_secs: u64,
    pub aging_interval_secs: u64,
    pub deep_interval_secs: u64,
}

impl Default for MaintenanceCadence {
    fn default() -> Self {
        MaintenanceCadence {
            enabled: true,
            check_interval_secs: 300,
            cleanup_interval_secs: 3600,
            statistics_interval_secs: 21_600,
            aging_interval_secs: 86_400,
            deep_interval_secs: 604_800,
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub ttl: TtlConfig,
    pub aging: AgingConfig,
    pub maintenance: MaintenanceCadence,
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub similarity_threshold: f32,
    /// Collections eligible for the batch pass
    pub collections: Vec<String>,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        DeduplicationConfig {
            enabled: true,
            similarity_threshold: 0.95,
            collections: vec!["short_term".to_string(), "long_term".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngramConfig::default();
        assert_eq!(config.memory_management.short_term_max_size, 100);
        assert!((config.memory_management.short_term_threshold - 0.7).abs() < 1e-9);
        assert!((config.memory_management.long_term_threshold - 0.95).abs() < 1e-9);
        assert_eq!(config.lifecycle.ttl.high_frequency_base, 300.0);
        assert_eq!(config.lifecycle.maintenance.check_interval_secs, 300);
        assert!(config.deduplication.enabled);
        assert!((config.deduplication.similarity_threshold - 0.95).abs() < 1e-6);
        assert!((config.memory_scoring.scoring_weights.semantic - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"memory_management": {{"short_term_max_size": 10}},
                "deduplication": {{"enabled": false}}}}"#
        )
        .unwrap();

        let config = EngramConfig::from_file(file.path()).unwrap();
        assert_eq!(config.memory_management.short_term_max_size, 10);
        assert!(!config.deduplication.enabled);
        // Untouched sections keep their defaults
        assert!((config.memory_management.long_term_threshold - 0.95).abs() < 1e-9);
        assert_eq!(config.lifecycle.ttl.static_base, 604_800.0);
    }

    #[test]
    fn test_invalid_file_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = EngramConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_missing_file_is_a_validation_error() {
        let err = EngramConfig::from_file("/nonexistent/engram.json").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
