//! Statistics aggregation across tiers, permanence, deduplication, and
//! query performance.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::dedup::Deduplicator;
use crate::monitor::{PerformanceSummary, QueryPerformanceMonitor, TimeWindow};
use crate::relationships::{RelationshipGraph, RelationshipStats};
use crate::store::{TierSet, VectorStore};
use crate::types::CollectionType;

/// Per-collection count and health.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStat {
    pub count: usize,
    pub status: String,
}

/// Collection-level statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStatsReport {
    pub collections: BTreeMap<String, CollectionStat>,
}

/// Permanent-content statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermanenceStats {
    pub total_permanent_documents: usize,
    pub permanent_by_collection: BTreeMap<String, usize>,
    pub permanence_reasons: BTreeMap<String, usize>,
    pub content_types: BTreeMap<String, usize>,
    pub importance_distribution: BTreeMap<String, usize>,
}

/// The stats service.
pub struct StatsService {
    tiers: TierSet,
    monitor: Arc<QueryPerformanceMonitor>,
    graph: Arc<RelationshipGraph>,
    deduplicator: Arc<Deduplicator>,
}

impl StatsService {
    pub fn new(
        tiers: TierSet,
        monitor: Arc<QueryPerformanceMonitor>,
        graph: Arc<RelationshipGraph>,
        deduplicator: Arc<Deduplicator>,
    ) -> Self {
        StatsService {
            tiers,
            monitor,
            graph,
            deduplicator,
        }
    }

    /// Counts and health per collection.
    pub async fn collection_stats(&self) -> MemoryStatsReport {
        let mut report = MemoryStatsReport::default();
        for collection in CollectionType::all() {
            let stat = match self.tiers.get(collection).count().await {
                Ok(count) => CollectionStat {
                    count,
                    status: "active".to_string(),
                },
                Err(e) => CollectionStat {
                    count: 0,
                    status: format!("error: {e}"),
                },
            };
            report.collections.insert(collection.to_string(), stat);
        }
        report
    }

    /// Statistics about permanent content across both tiers.
    pub async fn permanence_stats(&self) -> PermanenceStats {
        let mut stats = PermanenceStats::default();
        for band in ["0.95-0.97", "0.97-0.99", "0.99-1.0"] {
            stats.importance_distribution.insert(band.to_string(), 0);
        }

        for collection in CollectionType::all() {
            let mut permanent_here = 0usize;
            let records = match self.tiers.get(collection).get_all().await {
                Ok(records) => records,
                Err(_) => continue,
            };

            for record in records {
                let metadata = &record.metadata;
                if metadata.is_system_doc() {
                    continue;
                }
                let importance = metadata.get_f64("importance_score").unwrap_or(0.0);
                let is_permanent = metadata.get_bool("permanent_flag").unwrap_or(false)
                    || metadata.get_str("ttl_tier") == Some("permanent")
                    || importance >= 0.95;
                if !is_permanent {
                    continue;
                }

                permanent_here += 1;
                stats.total_permanent_documents += 1;

                let reason = metadata
                    .get_str("permanence_reason")
                    .unwrap_or("high_importance")
                    .to_string();
                *stats.permanence_reasons.entry(reason).or_insert(0) += 1;

                let content_type = metadata.get_str("type").unwrap_or("unspecified").to_string();
                *stats.content_types.entry(content_type).or_insert(0) += 1;

                let band = if (0.95..0.97).contains(&importance) {
                    Some("0.95-0.97")
                } else if (0.97..0.99).contains(&importance) {
                    Some("0.97-0.99")
                } else if importance >= 0.99 {
                    Some("0.99-1.0")
                } else {
                    None
                };
                if let Some(band) = band {
                    *stats
                        .importance_distribution
                        .entry(band.to_string())
                        .or_insert(0) += 1;
                }
            }
            stats
                .permanent_by_collection
                .insert(collection.to_string(), permanent_here);
        }
        stats
    }

    /// Query performance over a time window.
    pub fn query_performance(&self, window: TimeWindow) -> PerformanceSummary {
        self.monitor.performance_summary(window)
    }

    /// Relationship statistics from the graph.
    pub async fn relationship_stats(&self) -> RelationshipStats {
        self.graph.statistics().await
    }

    /// Deduplication statistics plus engine configuration.
    pub fn dedup_stats(&self) -> serde_json::Value {
        let stats = self.deduplicator.stats();
        serde_json::json!({
            "enabled": self.deduplicator.enabled(),
            "total_duplicates_found": stats.total_duplicates_found,
            "total_documents_merged": stats.total_documents_merged,
            "total_duplicates_removed": stats.total_duplicates_removed,
            "total_documents_processed": stats.total_documents_processed,
            "last_deduplication": stats.last_deduplication,
            "processing_time_total": stats.processing_time_total,
            "merge_history_records": self.graph.merge_history().len(),
        })
    }
}

impl std::fmt::Debug for StatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsService").finish_non_exhaustive()
    }
}
