//! Size-bounded short-term tier cleanup.
//!
//! When the short-term collection grows past its cap, documents are
//! selected for removal in three phases: exact-duplicate sweep, similarity
//! clustering, and an age-based fallback. Selection prefers dropping
//! low-quality redundant content and never touches documents younger than
//! a day in the clustering phase.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dedup::Deduplicator;
use crate::error::MemoryResult;
use crate::services::storage::StorageService;
use crate::similarity::{EmbeddedDoc, SimilarityCalculator};
use crate::store::{TierSet, VectorStore};
use crate::types::{now_secs, ChunkRecord, CollectionType};

/// Duplicate sweep threshold (phase 1).
const EXACT_DUPLICATE_THRESHOLD: f32 = 0.95;
/// Clustering threshold (phase 2).
const CLUSTER_THRESHOLD: f32 = 0.75;
/// Phase 2 never removes documents younger than this.
const MIN_REMOVAL_AGE_SECS: f64 = 86_400.0;

/// Outcome of a maintenance pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub triggered: bool,
    pub initial_count: usize,
    pub target_size: usize,
    pub removed: usize,
    pub duplicate_removals: usize,
    pub cluster_removals: usize,
    pub age_removals: usize,
}

/// The short-term maintenance service.
pub struct MaintenanceService {
    tiers: TierSet,
    storage: Arc<StorageService>,
    deduplicator: Arc<Deduplicator>,
    short_term_max_size: usize,
}

impl MaintenanceService {
    pub fn new(
        tiers: TierSet,
        storage: Arc<StorageService>,
        deduplicator: Arc<Deduplicator>,
        short_term_max_size: usize,
    ) -> Self {
        MaintenanceService {
            tiers,
            storage,
            deduplicator,
            short_term_max_size,
        }
    }

    /// Run the size check and, if over the cap, clean the short-term tier
    /// down to 80% capacity.
    pub async fn maintain_short_term(&self) -> MemoryResult<MaintenanceReport> {
        self.maintain_short_term_at(now_secs()).await
    }

    /// Maintenance pass against an explicit clock.
    pub async fn maintain_short_term_at(&self, now: f64) -> MemoryResult<MaintenanceReport> {
        let store = &self.tiers.short_term;
        let all: Vec<ChunkRecord> = store
            .get_all()
            .await?
            .into_iter()
            .filter(|r| !r.metadata.is_system_doc())
            .collect();

        let current_count = all.len();
        if current_count <= self.short_term_max_size {
            return Ok(MaintenanceReport {
                initial_count: current_count,
                target_size: self.short_term_max_size,
                ..Default::default()
            });
        }

        let target_size = (self.short_term_max_size as f64 * 0.8) as usize;
        let to_remove = current_count - target_size;
        info!(
            current_count,
            to_remove, target_size, "memory maintenance triggered"
        );

        let mut report = MaintenanceReport {
            triggered: true,
            initial_count: current_count,
            target_size,
            ..Default::default()
        };

        let mut marked: Vec<usize> = Vec::new();
        let mut marked_set: HashSet<usize> = HashSet::new();

        // Phase 1: exact-duplicate sweep; drop the worse of each pair.
        if self.deduplicator.enabled() {
            let pairs = self.batch_pairs(&all, EXACT_DUPLICATE_THRESHOLD).await;
            for pair in pairs {
                if marked_set.contains(&pair.first) && marked_set.contains(&pair.second) {
                    continue;
                }
                let worse = if quality_score(&all[pair.first]) < quality_score(&all[pair.second]) {
                    pair.first
                } else {
                    pair.second
                };
                if marked_set.insert(worse) {
                    marked.push(worse);
                    debug!(similarity = pair.similarity, "marked duplicate for removal");
                }
            }
            report.duplicate_removals = marked.len();
        }

        // Phase 2: similarity clustering; keep the best of each cluster,
        // but never remove very recent content.
        if marked.len() < to_remove && self.deduplicator.enabled() {
            let remaining: Vec<usize> =
                (0..all.len()).filter(|i| !marked_set.contains(i)).collect();
            let docs: Vec<EmbeddedDoc> = remaining
                .iter()
                .map(|&i| EmbeddedDoc {
                    index: i,
                    embedding: all[i].embedding.clone(),
                })
                .collect();

            let calculator = SimilarityCalculator::new(EXACT_DUPLICATE_THRESHOLD);
            let clusters = tokio::task::spawn_blocking(move || {
                calculator.cluster(&docs, CLUSTER_THRESHOLD)
            })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "clustering task failed");
                Vec::new()
            });

            'clusters: for mut cluster in clusters {
                if cluster.len() < 2 {
                    continue;
                }
                cluster.sort_by(|&a, &b| {
                    quality_score(&all[b])
                        .partial_cmp(&quality_score(&all[a]))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &idx in &cluster[1..] {
                    let age = now - all[idx].metadata.get_f64("timestamp").unwrap_or(0.0);
                    if age <= MIN_REMOVAL_AGE_SECS {
                        continue;
                    }
                    if marked_set.insert(idx) {
                        marked.push(idx);
                        report.cluster_removals += 1;
                    }
                    if marked.len() >= to_remove {
                        break 'clusters;
                    }
                }
            }
        }

        // Phase 3: age-based fallback, oldest and least-accessed first.
        if marked.len() < to_remove {
            let mut by_priority: Vec<usize> =
                (0..all.len()).filter(|i| !marked_set.contains(i)).collect();
            by_priority.sort_by(|&a, &b| {
                removal_priority(&all[a])
                    .partial_cmp(&removal_priority(&all[b]))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for idx in by_priority {
                if marked.len() >= to_remove {
                    break;
                }
                if marked_set.insert(idx) {
                    marked.push(idx);
                    report.age_removals += 1;
                }
            }
        }

        marked.truncate(to_remove);
        let ids: Vec<String> = marked.iter().map(|&i| removal_id(&all[i])).collect();
        report.removed = self
            .storage
            .remove_documents(CollectionType::ShortTerm, &ids)
            .await;

        info!(removed = report.removed, "short-term maintenance complete");
        Ok(report)
    }

    async fn batch_pairs(
        &self,
        records: &[ChunkRecord],
        threshold: f32,
    ) -> Vec<crate::similarity::DuplicatePair> {
        let docs: Vec<EmbeddedDoc> = records
            .iter()
            .enumerate()
            .map(|(index, r)| EmbeddedDoc {
                index,
                embedding: r.embedding.clone(),
            })
            .collect();
        let calculator = SimilarityCalculator::new(threshold);
        tokio::task::spawn_blocking(move || calculator.find_duplicates_batch(&docs, None))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "duplicate sweep task failed");
                Vec::new()
            })
    }
}

/// Quality score used for both the duplicate tie-break and within-cluster
/// ranking.
fn quality_score(record: &ChunkRecord) -> f64 {
    let metadata = &record.metadata;
    metadata.get_f64("importance_score").unwrap_or(0.0) * 0.5
        + metadata.get_i64("access_count").unwrap_or(0) as f64 * 0.3
        + metadata.get_f64("timestamp").unwrap_or(0.0) / 86_400.0 * 0.2
}

/// Lower priority means removed earlier: older and less accessed first.
fn removal_priority(record: &ChunkRecord) -> f64 {
    record.metadata.get_f64("timestamp").unwrap_or(0.0)
        + record.metadata.get_i64("access_count").unwrap_or(0) as f64 * 86_400.0
}

/// Store id for removal, with fallbacks for rows written by other
/// producers: metadata id, then a content hash.
fn removal_id(record: &ChunkRecord) -> String {
    if !record.id.is_empty() {
        return record.id.clone();
    }
    if let Some(id) = record.metadata.get_str("id") {
        return id.to_string();
    }
    format!("{:x}", Sha256::digest(record.content.as_bytes()))
}

impl std::fmt::Debug for MaintenanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceService")
            .field("short_term_max_size", &self.short_term_max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_700_000_000.0;

    fn record(id: &str, importance: f64, access: i64, timestamp: f64) -> ChunkRecord {
        let mut r = ChunkRecord::new(id, format!("content {id}"));
        r.metadata.insert("chunk_id", id);
        r.metadata.insert("importance_score", importance);
        r.metadata.insert("access_count", access);
        r.metadata.insert("timestamp", timestamp);
        r
    }

    #[test]
    fn test_quality_score_weights() {
        let r = record("a", 1.0, 10, 86_400.0);
        // 0.5*1.0 + 0.3*10 + 0.2*1.0
        assert!((quality_score(&r) - 3.7).abs() < 1e-9);
    }

    #[test]
    fn test_removal_priority_weights_access_as_days() {
        let old_unused = record("a", 0.5, 0, NOW - 10.0 * 86_400.0);
        let old_used = record("b", 0.5, 5, NOW - 10.0 * 86_400.0);
        assert!(removal_priority(&old_unused) < removal_priority(&old_used));
    }

    #[test]
    fn test_removal_id_fallbacks() {
        let with_id = record("a_chunk_0", 0.5, 0, NOW);
        assert_eq!(removal_id(&with_id), "a_chunk_0");

        let mut no_store_id = record("", 0.5, 0, NOW);
        no_store_id.metadata.insert("id", "meta_id");
        assert_eq!(removal_id(&no_store_id), "meta_id");

        let mut bare = record("", 0.5, 0, NOW);
        bare.metadata.remove("id");
        let hashed = removal_id(&bare);
        assert_eq!(hashed.len(), 64);
    }
}
