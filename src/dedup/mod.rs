//! Deduplication engine: ingestion-time probing, batch passes, and
//! importance boosting of existing near-duplicates.
//!
//! Similarity failures never abort an operation: a failed probe reduces to
//! `add_new`, a failed pair merge is logged and skipped, and the batch pass
//! always runs to completion.

mod merger;

pub use merger::DocumentMerger;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::DeduplicationConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::relationships::RelationshipGraph;
use crate::similarity::{EmbeddedDoc, SimilarityCalculator};
use crate::store::{TierSet, VectorStore};
use crate::types::{now_secs, ChunkRecord, CollectionType, Metadata};

/// What to do with an incoming document after the duplicate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeAction {
    /// No near-duplicate found; store normally
    AddNew,
    /// Near-identical content exists; boost it instead of inserting
    BoostExisting,
    /// Similar content exists; advisory only, caller may still add
    MergeContent,
}

/// Result of the ingestion-time duplicate probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub action: ProbeAction,
    pub existing: Option<ChunkRecord>,
    pub similarity: f32,
}

/// Running deduplication statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub total_duplicates_found: u64,
    pub total_documents_merged: u64,
    pub total_duplicates_removed: u64,
    pub total_documents_processed: u64,
    pub last_deduplication: Option<f64>,
    pub processing_time_total: f64,
}

/// One reported duplicate pair from a batch pass.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePairReport {
    pub doc1_id: String,
    pub doc2_id: String,
    pub similarity: f32,
    pub action: String,
    pub chosen_doc: String,
}

/// Result of a batch deduplication pass over one collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupPassReport {
    pub message: String,
    pub collection: String,
    pub dry_run: bool,
    pub duplicates_found: usize,
    pub documents_processed: usize,
    pub merged_documents: usize,
    pub processing_time: f64,
    pub duplicate_pairs: Vec<DuplicatePairReport>,
}

/// Probe thresholds for ingestion-time actions.
const BOOST_THRESHOLD: f32 = 0.95;
const MERGE_ADVISORY_THRESHOLD: f32 = 0.85;
const PROBE_K: usize = 5;

/// The deduplication engine.
pub struct Deduplicator {
    enabled: bool,
    similarity_threshold: f32,
    target_collections: Vec<CollectionType>,
    calculator: SimilarityCalculator,
    merger: DocumentMerger,
    tiers: TierSet,
    graph: Arc<RelationshipGraph>,
    stats: Mutex<DedupStats>,
}

impl Deduplicator {
    pub fn new(config: &DeduplicationConfig, tiers: TierSet, graph: Arc<RelationshipGraph>) -> Self {
        let target_collections = config
            .collections
            .iter()
            .filter_map(|name| CollectionType::parse(name))
            .collect();

        info!(
            threshold = config.similarity_threshold,
            enabled = config.enabled,
            "deduplicator initialized"
        );

        Deduplicator {
            enabled: config.enabled,
            similarity_threshold: config.similarity_threshold,
            target_collections,
            calculator: SimilarityCalculator::new(config.similarity_threshold),
            merger: DocumentMerger::new(),
            tiers,
            graph,
            stats: Mutex::new(DedupStats::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn target_collections(&self) -> &[CollectionType] {
        &self.target_collections
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> DedupStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // =====================================================================
    // Ingestion-time probe
    // =====================================================================

    /// Probe the target collection for near-duplicates of new content.
    /// Errors reduce to `add_new`.
    pub async fn check_ingestion_duplicates(
        &self,
        embedding: &[f32],
        collection: CollectionType,
    ) -> ProbeResult {
        if !self.enabled {
            return ProbeResult {
                action: ProbeAction::AddNew,
                existing: None,
                similarity: 0.0,
            };
        }

        let store = self.tiers.get(collection);
        let hits = match store.search(embedding, PROBE_K).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "duplicate probe failed, treating as add_new");
                return ProbeResult {
                    action: ProbeAction::AddNew,
                    existing: None,
                    similarity: 0.0,
                };
            }
        };

        let best = hits
            .into_iter()
            .filter(|(record, _)| !record.metadata.is_system_doc())
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((record, similarity)) if similarity > BOOST_THRESHOLD => ProbeResult {
                action: ProbeAction::BoostExisting,
                existing: Some(record),
                similarity,
            },
            Some((record, similarity)) if similarity > MERGE_ADVISORY_THRESHOLD => ProbeResult {
                action: ProbeAction::MergeContent,
                existing: Some(record),
                similarity,
            },
            Some((_, similarity)) => ProbeResult {
                action: ProbeAction::AddNew,
                existing: None,
                similarity,
            },
            None => ProbeResult {
                action: ProbeAction::AddNew,
                existing: None,
                similarity: 0.0,
            },
        }
    }

    /// Boost an existing document instead of inserting its duplicate:
    /// clamp importance up, bump access and boost counters, persist.
    pub async fn boost_existing_document(
        &self,
        existing: &ChunkRecord,
        new_metadata: &Metadata,
        collection: CollectionType,
    ) -> MemoryResult<Metadata> {
        let now = now_secs();
        let old_importance = existing.metadata.get_f64("importance_score").unwrap_or(0.5);
        let new_importance = new_metadata.get_f64("importance_score").unwrap_or(0.5);
        let boosted = (old_importance.max(new_importance) + 0.05).min(1.0);

        let mut updated = existing.metadata.clone();
        updated.insert("importance_score", boosted);
        updated.insert(
            "access_count",
            existing.metadata.get_i64("access_count").unwrap_or(0) + 1,
        );
        updated.insert("last_accessed", now);
        updated.insert(
            "duplicate_boost_count",
            existing.metadata.get_i64("duplicate_boost_count").unwrap_or(0) + 1,
        );
        updated.insert("last_duplicate_detected", now);

        self.tiers
            .get(collection)
            .update_metadata(&[existing.id.clone()], vec![updated.clone()])
            .await?;

        info!(
            chunk_id = %existing.id,
            old_importance,
            boosted,
            "boosted existing document instead of adding duplicate"
        );
        Ok(updated)
    }

    // =====================================================================
    // Batch pass
    // =====================================================================

    /// Batch-deduplicate one collection. With `dry_run` the pass only
    /// reports what it would merge.
    pub async fn deduplicate_collection(
        &self,
        collection: CollectionType,
        dry_run: bool,
    ) -> MemoryResult<DedupPassReport> {
        if !self.enabled {
            return Ok(DedupPassReport {
                message: "Deduplication disabled".to_string(),
                collection: collection.to_string(),
                dry_run,
                ..Default::default()
            });
        }

        let start = now_secs();
        let store = self.tiers.get(collection);
        let records: Vec<ChunkRecord> = store
            .get_all()
            .await?
            .into_iter()
            .filter(|r| !r.metadata.is_system_doc())
            .collect();

        if records.len() < 2 {
            return Ok(DedupPassReport {
                message: "Not enough documents for deduplication".to_string(),
                collection: collection.to_string(),
                dry_run,
                documents_processed: records.len(),
                ..Default::default()
            });
        }

        // All-pairs similarity is CPU-bound; run it off the async runtime.
        let docs: Vec<EmbeddedDoc> = records
            .iter()
            .enumerate()
            .map(|(index, r)| EmbeddedDoc {
                index,
                embedding: r.embedding.clone(),
            })
            .collect();
        let calculator = self.calculator.clone();
        let pairs = tokio::task::spawn_blocking(move || calculator.find_duplicates_batch(&docs, None))
            .await
            .map_err(|e| MemoryError::Dedup(format!("similarity batch panicked: {e}")))?;

        let mut report = DedupPassReport {
            collection: collection.to_string(),
            dry_run,
            duplicates_found: pairs.len(),
            documents_processed: records.len(),
            ..Default::default()
        };

        if pairs.is_empty() {
            report.message = "No duplicates found".to_string();
            report.processing_time = now_secs() - start;
            self.note_pass(&report);
            return Ok(report);
        }

        let mut processed: std::collections::HashSet<String> = std::collections::HashSet::new();

        for pair in &pairs {
            let doc1 = &records[pair.first];
            let doc2 = &records[pair.second];

            if processed.contains(&doc1.id) || processed.contains(&doc2.id) {
                continue;
            }

            let winner = self.merger.choose_best(doc1, doc2);
            let loser = if winner.id == doc1.id { doc2 } else { doc1 };

            report.duplicate_pairs.push(DuplicatePairReport {
                doc1_id: doc1.id.clone(),
                doc2_id: doc2.id.clone(),
                similarity: pair.similarity,
                action: if dry_run { "would_merge" } else { "merged" }.to_string(),
                chosen_doc: winner.id.clone(),
            });

            if dry_run {
                continue;
            }

            match self
                .merge_pair(collection, winner, loser, f64::from(pair.similarity))
                .await
            {
                Ok(()) => {
                    processed.insert(doc1.id.clone());
                    processed.insert(doc2.id.clone());
                    report.merged_documents += 1;
                }
                Err(e) => {
                    // Per-pair failures never abort the pass.
                    warn!(
                        winner = %winner.id,
                        loser = %loser.id,
                        error = %e,
                        "merge failed, skipping pair"
                    );
                }
            }
        }

        report.message = if dry_run {
            format!("DRY RUN: found {} duplicate pairs", report.duplicate_pairs.len())
        } else {
            format!("Merged {} duplicate pairs", report.merged_documents)
        };
        report.processing_time = now_secs() - start;
        self.note_pass(&report);
        Ok(report)
    }

    /// Merge one duplicate pair: write merged metadata onto the winner,
    /// delete the loser, and rewrite graph edges.
    async fn merge_pair(
        &self,
        collection: CollectionType,
        winner: &ChunkRecord,
        loser: &ChunkRecord,
        similarity: f64,
    ) -> MemoryResult<()> {
        let now = now_secs();
        let store = self.tiers.get(collection);

        let merged = self.merger.merge_metadata(winner, loser, similarity, now);
        store
            .update_metadata(&[winner.id.clone()], vec![merged])
            .await?;
        store.delete(&[loser.id.clone()]).await?;

        let winner_doc = winner
            .metadata
            .document_id()
            .unwrap_or(winner.id.as_str())
            .to_string();
        let loser_doc = loser
            .metadata
            .document_id()
            .unwrap_or(loser.id.as_str())
            .to_string();

        if let Err(e) = self
            .graph
            .handle_deduplication_merge(&winner_doc, &[loser_doc.clone()], &[similarity])
            .await
        {
            warn!(error = %e, "failed to record merge relationships");
        }
        self.graph
            .cleanup_stale_references(Some(&[loser.id.clone()]))
            .await;

        info!(winner = %winner.id, loser = %loser.id, similarity, "merged duplicate pair");
        Ok(())
    }

    fn note_pass(&self, report: &DedupPassReport) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.total_duplicates_found += report.duplicates_found as u64;
        stats.total_documents_processed += report.documents_processed as u64;
        if !report.dry_run {
            stats.total_documents_merged += report.merged_documents as u64;
            stats.total_duplicates_removed += report.merged_documents as u64;
        }
        stats.last_deduplication = Some(now_secs());
        stats.processing_time_total += report.processing_time;
    }

    /// Dry-run pass used by the preview tool.
    pub async fn preview_duplicates(
        &self,
        collection: CollectionType,
    ) -> MemoryResult<DedupPassReport> {
        self.deduplicate_collection(collection, true).await
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("enabled", &self.enabled)
            .field("similarity_threshold", &self.similarity_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkRelationshipConfig, DeduplicationConfig};

    fn engine() -> (Deduplicator, TierSet) {
        let tiers = TierSet::in_memory();
        let graph = Arc::new(RelationshipGraph::new(
            TierSet {
                short_term: Arc::clone(&tiers.short_term),
                long_term: Arc::clone(&tiers.long_term),
            },
            ChunkRelationshipConfig::default(),
        ));
        (
            Deduplicator::new(&DeduplicationConfig::default(), tiers.clone(), graph),
            tiers,
        )
    }

    fn record(id: &str, importance: f64, embedding: Vec<f32>) -> ChunkRecord {
        let mut r = ChunkRecord::new(id, format!("content {id}"));
        r.embedding = Some(embedding);
        r.metadata.insert("chunk_id", id);
        r.metadata.insert(
            "document_id",
            id.rsplit_once("_chunk_")
                .map(|(d, _)| d.to_string())
                .unwrap_or_else(|| id.to_string()),
        );
        r.metadata.insert("importance_score", importance);
        r.metadata.insert("access_count", 0i64);
        r.metadata.insert("timestamp", 1_700_000_000.0);
        r.metadata.insert("last_accessed", 1_700_000_000.0);
        r
    }

    #[tokio::test]
    async fn test_probe_empty_collection_adds_new() {
        let (dedup, _) = engine();
        let probe = dedup
            .check_ingestion_duplicates(&[1.0, 0.0], CollectionType::ShortTerm)
            .await;
        assert_eq!(probe.action, ProbeAction::AddNew);
    }

    #[tokio::test]
    async fn test_probe_thresholds() {
        let (dedup, tiers) = engine();
        tiers
            .short_term
            .add(vec![record("a_chunk_0", 0.5, vec![1.0, 0.0])])
            .await
            .unwrap();

        // Near-identical -> boost.
        let probe = dedup
            .check_ingestion_duplicates(&[1.0, 0.0], CollectionType::ShortTerm)
            .await;
        assert_eq!(probe.action, ProbeAction::BoostExisting);
        assert!(probe.similarity > 0.95);

        // Similar but not identical -> advisory merge.
        let probe = dedup
            .check_ingestion_duplicates(&[0.9, 0.436], CollectionType::ShortTerm)
            .await;
        assert_eq!(probe.action, ProbeAction::MergeContent);

        // Dissimilar -> add new.
        let probe = dedup
            .check_ingestion_duplicates(&[0.0, 1.0], CollectionType::ShortTerm)
            .await;
        assert_eq!(probe.action, ProbeAction::AddNew);
    }

    #[tokio::test]
    async fn test_disabled_probe_always_adds() {
        let tiers = TierSet::in_memory();
        let graph = Arc::new(RelationshipGraph::new(
            TierSet {
                short_term: Arc::clone(&tiers.short_term),
                long_term: Arc::clone(&tiers.long_term),
            },
            ChunkRelationshipConfig::default(),
        ));
        let dedup = Deduplicator::new(
            &DeduplicationConfig {
                enabled: false,
                ..DeduplicationConfig::default()
            },
            tiers.clone(),
            graph,
        );
        tiers
            .short_term
            .add(vec![record("a_chunk_0", 0.5, vec![1.0])])
            .await
            .unwrap();

        let probe = dedup
            .check_ingestion_duplicates(&[1.0], CollectionType::ShortTerm)
            .await;
        assert_eq!(probe.action, ProbeAction::AddNew);
    }

    #[tokio::test]
    async fn test_boost_existing_document() {
        let (dedup, tiers) = engine();
        let existing = record("a_chunk_0", 0.5, vec![1.0]);
        tiers.short_term.add(vec![existing.clone()]).await.unwrap();

        let mut incoming = Metadata::new();
        incoming.insert("importance_score", 0.6);

        let updated = dedup
            .boost_existing_document(&existing, &incoming, CollectionType::ShortTerm)
            .await
            .unwrap();

        assert!((updated.get_f64("importance_score").unwrap() - 0.65).abs() < 1e-9);
        assert_eq!(updated.get_i64("access_count"), Some(1));
        assert_eq!(updated.get_i64("duplicate_boost_count"), Some(1));

        // The boost was persisted.
        let rows = tiers.short_term.get_all().await.unwrap();
        assert_eq!(rows[0].metadata.get_i64("duplicate_boost_count"), Some(1));
    }

    #[tokio::test]
    async fn test_boost_clamps_at_one() {
        let (dedup, tiers) = engine();
        let existing = record("a_chunk_0", 0.99, vec![1.0]);
        tiers.short_term.add(vec![existing.clone()]).await.unwrap();

        let updated = dedup
            .boost_existing_document(&existing, &Metadata::new(), CollectionType::ShortTerm)
            .await
            .unwrap();
        assert_eq!(updated.get_f64("importance_score"), Some(1.0));
    }

    #[tokio::test]
    async fn test_batch_dry_run_reports_without_mutating() {
        let (dedup, tiers) = engine();
        tiers
            .short_term
            .add(vec![
                record("a_chunk_0", 0.8, vec![1.0, 0.0]),
                record("b_chunk_0", 0.5, vec![0.999, 0.045]),
                record("c_chunk_0", 0.5, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let report = dedup
            .deduplicate_collection(CollectionType::ShortTerm, true)
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.duplicates_found, 1);
        assert_eq!(report.duplicate_pairs.len(), 1);
        assert_eq!(report.duplicate_pairs[0].chosen_doc, "a_chunk_0");
        assert_eq!(report.merged_documents, 0);
        assert_eq!(tiers.short_term.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_batch_real_run_merges_and_deletes_loser() {
        let (dedup, tiers) = engine();
        tiers
            .short_term
            .add(vec![
                record("a_chunk_0", 0.8, vec![1.0, 0.0]),
                record("b_chunk_0", 0.5, vec![0.999, 0.045]),
            ])
            .await
            .unwrap();

        let report = dedup
            .deduplicate_collection(CollectionType::ShortTerm, false)
            .await
            .unwrap();

        assert_eq!(report.merged_documents, 1);
        // Loser row gone; winner survives with lineage. The merge-history
        // system document is also present now.
        let rows = tiers.short_term.get_all().await.unwrap();
        let winner = rows
            .iter()
            .find(|r| r.metadata.get_str("chunk_id") == Some("a_chunk_0"))
            .unwrap();
        assert!(rows
            .iter()
            .all(|r| r.metadata.get_str("chunk_id") != Some("b_chunk_0")));
        assert_eq!(winner.metadata.get_bool("duplicate_merged"), Some(true));
        let sources: Vec<String> =
            serde_json::from_str(winner.metadata.get_str("duplicate_sources").unwrap()).unwrap();
        assert_eq!(sources, vec!["a".to_string(), "b".to_string()]);

        let stats = dedup.stats();
        assert_eq!(stats.total_documents_merged, 1);
        assert_eq!(stats.total_duplicates_removed, 1);
    }

    #[tokio::test]
    async fn test_batch_pass_single_document() {
        let (dedup, tiers) = engine();
        tiers
            .short_term
            .add(vec![record("a_chunk_0", 0.8, vec![1.0])])
            .await
            .unwrap();

        let report = dedup
            .deduplicate_collection(CollectionType::ShortTerm, false)
            .await
            .unwrap();
        assert_eq!(report.duplicates_found, 0);
        assert_eq!(report.documents_processed, 1);
    }
}
