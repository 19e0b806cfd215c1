//! Chunk relationship graph.
//!
//! Tracks adjacency (prev/next/window), semantic edges, co-occurrence
//! edges, and deduplication lineage for every chunk. The in-memory DashMap
//! caches are just caches: the source of truth is the serialized metadata
//! in the vector store, and missing entries hydrate lazily on demand.
//! Traversal is id-based with bounded depth, so cycles between chunks are
//! benign.

mod history;
mod persistence;

pub use history::{MergeEvent, MergeHistoryStore};
pub use persistence::{
    deserialize_chunk_fields, deserialize_json, serialize_chunk_fields, serialize_json,
    DedupSourceRecord, EdgeType, PersistedChunkData, RelatedChunkEdge,
};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ChunkRelationshipConfig;
use crate::error::MemoryResult;
use crate::similarity::SimilarityCalculator;
use crate::store::{MetadataFilter, TierSet, VectorStore};
use crate::types::{
    now_secs, ChunkRecord, CollectionType, Metadata, FIELD_DEDUP_HISTORY,
};

/// Positional relationships of a chunk within its document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexRelationships {
    pub previous_chunk: Option<String>,
    pub next_chunk: Option<String>,
    pub document_start: bool,
    pub document_end: bool,
    pub relative_position: f64,
    /// Inclusive (start, end) chunk indices of the context window
    pub context_window: (usize, usize),
}

/// Cached relationship state for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkRelationship {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content_preview: String,
    pub related_chunks: Vec<RelatedChunkEdge>,
    pub deduplication_sources: Vec<DedupSourceRecord>,
    pub relationship_strength: BTreeMap<String, f64>,
    pub complex: ComplexRelationships,
}

/// One dedup-history entry attached to a surviving document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupHistoryEntry {
    pub merge_id: String,
    pub merged_count: usize,
    pub merge_timestamp: f64,
    pub source_documents: Vec<String>,
}

/// Cached relationship state for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRelationship {
    pub document_id: String,
    pub content_length: usize,
    pub chunk_count: usize,
    pub creation_time: f64,
    pub collection: CollectionType,
    pub language: String,
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub deduplication_history: Vec<DedupHistoryEntry>,
    #[serde(default)]
    pub related_documents: Vec<String>,
    #[serde(default)]
    pub consolidated_into: Option<String>,
    #[serde(default)]
    pub consolidation_timestamp: Option<f64>,
    #[serde(default)]
    pub consolidated_chunk_count: Option<usize>,
    #[serde(default)]
    pub merge_benefit_score: Option<f64>,
}

/// One related chunk returned to a query.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedChunkInfo {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub relationship_type: EdgeType,
    pub content_preview: String,
    pub context_relevance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_from_source: Option<usize>,
}

/// Summary returned from a deduplication merge.
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub merge_id: String,
    pub documents_merged: usize,
    pub relationships_preserved: usize,
    pub average_similarity: f64,
}

/// Stale-reference cleanup statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaleCleanupStats {
    pub chunks_cleaned: usize,
    pub documents_cleaned: usize,
    pub orphaned_relationships_cleaned: usize,
    pub mode: String,
}

/// Aggregate relationship statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationshipStats {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub total_relationships_found: usize,
    pub relationship_types_distribution: BTreeMap<String, usize>,
    pub total_merges: usize,
    pub documents_with_merges: usize,
    pub average_chunks_per_document: f64,
    pub documents_created_24h: usize,
    pub merges_performed_24h: usize,
}

fn content_preview(content: &str) -> String {
    if content.chars().count() > 100 {
        let prefix: String = content.chars().take(100).collect();
        format!("{prefix}...")
    } else {
        content.to_string()
    }
}

fn token_set(content: &str) -> HashSet<String> {
    content
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// The relationship graph: adjacency, semantic and co-occurrence edges,
/// dedup lineage, and the durable merge-history log.
pub struct RelationshipGraph {
    tiers: TierSet,
    config: ChunkRelationshipConfig,
    chunk_cache: DashMap<String, ChunkRelationship>,
    document_cache: DashMap<String, DocumentRelationship>,
    history: MergeHistoryStore,
}

impl RelationshipGraph {
    pub fn new(tiers: TierSet, config: ChunkRelationshipConfig) -> Self {
        let history = MergeHistoryStore::new(Arc::clone(&tiers.short_term));
        RelationshipGraph {
            tiers,
            config,
            chunk_cache: DashMap::new(),
            document_cache: DashMap::new(),
            history,
        }
    }

    pub fn config(&self) -> &ChunkRelationshipConfig {
        &self.config
    }

    pub fn merge_history(&self) -> &MergeHistoryStore {
        &self.history
    }

    // =====================================================================
    // Chunk construction and registration
    // =====================================================================

    /// Build store records for a document's chunks, stamping adjacency
    /// metadata onto each. Pure: touches no caches, so a failed insert
    /// leaves the graph untouched.
    pub fn build_chunk_records(
        &self,
        base_metadata: &Metadata,
        chunks: &[String],
        memory_id: &str,
        collection: CollectionType,
        now: f64,
    ) -> Vec<ChunkRecord> {
        let total = chunks.len();
        let window = self.config.context_window_size;

        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let chunk_id = format!("{memory_id}_chunk_{i}");
                let mut metadata = base_metadata.clone();

                metadata.insert("chunk_id", chunk_id.clone());
                metadata.insert("document_id", memory_id);
                metadata.insert("memory_id", memory_id);
                metadata.insert("chunk_index", i as i64);
                metadata.insert("total_chunks", total as i64);
                metadata.insert("collection_type", collection.to_string());
                if i > 0 {
                    metadata.insert("previous_chunk", format!("{memory_id}_chunk_{}", i - 1));
                }
                if i + 1 < total {
                    metadata.insert("next_chunk", format!("{memory_id}_chunk_{}", i + 1));
                }
                metadata.insert("document_start", i == 0);
                metadata.insert("document_end", i + 1 == total);
                metadata.insert("relative_position", i as f64 / (total.max(2) - 1) as f64);
                metadata.insert("context_start_chunk", i.saturating_sub(window) as i64);
                metadata.insert(
                    "context_end_chunk",
                    (i + window).min(total.saturating_sub(1)) as i64,
                );
                metadata.insert("creation_timestamp", now);

                ChunkRecord {
                    id: chunk_id,
                    content: chunk.clone(),
                    embedding: None,
                    metadata,
                }
            })
            .collect()
    }

    /// Populate graph caches for a freshly inserted document. Call only
    /// after the store insert succeeded.
    pub fn register_document(
        &self,
        records: &[ChunkRecord],
        content_length: usize,
        memory_id: &str,
        collection: CollectionType,
        language: &str,
        now: f64,
    ) {
        let mut chunk_ids = Vec::with_capacity(records.len());

        for record in records {
            let metadata = &record.metadata;
            let i = metadata.get_i64("chunk_index").unwrap_or(0) as usize;
            let total = metadata.get_i64("total_chunks").unwrap_or(1) as usize;

            let relationship = ChunkRelationship {
                chunk_id: record.id.clone(),
                document_id: memory_id.to_string(),
                chunk_index: i,
                content_preview: content_preview(&record.content),
                related_chunks: Vec::new(),
                deduplication_sources: Vec::new(),
                relationship_strength: BTreeMap::new(),
                complex: ComplexRelationships {
                    previous_chunk: metadata.get_str("previous_chunk").map(String::from),
                    next_chunk: metadata.get_str("next_chunk").map(String::from),
                    document_start: i == 0,
                    document_end: i + 1 == total,
                    relative_position: metadata.get_f64("relative_position").unwrap_or(0.0),
                    context_window: (
                        metadata.get_i64("context_start_chunk").unwrap_or(0) as usize,
                        metadata.get_i64("context_end_chunk").unwrap_or(0) as usize,
                    ),
                },
            };

            chunk_ids.push(record.id.clone());
            self.chunk_cache.insert(record.id.clone(), relationship);
        }

        self.document_cache.insert(
            memory_id.to_string(),
            DocumentRelationship {
                document_id: memory_id.to_string(),
                content_length,
                chunk_count: records.len(),
                creation_time: now,
                collection,
                language: language.to_string(),
                chunk_ids,
                deduplication_history: Vec::new(),
                related_documents: Vec::new(),
                consolidated_into: None,
                consolidation_timestamp: None,
                consolidated_chunk_count: None,
                merge_benefit_score: None,
            },
        );
    }

    // =====================================================================
    // Edge creation at ingest
    // =====================================================================

    /// Probe the collection for semantically similar existing chunks and
    /// add edges above the configured threshold.
    pub async fn establish_semantic_edges(
        &self,
        records: &[ChunkRecord],
        collection: CollectionType,
    ) -> MemoryResult<()> {
        let store = self.tiers.get(collection);
        let threshold = self.config.semantic_similarity_threshold;
        let probe_k = self.config.semantic_probe_k;

        for record in records {
            let Some(embedding) = &record.embedding else {
                continue;
            };
            let document_id = record.metadata.document_id().unwrap_or_default().to_string();

            let hits = store.search(embedding, probe_k).await?;
            let mut added = false;

            for (hit, similarity) in hits {
                if similarity < threshold {
                    continue;
                }
                if hit.metadata.is_system_doc() {
                    continue;
                }
                // Same-document context comes from adjacency, not edges.
                if hit.metadata.document_id() == Some(document_id.as_str()) {
                    continue;
                }
                let Some(target_id) = hit.metadata.get_str("chunk_id") else {
                    continue;
                };

                if let Some(mut entry) = self.chunk_cache.get_mut(&record.id) {
                    entry.related_chunks.push(RelatedChunkEdge {
                        target_chunk_id: target_id.to_string(),
                        edge_type: EdgeType::SemanticSimilarity,
                        score: f64::from(similarity),
                        context_relevance: Some((f64::from(similarity) + 0.1).min(1.0)),
                        common_terms: Vec::new(),
                    });
                    entry
                        .relationship_strength
                        .insert(target_id.to_string(), f64::from(similarity));
                    added = true;
                }
            }

            if added {
                if let Err(e) = self.persist_chunk_edges(&record.id).await {
                    warn!(chunk_id = %record.id, error = %e, "failed to persist semantic edges");
                }
            }
        }
        Ok(())
    }

    /// Add co-occurrence edges among a document's own chunks: two chunks
    /// sharing at least the configured number of tokens get an edge scored
    /// by Jaccard overlap.
    pub async fn establish_co_occurrence_edges(&self, records: &[ChunkRecord]) -> MemoryResult<()> {
        if records.len() < 2 {
            return Ok(());
        }

        let token_sets: Vec<HashSet<String>> =
            records.iter().map(|r| token_set(&r.content)).collect();
        let mut touched = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let mut edges = Vec::new();
            for (j, other) in records.iter().enumerate() {
                if i == j {
                    continue;
                }
                let shared: Vec<&String> = token_sets[i].intersection(&token_sets[j]).collect();
                if shared.len() < self.config.co_occurrence_min_shared {
                    continue;
                }
                let union = token_sets[i].union(&token_sets[j]).count();
                let score = shared.len() as f64 / union.max(1) as f64;

                edges.push(RelatedChunkEdge {
                    target_chunk_id: other.id.clone(),
                    edge_type: EdgeType::CoOccurrence,
                    score,
                    context_relevance: None,
                    common_terms: shared.iter().take(10).map(|s| (*s).clone()).collect(),
                });
            }

            if !edges.is_empty() {
                if let Some(mut entry) = self.chunk_cache.get_mut(&record.id) {
                    entry.related_chunks.extend(edges);
                }
                touched.push(record.id.clone());
            }
        }

        for chunk_id in touched {
            if let Err(e) = self.persist_chunk_edges(&chunk_id).await {
                warn!(chunk_id = %chunk_id, error = %e, "failed to persist co-occurrence edges");
            }
        }
        Ok(())
    }

    /// Write a chunk's relationship fields back into store metadata.
    pub async fn persist_chunk_edges(&self, chunk_id: &str) -> MemoryResult<()> {
        let Some(entry) = self.chunk_cache.get(chunk_id).map(|e| e.clone()) else {
            return Ok(());
        };

        let fields = serialize_chunk_fields(
            &entry.related_chunks,
            &entry.deduplication_sources,
            &entry.relationship_strength,
        );
        if fields.is_empty() {
            return Ok(());
        }

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let hits = store
                .get(&MetadataFilter::ChunkId(chunk_id.to_string()))
                .await?;
            if let Some(record) = hits.into_iter().next() {
                let mut metadata = record.metadata.clone();
                for (key, value) in &fields {
                    metadata.insert(key.clone(), value.clone());
                }
                metadata.insert("metadata_updated_at", now_secs());
                store
                    .update_metadata(&[record.id.clone()], vec![metadata])
                    .await?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Stamp a document's dedup history onto each of its chunks.
    async fn persist_document_history(&self, document_id: &str) -> MemoryResult<()> {
        let Some(doc) = self.document_cache.get(document_id).map(|e| e.clone()) else {
            return Ok(());
        };
        let payload = serialize_json(&doc.deduplication_history, "[]");

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let hits = store
                .get(&MetadataFilter::DocumentId(document_id.to_string()))
                .await?;
            if hits.is_empty() {
                continue;
            }
            let mut ids = Vec::with_capacity(hits.len());
            let mut metadatas = Vec::with_capacity(hits.len());
            for record in hits {
                let mut metadata = record.metadata.clone();
                metadata.insert(FIELD_DEDUP_HISTORY, payload.clone());
                ids.push(record.id);
                metadatas.push(metadata);
            }
            store.update_metadata(&ids, metadatas).await?;
            return Ok(());
        }
        Ok(())
    }

    // =====================================================================
    // Lazy hydration
    // =====================================================================

    /// Load a chunk's relationship state from the store if not cached.
    pub async fn hydrate_chunk(&self, chunk_id: &str) -> bool {
        if self.chunk_cache.contains_key(chunk_id) {
            return true;
        }

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let hits = match store.get(&MetadataFilter::ChunkId(chunk_id.to_string())).await {
                Ok(hits) => hits,
                Err(e) => {
                    debug!(chunk_id, error = %e, "error hydrating chunk");
                    continue;
                }
            };
            let Some(record) = hits.into_iter().next() else {
                continue;
            };

            let metadata = &record.metadata;
            let persisted = deserialize_chunk_fields(metadata);
            let document_id = metadata.document_id().unwrap_or_default().to_string();
            let i = metadata.get_i64("chunk_index").unwrap_or(0) as usize;

            self.chunk_cache.insert(
                chunk_id.to_string(),
                ChunkRelationship {
                    chunk_id: chunk_id.to_string(),
                    document_id: document_id.clone(),
                    chunk_index: i,
                    content_preview: content_preview(&record.content),
                    related_chunks: persisted.related_chunks,
                    deduplication_sources: persisted.deduplication_sources,
                    relationship_strength: persisted.relationship_strength,
                    complex: ComplexRelationships {
                        previous_chunk: metadata.get_str("previous_chunk").map(String::from),
                        next_chunk: metadata.get_str("next_chunk").map(String::from),
                        document_start: metadata.get_bool("document_start").unwrap_or(false),
                        document_end: metadata.get_bool("document_end").unwrap_or(false),
                        relative_position: metadata.get_f64("relative_position").unwrap_or(0.0),
                        context_window: (
                            metadata.get_i64("context_start_chunk").unwrap_or(0) as usize,
                            metadata.get_i64("context_end_chunk").unwrap_or(0) as usize,
                        ),
                    },
                },
            );

            if !document_id.is_empty() && !self.document_cache.contains_key(&document_id) {
                self.hydrate_document(&document_id).await;
            }
            debug!(chunk_id, collection = %collection, "lazily hydrated chunk");
            return true;
        }
        false
    }

    /// Load a document's relationship state from the store if not cached.
    pub async fn hydrate_document(&self, document_id: &str) -> bool {
        if self.document_cache.contains_key(document_id) {
            return true;
        }

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let hits = match store
                .get(&MetadataFilter::DocumentId(document_id.to_string()))
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    debug!(document_id, error = %e, "error hydrating document");
                    continue;
                }
            };
            if hits.is_empty() {
                continue;
            }

            let mut chunk_ids: Vec<(usize, String)> = hits
                .iter()
                .map(|r| (r.metadata.get_i64("chunk_index").unwrap_or(0) as usize, r.id.clone()))
                .collect();
            chunk_ids.sort();

            let first = &hits[0].metadata;
            let dedup_history: Vec<DedupHistoryEntry> =
                deserialize_json(first.get_str(FIELD_DEDUP_HISTORY));

            self.document_cache.insert(
                document_id.to_string(),
                DocumentRelationship {
                    document_id: document_id.to_string(),
                    content_length: 0,
                    chunk_count: first.get_i64("total_chunks").unwrap_or(hits.len() as i64) as usize,
                    creation_time: first.get_f64("creation_timestamp").unwrap_or(0.0),
                    collection,
                    language: first.get_str("language").unwrap_or("text").to_string(),
                    chunk_ids: chunk_ids.into_iter().map(|(_, id)| id).collect(),
                    deduplication_history: dedup_history,
                    related_documents: Vec::new(),
                    consolidated_into: None,
                    consolidation_timestamp: None,
                    consolidated_chunk_count: None,
                    merge_benefit_score: None,
                },
            );
            debug!(document_id, collection = %collection, "lazily hydrated document");
            return true;
        }
        false
    }

    // =====================================================================
    // Edge reads
    // =====================================================================

    /// Up to `k` related chunks for a found chunk: adjacency within the
    /// same document, persisted semantic edges, and merged-source chunks.
    pub async fn retrieve_related(&self, chunk_id: &str, k: usize) -> Vec<RelatedChunkInfo> {
        let k = if k == 0 { self.config.max_related_chunks } else { k };

        if !self.hydrate_chunk(chunk_id).await {
            warn!(chunk_id, "chunk not found for related retrieval");
            return Vec::new();
        }
        let chunk = match self.chunk_cache.get(chunk_id) {
            Some(entry) => entry.clone(),
            None => return Vec::new(),
        };
        self.hydrate_document(&chunk.document_id).await;

        let mut related = Vec::new();

        // Adjacent chunks from the same document.
        if let Some(doc) = self.document_cache.get(&chunk.document_id).map(|e| e.clone()) {
            let start = chunk.chunk_index.saturating_sub(k / 2);
            let end = (chunk.chunk_index + k / 2 + 1).min(doc.chunk_count);
            for i in start..end {
                if i == chunk.chunk_index {
                    continue;
                }
                let neighbor_id = format!("{}_chunk_{i}", chunk.document_id);
                if !self.hydrate_chunk(&neighbor_id).await {
                    continue;
                }
                if let Some(neighbor) = self.chunk_cache.get(&neighbor_id) {
                    let distance = chunk.chunk_index.abs_diff(i);
                    related.push(RelatedChunkInfo {
                        chunk_id: neighbor_id.clone(),
                        document_id: chunk.document_id.clone(),
                        chunk_index: i,
                        relationship_type: EdgeType::Adjacent,
                        content_preview: neighbor.content_preview.clone(),
                        context_relevance: 1.0 - distance as f64 / k as f64,
                        distance_from_source: Some(distance),
                    });
                }
            }
        }

        // Persisted semantic / co-occurrence edges.
        for edge in &chunk.related_chunks {
            if !self.hydrate_chunk(&edge.target_chunk_id).await {
                continue;
            }
            if let Some(target) = self.chunk_cache.get(&edge.target_chunk_id) {
                related.push(RelatedChunkInfo {
                    chunk_id: edge.target_chunk_id.clone(),
                    document_id: target.document_id.clone(),
                    chunk_index: target.chunk_index,
                    relationship_type: edge.edge_type,
                    content_preview: target.content_preview.clone(),
                    context_relevance: edge.context_relevance.unwrap_or(edge.score),
                    distance_from_source: None,
                });
            }
        }

        // Chunks of documents absorbed by this one during deduplication.
        related.extend(self.merge_related_chunks(&chunk.document_id, k));

        related.sort_by(|a, b| {
            b.context_relevance
                .partial_cmp(&a.context_relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.distance_from_source
                        .unwrap_or(usize::MAX)
                        .cmp(&b.distance_from_source.unwrap_or(usize::MAX))
                })
        });
        related.truncate(k);
        related
    }

    /// Chunks from documents merged into `document_id`, scored at a fixed
    /// relevance.
    fn merge_related_chunks(&self, document_id: &str, k: usize) -> Vec<RelatedChunkInfo> {
        let mut out = Vec::new();
        let Some(doc) = self.document_cache.get(document_id).map(|e| e.clone()) else {
            return out;
        };

        'outer: for merge in &doc.deduplication_history {
            for source_doc_id in &merge.source_documents {
                let Some(source_doc) = self.document_cache.get(source_doc_id).map(|e| e.clone())
                else {
                    continue;
                };
                for chunk_id in &source_doc.chunk_ids {
                    if let Some(chunk) = self.chunk_cache.get(chunk_id) {
                        out.push(RelatedChunkInfo {
                            chunk_id: chunk_id.clone(),
                            document_id: source_doc_id.clone(),
                            chunk_index: chunk.chunk_index,
                            relationship_type: EdgeType::MergedSource,
                            content_preview: chunk.content_preview.clone(),
                            context_relevance: 0.8,
                            distance_from_source: None,
                        });
                        if out.len() >= k {
                            break 'outer;
                        }
                    }
                }
            }
        }
        out
    }

    // =====================================================================
    // Deduplication merges
    // =====================================================================

    /// Rewire edges of merged documents onto the primary and append a
    /// durable merge event.
    pub async fn handle_deduplication_merge(
        &self,
        primary_doc_id: &str,
        merged_doc_ids: &[String],
        similarity_scores: &[f64],
    ) -> MemoryResult<MergeSummary> {
        self.history.ensure_loaded().await?;
        let now = now_secs();

        let mut event = self
            .history
            .record_merge(primary_doc_id, merged_doc_ids, similarity_scores)
            .await?;

        let mut preserved: Vec<String> = Vec::new();

        self.hydrate_document(primary_doc_id).await;
        if let Some(mut primary) = self.document_cache.get_mut(primary_doc_id) {
            primary.deduplication_history.push(DedupHistoryEntry {
                merge_id: event.merge_id.clone(),
                merged_count: merged_doc_ids.len(),
                merge_timestamp: now,
                source_documents: merged_doc_ids.to_vec(),
            });
        }

        let mut all_related: BTreeSet<String> = self
            .document_cache
            .get(primary_doc_id)
            .map(|d| d.related_documents.iter().cloned().collect())
            .unwrap_or_default();
        let mut consolidated_chunks = self
            .document_cache
            .get(primary_doc_id)
            .map(|d| d.chunk_count)
            .unwrap_or(0);

        for merged_id in merged_doc_ids {
            let Some(merged) = self.document_cache.get(merged_id).map(|e| e.clone()) else {
                continue;
            };

            all_related.extend(merged.related_documents.iter().cloned());
            preserved.extend(merged.related_documents.iter().cloned());
            consolidated_chunks += merged.chunk_count;

            let similarity = event
                .similarity_scores
                .get(merged_id)
                .copied()
                .unwrap_or(0.0);

            for chunk_id in &merged.chunk_ids {
                if let Some(mut chunk) = self.chunk_cache.get_mut(chunk_id) {
                    chunk.deduplication_sources.push(DedupSourceRecord {
                        original_document: merged_id.clone(),
                        merge_timestamp: now,
                        similarity_score: similarity,
                        merged_into: primary_doc_id.to_string(),
                    });
                }
            }

            if let Some(mut merged_mut) = self.document_cache.get_mut(merged_id) {
                merged_mut.consolidated_into = Some(primary_doc_id.to_string());
                merged_mut.consolidation_timestamp = Some(now);
            }
        }

        let average_similarity = if similarity_scores.is_empty() {
            0.0
        } else {
            similarity_scores.iter().sum::<f64>() / similarity_scores.len() as f64
        };

        if let Some(mut primary) = self.document_cache.get_mut(primary_doc_id) {
            primary.related_documents = all_related.into_iter().collect();
            primary.consolidated_chunk_count = Some(consolidated_chunks);
            primary.merge_benefit_score = Some(average_similarity);
        }

        // Re-record the event with the preserved relationships filled in.
        event.preserved_relationships = preserved.clone();
        self.history.append(event.clone()).await?;

        if let Err(e) = self.persist_document_history(primary_doc_id).await {
            warn!(document_id = primary_doc_id, error = %e, "failed to persist dedup history");
        }

        info!(
            primary = primary_doc_id,
            merged = merged_doc_ids.len(),
            "handled deduplication merge"
        );

        Ok(MergeSummary {
            merge_id: event.merge_id,
            documents_merged: merged_doc_ids.len(),
            relationships_preserved: preserved.len(),
            average_similarity,
        })
    }

    // =====================================================================
    // Cleanup and introspection
    // =====================================================================

    /// Drop cache entries and edges whose targets no longer exist.
    ///
    /// With `deleted_ids` the removal is targeted; otherwise a full scan
    /// gathers every live chunk id from both tiers.
    pub async fn cleanup_stale_references(
        &self,
        deleted_ids: Option<&[String]>,
    ) -> StaleCleanupStats {
        let mut stats = StaleCleanupStats {
            mode: if deleted_ids.is_some() { "targeted" } else { "full_scan" }.to_string(),
            ..Default::default()
        };

        match deleted_ids {
            Some(ids) => {
                for id in ids {
                    if self.document_cache.remove(id).is_some() {
                        stats.documents_cleaned += 1;
                    }
                    if self.chunk_cache.remove(id).is_some() {
                        stats.chunks_cleaned += 1;
                    }
                    let prefix = format!("{id}_chunk_");
                    let orphans: Vec<String> = self
                        .chunk_cache
                        .iter()
                        .filter(|e| e.key().starts_with(&prefix))
                        .map(|e| e.key().clone())
                        .collect();
                    for orphan in orphans {
                        self.chunk_cache.remove(&orphan);
                        stats.chunks_cleaned += 1;
                    }
                }
            }
            None => {
                let mut valid_chunk_ids: HashSet<String> = HashSet::new();
                for collection in CollectionType::all() {
                    match self.tiers.get(collection).get_all().await {
                        Ok(records) => valid_chunk_ids.extend(records.into_iter().map(|r| r.id)),
                        Err(e) => {
                            warn!(collection = %collection, error = %e, "error scanning for stale refs")
                        }
                    }
                }

                let orphan_chunks: Vec<String> = self
                    .chunk_cache
                    .iter()
                    .filter(|e| !valid_chunk_ids.contains(e.key()))
                    .map(|e| e.key().clone())
                    .collect();
                for id in orphan_chunks {
                    self.chunk_cache.remove(&id);
                    stats.chunks_cleaned += 1;
                }

                let valid_doc_ids: HashSet<String> = valid_chunk_ids
                    .iter()
                    .map(|id| match id.rsplit_once("_chunk_") {
                        Some((doc, _)) => doc.to_string(),
                        None => id.clone(),
                    })
                    .collect();

                let orphan_docs: Vec<String> = self
                    .document_cache
                    .iter()
                    .filter(|e| !valid_doc_ids.contains(e.key()))
                    .map(|e| e.key().clone())
                    .collect();
                for id in orphan_docs {
                    self.document_cache.remove(&id);
                    stats.documents_cleaned += 1;
                }

                for mut entry in self.chunk_cache.iter_mut() {
                    let before = entry.related_chunks.len();
                    entry
                        .related_chunks
                        .retain(|edge| valid_chunk_ids.contains(&edge.target_chunk_id));
                    stats.orphaned_relationships_cleaned += before - entry.related_chunks.len();
                }
            }
        }

        info!(
            mode = %stats.mode,
            documents = stats.documents_cleaned,
            chunks = stats.chunks_cleaned,
            edges = stats.orphaned_relationships_cleaned,
            "stale reference cleanup complete"
        );
        stats
    }

    /// Comprehensive context for one document.
    pub async fn document_context(&self, document_id: &str) -> Option<serde_json::Value> {
        if !self.hydrate_document(document_id).await {
            return None;
        }
        let doc = self.document_cache.get(document_id)?.clone();
        let now = now_secs();

        let mut context = serde_json::json!({
            "document_id": doc.document_id,
            "creation_time": doc.creation_time,
            "age_days": (now - doc.creation_time) / 86_400.0,
            "chunk_count": doc.chunk_count,
            "collection": doc.collection.to_string(),
            "language": doc.language,
            "deduplication_history": doc.deduplication_history,
            "related_documents": doc.related_documents,
        });

        if let Some(consolidated) = doc.consolidated_chunk_count {
            context["consolidation_info"] = serde_json::json!({
                "is_consolidated": true,
                "original_chunk_count": doc.chunk_count,
                "total_consolidated_chunks": consolidated,
                "merge_benefit_score": doc.merge_benefit_score.unwrap_or(0.0),
            });
        }
        if !doc.deduplication_history.is_empty() {
            let absorbed: usize = doc
                .deduplication_history
                .iter()
                .map(|m| m.source_documents.len())
                .sum();
            let latest = doc
                .deduplication_history
                .iter()
                .map(|m| m.merge_timestamp)
                .fold(f64::MIN, f64::max);
            context["merge_statistics"] = serde_json::json!({
                "total_merges": doc.deduplication_history.len(),
                "documents_absorbed": absorbed,
                "latest_merge": latest,
            });
        }
        Some(context)
    }

    /// Aggregate statistics over the graph and both tiers.
    pub async fn statistics(&self) -> RelationshipStats {
        let _ = self.history.ensure_loaded().await;
        let now = now_secs();

        let mut total_chunks = 0usize;
        let mut document_ids: HashSet<String> = HashSet::new();
        let mut chunk_counts: Vec<usize> = Vec::new();
        let mut creation_times: Vec<f64> = Vec::new();

        for collection in CollectionType::all() {
            if let Ok(records) = self.tiers.get(collection).get_all().await {
                for record in records {
                    if record.metadata.is_system_doc() {
                        continue;
                    }
                    total_chunks += 1;
                    if let Some(doc_id) = record.metadata.document_id() {
                        if document_ids.insert(doc_id.to_string()) {
                            chunk_counts
                                .push(record.metadata.get_i64("total_chunks").unwrap_or(1) as usize);
                            creation_times
                                .push(record.metadata.get_f64("creation_timestamp").unwrap_or(0.0));
                        }
                    }
                }
            }
        }

        let mut relationship_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_relationships = 0usize;
        for entry in self.chunk_cache.iter() {
            for edge in &entry.related_chunks {
                total_relationships += 1;
                let name = serde_json::to_value(edge.edge_type)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "related".to_string());
                *relationship_types.entry(name).or_insert(0) += 1;
            }
        }

        let merges = self.history.snapshot();
        let day_ago = now - 86_400.0;

        RelationshipStats {
            total_documents: document_ids.len(),
            total_chunks,
            total_relationships_found: total_relationships,
            relationship_types_distribution: relationship_types,
            total_merges: merges.len(),
            documents_with_merges: self
                .document_cache
                .iter()
                .filter(|d| !d.deduplication_history.is_empty())
                .count(),
            average_chunks_per_document: if chunk_counts.is_empty() {
                0.0
            } else {
                chunk_counts.iter().sum::<usize>() as f64 / chunk_counts.len() as f64
            },
            documents_created_24h: creation_times.iter().filter(|t| **t > day_ago).count(),
            merges_performed_24h: merges.values().filter(|m| m.timestamp > day_ago).count(),
        }
    }

    /// Drop cache entries for specific ids (used by the delete path).
    pub fn evict(&self, document_id: &str, chunk_ids: &[String]) {
        self.document_cache.remove(document_id);
        for chunk_id in chunk_ids {
            self.chunk_cache.remove(chunk_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_chunk(&self, chunk_id: &str) -> Option<ChunkRelationship> {
        self.chunk_cache.get(chunk_id).map(|e| e.clone())
    }

    #[cfg(test)]
    pub(crate) fn cached_document(&self, document_id: &str) -> Option<DocumentRelationship> {
        self.document_cache.get(document_id).map(|e| e.clone())
    }
}

impl std::fmt::Debug for RelationshipGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipGraph")
            .field("chunks_cached", &self.chunk_cache.len())
            .field("documents_cached", &self.document_cache.len())
            .finish_non_exhaustive()
    }
}
