//! Document ingest: scoring, dedup probing, tier routing, chunking,
//! relationship building, and persistence.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::{ChunkLanguage, Chunker};
use crate::dedup::{Deduplicator, ProbeAction};
use crate::error::{MemoryError, MemoryResult};
use crate::lifecycle::LifecycleController;
use crate::relationships::RelationshipGraph;
use crate::scoring::{ImportanceScorer, ScoreContext};
use crate::store::{Embedder, TierSet, VectorStore};
use crate::types::{now_secs, CollectionType, Metadata};

/// Caller's tier selection for an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// Route by importance thresholds
    #[default]
    Auto,
    ShortTerm,
    LongTerm,
}

impl MemoryType {
    pub fn parse(name: &str) -> Option<MemoryType> {
        match name {
            "auto" => Some(MemoryType::Auto),
            "short_term" => Some(MemoryType::ShortTerm),
            "long_term" => Some(MemoryType::LongTerm),
            _ => None,
        }
    }
}

/// Result record of an ingest. Storage failures come back as a record
/// with `success = false` and a typed `error_type`, not an `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct AddReport {
    pub success: bool,
    pub message: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub importance_score: f64,
    pub collection: String,
    pub chunks_added: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// The ingest service.
pub struct StorageService {
    tiers: TierSet,
    embedder: Arc<dyn Embedder>,
    scorer: Arc<ImportanceScorer>,
    deduplicator: Arc<Deduplicator>,
    graph: Arc<RelationshipGraph>,
    lifecycle: Option<LifecycleController>,
    chunker: Chunker,
    short_term_threshold: f64,
    long_term_threshold: f64,
    relationships_enabled: bool,
}

impl StorageService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tiers: TierSet,
        embedder: Arc<dyn Embedder>,
        scorer: Arc<ImportanceScorer>,
        deduplicator: Arc<Deduplicator>,
        graph: Arc<RelationshipGraph>,
        lifecycle: Option<LifecycleController>,
        chunker: Chunker,
        short_term_threshold: f64,
        long_term_threshold: f64,
        relationships_enabled: bool,
    ) -> Self {
        StorageService {
            tiers,
            embedder,
            scorer,
            deduplicator,
            graph,
            lifecycle,
            chunker,
            short_term_threshold,
            long_term_threshold,
            relationships_enabled,
        }
    }

    /// Add a document to the appropriate tier. Returns a result record;
    /// only validation problems surface as `Err`.
    pub async fn add_memory(
        &self,
        content: &str,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
        context: Option<&ScoreContext>,
        memory_type: MemoryType,
        language: Option<&str>,
    ) -> MemoryResult<AddReport> {
        if content.trim().is_empty() {
            return Err(MemoryError::Validation {
                reason: "content must be non-empty".to_string(),
            });
        }

        let now = now_secs();
        let mut enriched = metadata
            .map(Metadata::from_json_object)
            .unwrap_or_default();

        let language = language
            .map(String::from)
            .or_else(|| enriched.get_str("language").map(String::from))
            .unwrap_or_else(|| "text".to_string());

        // 1. Importance.
        let mut importance = self.scorer.calculate_importance(content, &enriched, context);
        enriched.insert("importance_score", importance);

        // 2. Tier selection.
        let collection = match memory_type {
            MemoryType::Auto => {
                if importance >= self.long_term_threshold {
                    CollectionType::LongTerm
                } else if importance >= self.short_term_threshold {
                    CollectionType::ShortTerm
                } else {
                    CollectionType::ShortTerm
                }
            }
            MemoryType::ShortTerm => CollectionType::ShortTerm,
            MemoryType::LongTerm => CollectionType::LongTerm,
        };

        let document_embedding = self.embedder.embed(content).await?;

        // 3. Ingestion-time dedup probe against the chosen tier.
        if self.deduplicator.enabled() {
            let probe = self
                .deduplicator
                .check_ingestion_duplicates(&document_embedding, collection)
                .await;

            match probe.action {
                ProbeAction::BoostExisting => {
                    if let Some(existing) = &probe.existing {
                        if let Err(e) = self
                            .deduplicator
                            .boost_existing_document(existing, &enriched, collection)
                            .await
                        {
                            warn!(error = %e, "failed to boost existing document, adding as new");
                        } else {
                            return Ok(AddReport {
                                success: true,
                                message:
                                    "Boosted existing similar document instead of adding duplicate"
                                        .to_string(),
                                action: "boosted_existing".to_string(),
                                document_id: existing.metadata.document_id().map(String::from),
                                importance_score: importance,
                                collection: "existing".to_string(),
                                chunks_added: 0,
                                similarity_score: Some(probe.similarity),
                                error: None,
                                error_type: None,
                            });
                        }
                    }
                }
                ProbeAction::MergeContent => {
                    info!(
                        similarity = probe.similarity,
                        "similar content detected, adding as new document"
                    );
                }
                ProbeAction::AddNew => {}
            }
        }

        // 4. Metadata enrichment.
        enriched.insert("timestamp", now);
        enriched.insert("last_accessed", now);
        enriched.insert("access_count", 0i64);
        enriched.insert("collection_type", collection.to_string());
        enriched.insert("language", language.clone());
        enriched.insert(
            "context",
            context
                .map(|c| serde_json::to_string(c).unwrap_or_else(|_| "{}".to_string()))
                .unwrap_or_else(|| "{}".to_string()),
        );

        // 5. Lifecycle stamping (TTL, permanence override).
        if let Some(lifecycle) = &self.lifecycle {
            importance = lifecycle.process_document_lifecycle(&mut enriched, importance, now);
        }

        // 6. Chunk and build records with adjacency metadata.
        let memory_id = format!(
            "{collection}_{}_{}",
            (now * 1000.0) as i64,
            rand::thread_rng().gen_range(1000..10000)
        );
        let chunks = self
            .chunker
            .split(content, ChunkLanguage::parse(&language));
        if chunks.is_empty() {
            return Err(MemoryError::Validation {
                reason: "content produced no chunks".to_string(),
            });
        }

        let mut records =
            self.graph
                .build_chunk_records(&enriched, &chunks, &memory_id, collection, now);
        for record in &mut records {
            record.embedding = Some(self.embedder.embed(&record.content).await?);
        }

        // 7. Persist. No partial commits: graph registration happens only
        // after the insert succeeded.
        let store = self.tiers.get(collection);
        if let Err(e) = store.add(records.clone()).await {
            return Ok(self.failure_report(&memory_id, importance, collection, e));
        }

        self.graph.register_document(
            &records,
            content.len(),
            &memory_id,
            collection,
            &language,
            now,
        );

        // 8. Relationship edges (best-effort).
        if self.relationships_enabled {
            if let Err(e) = self.graph.establish_semantic_edges(&records, collection).await {
                warn!(error = %e, document_id = %memory_id, "failed to establish semantic edges");
            }
            if let Err(e) = self.graph.establish_co_occurrence_edges(&records).await {
                warn!(error = %e, document_id = %memory_id, "failed to establish co-occurrence edges");
            }
        }

        info!(
            document_id = %memory_id,
            collection = %collection,
            chunks = records.len(),
            importance,
            "added document"
        );

        Ok(AddReport {
            success: true,
            message: format!("Added {} chunks to {collection} memory", records.len()),
            action: "added".to_string(),
            document_id: Some(memory_id),
            importance_score: importance,
            collection: collection.to_string(),
            chunks_added: records.len(),
            similarity_score: None,
            error: None,
            error_type: None,
        })
    }

    fn failure_report(
        &self,
        memory_id: &str,
        importance: f64,
        collection: CollectionType,
        error: MemoryError,
    ) -> AddReport {
        let error_type = match &error {
            MemoryError::Storage(_) => "storage",
            MemoryError::Filesystem(_) => "filesystem",
            _ => "unknown",
        };
        tracing::error!(
            document_id = memory_id,
            collection = %collection,
            error = %error,
            "failed to add document"
        );
        AddReport {
            success: false,
            message: format!("Failed to add documents to {collection} memory: {error}"),
            action: "error".to_string(),
            document_id: Some(memory_id.to_string()),
            importance_score: importance,
            collection: collection.to_string(),
            chunks_added: 0,
            similarity_score: None,
            error: Some(error.to_string()),
            error_type: Some(error_type.to_string()),
        }
    }

    /// Remove rows from a collection by store id. Delete failures are
    /// logged and left for the next maintenance cycle; the collection is
    /// never cleared as a fallback.
    pub async fn remove_documents(&self, collection: CollectionType, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        match self.tiers.get(collection).delete(ids).await {
            Ok(()) => {
                self.graph.cleanup_stale_references(Some(ids)).await;
                ids.len()
            }
            Err(e) => {
                tracing::error!(
                    count = ids.len(),
                    collection = %collection,
                    error = %e,
                    "failed to delete documents; they will be retried next maintenance cycle"
                );
                0
            }
        }
    }
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("short_term_threshold", &self.short_term_threshold)
            .field("long_term_threshold", &self.long_term_threshold)
            .finish_non_exhaustive()
    }
}
