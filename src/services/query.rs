//! Query execution: smart-routed per-tier search, enhanced scoring,
//! access-statistics feedback, and context expansion through the
//! relationship graph.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::dedup::Deduplicator;
use crate::error::MemoryResult;
use crate::monitor::QueryPerformanceMonitor;
use crate::relationships::{RelatedChunkInfo, RelationshipGraph};
use crate::scoring::ImportanceScorer;
use crate::services::routing::{QueryPlan, QueryRouter};
use crate::store::{Embedder, Reranker, TierSet, VectorStore};
use crate::types::{now_secs, CollectionType, Metadata};

/// Boost cap helpers for enhanced scoring.
const DEDUP_BOOST_FACTOR: f64 = 0.05;
const RECENCY_BOOST_FACTOR: f64 = 0.05;

/// One query hit returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub collection: String,
    pub distance: f64,
    pub retrieval_score: f64,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_chunks: Vec<RelatedChunkInfo>,
}

/// Structured query result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub content: Vec<QueryHit>,
    pub total_results: usize,
    pub collections_searched: Vec<String>,
    pub smart_routing_used: bool,
    pub processing_time_ms: f64,
    pub related_chunks_included: usize,
    pub effective_k: usize,
}

/// The query service.
pub struct QueryService {
    tiers: TierSet,
    embedder: Arc<dyn Embedder>,
    router: QueryRouter,
    scorer: Arc<ImportanceScorer>,
    graph: Arc<RelationshipGraph>,
    monitor: Arc<QueryPerformanceMonitor>,
    deduplicator: Arc<Deduplicator>,
    reranker: Option<Arc<dyn Reranker>>,
    related_retrieval_enabled: bool,
}

impl QueryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tiers: TierSet,
        embedder: Arc<dyn Embedder>,
        router: QueryRouter,
        scorer: Arc<ImportanceScorer>,
        graph: Arc<RelationshipGraph>,
        monitor: Arc<QueryPerformanceMonitor>,
        deduplicator: Arc<Deduplicator>,
        reranker: Option<Arc<dyn Reranker>>,
        related_retrieval_enabled: bool,
    ) -> Self {
        QueryService {
            tiers,
            embedder,
            router,
            scorer,
            graph,
            monitor,
            deduplicator,
            reranker,
            related_retrieval_enabled,
        }
    }

    /// Query across memory collections with dedup-aware routing.
    pub async fn query_memories(
        &self,
        query: &str,
        collections: Option<&[CollectionType]>,
        k: usize,
        use_smart_routing: bool,
        use_reranker: bool,
    ) -> MemoryResult<QueryResponse> {
        let start = now_secs();

        let plan = match collections {
            None if use_smart_routing => {
                let stats = self.deduplicator.stats();
                self.router.smart_query_routing(query, k, Some(&stats))
            }
            Some(explicit) => QueryPlan::default_plan(explicit, k),
            None => QueryPlan::default_plan(&CollectionType::all(), k),
        };

        let query_embedding = self.embedder.embed(query).await?;
        let now = start;

        // Gather scored candidates from every planned tier.
        let mut candidates: Vec<QueryHit> = Vec::new();
        for (i, collection) in plan.search_order.iter().enumerate() {
            let limit = plan
                .collection_limits
                .get(i)
                .copied()
                .unwrap_or(plan.effective_k);
            // Over-fetch to leave room for reranking.
            let search_k = (limit * 2).max(10);

            let hits = match self.tiers.get(*collection).search(&query_embedding, search_k).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "search failed, skipping tier");
                    continue;
                }
            };

            for (record, similarity) in hits {
                if record.metadata.is_system_doc() {
                    continue;
                }
                let distance = f64::from(1.0 - similarity).max(0.0);
                let score = self.enhanced_retrieval_score(distance, &record.metadata, now);

                candidates.push(QueryHit {
                    chunk_id: record
                        .metadata
                        .get_str("chunk_id")
                        .unwrap_or(record.id.as_str())
                        .to_string(),
                    document_id: record
                        .metadata
                        .document_id()
                        .unwrap_or_default()
                        .to_string(),
                    content: record.content,
                    collection: collection.to_string(),
                    distance,
                    retrieval_score: score,
                    metadata: record.metadata,
                    related_chunks: Vec::new(),
                });
            }
        }

        let total_results = candidates.len();
        candidates.sort_by(|a, b| {
            b.retrieval_score
                .partial_cmp(&a.retrieval_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(plan.effective_k);

        // Cross-encoder rerank of the final page, when wired and requested.
        if use_reranker {
            if let Some(reranker) = &self.reranker {
                let mut rescored = Vec::with_capacity(candidates.len());
                for mut hit in candidates {
                    match reranker.score(query, &hit.content).await {
                        Ok(score) => hit.retrieval_score = f64::from(score),
                        Err(e) => debug!(error = %e, "reranker failed for hit, keeping base score"),
                    }
                    rescored.push(hit);
                }
                rescored.sort_by(|a, b| {
                    b.retrieval_score
                        .partial_cmp(&a.retrieval_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                candidates = rescored;
            }
        }

        // Access-statistics feedback: best-effort, a lost update is fine.
        self.update_access_stats(&mut candidates, now).await;

        // Context expansion: up to 2 related chunks per hit.
        let mut related_included = 0usize;
        if self.related_retrieval_enabled {
            for hit in &mut candidates {
                let related = self.graph.retrieve_related(&hit.chunk_id, 2).await;
                related_included += related.len();
                hit.related_chunks = related;
            }
        }

        let processing_time_ms = (now_secs() - start) * 1000.0;
        let smart_routing_used =
            use_smart_routing && collections.is_none() && plan.differs_from_default();
        let collections_searched: Vec<String> =
            plan.search_order.iter().map(|c| c.to_string()).collect();

        // Monitor recording never affects the response.
        self.monitor.track_query(
            query,
            total_results,
            &collections_searched,
            smart_routing_used,
            related_included,
            plan.effective_k,
            processing_time_ms,
        );

        Ok(QueryResponse {
            content: candidates,
            total_results,
            collections_searched,
            smart_routing_used,
            processing_time_ms,
            related_chunks_included: related_included,
            effective_k: plan.effective_k,
        })
    }

    /// Query limited to permanent content (`permanent_flag`, permanent
    /// tier, or importance at the permanent threshold).
    pub async fn query_permanent(&self, query: &str, k: usize) -> MemoryResult<QueryResponse> {
        let mut response = self
            .query_memories(query, Some(&CollectionType::all()), k * 3, false, false)
            .await?;

        response.content.retain(|hit| {
            hit.metadata.get_bool("permanent_flag").unwrap_or(false)
                || hit.metadata.get_str("ttl_tier") == Some("permanent")
                || hit.metadata.get_f64("importance_score").unwrap_or(0.0) >= 0.95
        });
        response.content.truncate(k);
        response.total_results = response.content.len();
        response.effective_k = k;
        Ok(response)
    }

    /// Base retrieval score plus dedup-lineage and recent-access boosts,
    /// capped at 1.0.
    fn enhanced_retrieval_score(&self, distance: f64, metadata: &Metadata, now: f64) -> f64 {
        let base = self.scorer.calculate_retrieval_score(distance, metadata, now);

        let mut dedup_boost = 0.0;
        if metadata.get_bool("duplicate_merged").unwrap_or(false) {
            let sources: Vec<String> = metadata
                .get_str("duplicate_sources")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            if sources.len() > 1 {
                dedup_boost = DEDUP_BOOST_FACTOR * ((sources.len() + 1) as f64).ln();
            }
        }

        let mut recency_boost = 0.0;
        let last_accessed = metadata.get_f64("last_accessed").unwrap_or(0.0);
        if last_accessed > 0.0 {
            let hours_since = (now - last_accessed) / 3600.0;
            if hours_since < 24.0 {
                recency_boost = RECENCY_BOOST_FACTOR * (1.0 - hours_since / 24.0);
            }
        }

        (base + dedup_boost + recency_boost).min(1.0)
    }

    /// Bump access counters on the returned page and write them back
    /// concurrently. Failures are logged and dropped; the in-memory copy
    /// in the response always reflects the bump.
    async fn update_access_stats(&self, hits: &mut [QueryHit], now: f64) {
        let mut writes = Vec::with_capacity(hits.len());
        for hit in hits.iter_mut() {
            let count = hit.metadata.get_i64("access_count").unwrap_or(0) + 1;
            hit.metadata.insert("access_count", count);
            hit.metadata.insert("last_accessed", now);

            let Some(collection) = CollectionType::parse(&hit.collection) else {
                continue;
            };
            let store = std::sync::Arc::clone(self.tiers.get(collection));
            let chunk_id = hit.chunk_id.clone();
            let metadata = hit.metadata.clone();
            writes.push(async move {
                if let Err(e) = store
                    .update_metadata(&[chunk_id.clone()], vec![metadata])
                    .await
                {
                    debug!(chunk_id = %chunk_id, error = %e, "access-stat write-back failed");
                }
            });
        }
        futures::future::join_all(writes).await;
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("related_retrieval_enabled", &self.related_retrieval_enabled)
            .field("reranker_wired", &self.reranker.is_some())
            .finish_non_exhaustive()
    }
}
