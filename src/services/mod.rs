//! Service layer: the [`MemoryEngine`] facade and the focused services it
//! wires together.
//!
//! The engine is cheap to clone (everything is behind `Arc`) and safe to
//! share across tasks. Each top-level operation is a unit of work that
//! progresses independently; ingest, query, update, and maintenance may
//! run concurrently.

mod maintenance;
mod query;
mod routing;
mod stats;
mod storage;
mod update;

pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use query::{QueryHit, QueryResponse, QueryService};
pub use routing::{QueryPlan, QueryRouter};
pub use stats::{MemoryStatsReport, PermanenceStats, StatsService};
pub use storage::{AddReport, MemoryType, StorageService};
pub use update::{
    ContentUpdateReport, DeleteReport, ImportanceUpdateReport, MetadataUpdateReport, UpdateService,
};

use std::sync::Arc;

use tracing::warn;

use crate::chunker::Chunker;
use crate::config::EngramConfig;
use crate::dedup::{DedupPassReport, Deduplicator};
use crate::error::MemoryResult;
use crate::lifecycle::{AgingRefreshReport, CleanupReport, LifecycleController, LifecycleStats};
use crate::monitor::{PerformanceSummary, QueryPerformanceMonitor, TimeWindow};
use crate::relationships::{RelatedChunkInfo, RelationshipGraph, RelationshipStats};
use crate::scoring::{ImportanceScorer, ScoreContext};
use crate::store::{Embedder, HashEmbedder, Reranker, TierSet};
use crate::types::CollectionType;

/// The hierarchical memory engine.
///
/// Owns both tiers, the scoring/dedup/relationship subsystems, and the
/// lifecycle controller, exposing the complete operation surface the tool
/// layer is built on.
#[derive(Clone)]
pub struct MemoryEngine {
    tiers: TierSet,
    graph: Arc<RelationshipGraph>,
    deduplicator: Arc<Deduplicator>,
    lifecycle: LifecycleController,
    monitor: Arc<QueryPerformanceMonitor>,
    storage: Arc<StorageService>,
    query: Arc<QueryService>,
    maintenance: Arc<MaintenanceService>,
    update: Arc<UpdateService>,
    stats: Arc<StatsService>,
}

impl MemoryEngine {
    /// Build an engine over the given stores, embedder, and optional
    /// reranker.
    pub fn new(
        config: &EngramConfig,
        tiers: TierSet,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        let management = &config.memory_management;

        let graph = Arc::new(RelationshipGraph::new(
            tiers.clone(),
            management.chunk_relationships.clone(),
        ));
        let deduplicator = Arc::new(Deduplicator::new(
            &config.deduplication,
            tiers.clone(),
            Arc::clone(&graph),
        ));
        let lifecycle =
            LifecycleController::new(&config.lifecycle, tiers.clone(), Arc::clone(&graph));
        let scorer = Arc::new(ImportanceScorer::new(&config.memory_scoring));
        let monitor = Arc::new(QueryPerformanceMonitor::new(&management.query_monitoring));

        let storage = Arc::new(StorageService::new(
            tiers.clone(),
            Arc::clone(&embedder),
            Arc::clone(&scorer),
            Arc::clone(&deduplicator),
            Arc::clone(&graph),
            Some(lifecycle.clone()),
            Chunker::new(management.chunk_size, management.chunk_overlap),
            management.short_term_threshold,
            management.long_term_threshold,
            management.chunk_relationships.enable_related_retrieval,
        ));

        let query = Arc::new(QueryService::new(
            tiers.clone(),
            embedder,
            QueryRouter::new(),
            scorer,
            Arc::clone(&graph),
            Arc::clone(&monitor),
            Arc::clone(&deduplicator),
            reranker,
            management.chunk_relationships.enable_related_retrieval,
        ));

        let maintenance = Arc::new(MaintenanceService::new(
            tiers.clone(),
            Arc::clone(&storage),
            Arc::clone(&deduplicator),
            management.short_term_max_size,
        ));

        let update = Arc::new(UpdateService::new(
            tiers.clone(),
            Arc::clone(&graph),
            Some(lifecycle.clone()),
            Arc::clone(&storage),
        ));

        let stats = Arc::new(StatsService::new(
            tiers.clone(),
            Arc::clone(&monitor),
            Arc::clone(&graph),
            Arc::clone(&deduplicator),
        ));

        MemoryEngine {
            tiers,
            graph,
            deduplicator,
            lifecycle,
            monitor,
            storage,
            query,
            maintenance,
            update,
            stats,
        }
    }

    /// Engine over fresh in-memory tiers with the deterministic hash
    /// embedder. The default backend, and the test configuration.
    pub fn in_memory(config: &EngramConfig) -> Self {
        let embedder = Arc::new(HashEmbedder::new(config.embeddings.dimension));
        Self::new(config, TierSet::in_memory(), embedder, None)
    }

    // =====================================================================
    // Core operations
    // =====================================================================

    /// Ingest a document; on success into the short-term tier, trigger the
    /// size-bound maintenance check.
    pub async fn add_memory(
        &self,
        content: &str,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
        context: Option<&ScoreContext>,
        memory_type: MemoryType,
        language: Option<&str>,
    ) -> MemoryResult<AddReport> {
        let report = self
            .storage
            .add_memory(content, metadata, context, memory_type, language)
            .await?;

        if report.success && report.collection == CollectionType::ShortTerm.to_string() {
            if let Err(e) = self.maintenance.maintain_short_term().await {
                warn!(error = %e, "memory maintenance failed");
            }
        }
        Ok(report)
    }

    /// Query across tiers.
    pub async fn query_memories(
        &self,
        query: &str,
        collections: Option<&[CollectionType]>,
        k: usize,
        use_smart_routing: bool,
        use_reranker: bool,
    ) -> MemoryResult<QueryResponse> {
        self.query
            .query_memories(query, collections, k, use_smart_routing, use_reranker)
            .await
    }

    /// Query restricted to permanent content.
    pub async fn query_permanent(&self, query: &str, k: usize) -> MemoryResult<QueryResponse> {
        self.query.query_permanent(query, k).await
    }

    /// Delete a document from whichever tier holds it.
    pub async fn delete_document(&self, document_id: &str) -> MemoryResult<DeleteReport> {
        self.update.delete_document(document_id).await
    }

    /// Edit a document's importance, recomputing TTL.
    pub async fn update_document_importance(
        &self,
        document_id: &str,
        new_importance: f64,
        reason: Option<&str>,
    ) -> MemoryResult<ImportanceUpdateReport> {
        self.update
            .update_document_importance(document_id, new_importance, reason)
            .await
    }

    /// Merge metadata updates into a single chunk.
    pub async fn update_document_metadata(
        &self,
        chunk_id: &str,
        updates: &crate::types::Metadata,
    ) -> MemoryResult<MetadataUpdateReport> {
        self.update.update_document_metadata(chunk_id, updates).await
    }

    /// Replace a document's content.
    pub async fn update_document_content(
        &self,
        document_id: &str,
        new_content: &str,
        new_metadata: Option<&serde_json::Map<String, serde_json::Value>>,
        preserve_importance: bool,
    ) -> MemoryResult<ContentUpdateReport> {
        self.update
            .update_document_content(document_id, new_content, new_metadata, preserve_importance)
            .await
    }

    // =====================================================================
    // Maintenance, dedup, lifecycle
    // =====================================================================

    /// Force a short-term size-bound maintenance pass.
    pub async fn maintain_short_term(&self) -> MemoryResult<MaintenanceReport> {
        self.maintenance.maintain_short_term().await
    }

    /// Batch-deduplicate a collection.
    pub async fn deduplicate_collection(
        &self,
        collection: CollectionType,
        dry_run: bool,
    ) -> MemoryResult<DedupPassReport> {
        self.deduplicator.deduplicate_collection(collection, dry_run).await
    }

    /// Dry-run duplicate preview for a collection.
    pub async fn preview_duplicates(
        &self,
        collection: CollectionType,
    ) -> MemoryResult<DedupPassReport> {
        self.deduplicator.preview_duplicates(collection).await
    }

    /// The lifecycle controller (TTL, aging, background cadence).
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Delete expired chunks.
    pub async fn cleanup_expired(&self, collection: Option<CollectionType>) -> CleanupReport {
        self.lifecycle.cleanup_expired(collection).await
    }

    /// Refresh stale aged scores.
    pub async fn refresh_aging(
        &self,
        collection: Option<CollectionType>,
        sample_size: usize,
    ) -> AgingRefreshReport {
        self.lifecycle.refresh_aging(collection, sample_size).await
    }

    /// Start the background maintenance worker.
    pub async fn start_background_maintenance(&self) -> MemoryResult<bool> {
        self.lifecycle.start_background_maintenance().await
    }

    /// Stop the background maintenance worker.
    pub async fn stop_background_maintenance(&self) -> MemoryResult<bool> {
        self.lifecycle.stop_background_maintenance().await
    }

    // =====================================================================
    // Introspection
    // =====================================================================

    /// Collection counts and health.
    pub async fn memory_stats(&self) -> MemoryStatsReport {
        self.stats.collection_stats().await
    }

    /// Lifecycle statistics.
    pub async fn lifecycle_stats(&self) -> LifecycleStats {
        self.lifecycle.lifecycle_stats().await
    }

    /// Permanent-content statistics.
    pub async fn permanence_stats(&self) -> PermanenceStats {
        self.stats.permanence_stats().await
    }

    /// Deduplication statistics.
    pub fn deduplication_stats(&self) -> serde_json::Value {
        self.stats.dedup_stats()
    }

    /// Relationship-graph statistics.
    pub async fn relationship_stats(&self) -> RelationshipStats {
        self.stats.relationship_stats().await
    }

    /// Query performance over a window.
    pub fn query_performance(&self, window: TimeWindow) -> PerformanceSummary {
        self.stats.query_performance(window)
    }

    /// Related chunks for one chunk id.
    pub async fn related_chunks(&self, chunk_id: &str, k: usize) -> Vec<RelatedChunkInfo> {
        self.graph.retrieve_related(chunk_id, k).await
    }

    /// Relationship context for one document.
    pub async fn document_context(&self, document_id: &str) -> Option<serde_json::Value> {
        self.graph.document_context(document_id).await
    }

    /// The relationship graph (context expansion, stale-ref sweeps).
    pub fn graph(&self) -> &Arc<RelationshipGraph> {
        &self.graph
    }

    /// The tier stores.
    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// The query performance monitor.
    pub fn monitor(&self) -> &Arc<QueryPerformanceMonitor> {
        &self.monitor
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}
