//! Memory lifecycle management: TTL assignment, aging decay, and the
//! background maintenance cadence.
//!
//! The controller owns the TTL manager and aging function, stamps lifecycle
//! metadata at ingest, and runs a single cooperative background worker that
//! wakes on a fixed interval and dispatches cleanup, statistics, aging
//! refresh, and deep maintenance when their due times pass.

mod aging;
mod ttl;

pub use aging::AgingFunction;
pub use ttl::TtlManager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::config::LifecycleConfig;
use crate::error::MemoryResult;
use crate::relationships::RelationshipGraph;
use crate::store::{TierSet, VectorStore};
use crate::types::{now_secs, CollectionType, Metadata};

/// Per-collection outcome of an expiry cleanup pass.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionCleanup {
    pub collection: String,
    pub total_docs: usize,
    pub expired_docs: usize,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub cleaned_collections: Vec<CollectionCleanup>,
    pub total_expired: usize,
    pub total_checked: usize,
    pub errors: Vec<String>,
}

/// Per-collection outcome of an aging refresh pass.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRefresh {
    pub collection: String,
    pub total_docs: usize,
    pub refreshed_docs: usize,
}

/// Result of an aging refresh pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgingRefreshReport {
    pub refreshed_collections: Vec<CollectionRefresh>,
    pub total_refreshed: usize,
    pub total_checked: usize,
    pub errors: Vec<String>,
}

/// Background task counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub cleanups_run: u64,
    pub statistics_run: u64,
    pub aging_refreshes_run: u64,
    pub deep_maintenance_run: u64,
}

/// Lifecycle statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStats {
    pub aging_enabled: bool,
    pub decay_rate: f64,
    pub minimum_score: f64,
    pub maintenance_enabled: bool,
    pub worker_active: bool,
    pub last_cleanup: f64,
    pub last_statistics: f64,
    pub last_aging_refresh: f64,
    pub last_deep_maintenance: f64,
    pub counters: WorkerStats,
    pub collection_counts: std::collections::BTreeMap<String, usize>,
}

struct DueTimes {
    cleanup: f64,
    statistics: f64,
    aging: f64,
    deep: f64,
}

struct Inner {
    ttl: TtlManager,
    aging: AgingFunction,
    config: LifecycleConfig,
    tiers: TierSet,
    graph: Arc<RelationshipGraph>,
    shutdown: AtomicBool,
    notify: Notify,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    due: RwLock<DueTimes>,
    stats: RwLock<WorkerStats>,
    /// Injectable worker sleep interval (milliseconds), for tests
    sleep_interval_ms: AtomicU64,
}

/// Owns TTL and aging; runs the background maintenance cadence.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(config: &LifecycleConfig, tiers: TierSet, graph: Arc<RelationshipGraph>) -> Self {
        LifecycleController {
            inner: Arc::new(Inner {
                ttl: TtlManager::new(&config.ttl),
                aging: AgingFunction::new(&config.aging),
                config: config.clone(),
                tiers,
                graph,
                shutdown: AtomicBool::new(false),
                notify: Notify::new(),
                worker: Mutex::new(None),
                due: RwLock::new(DueTimes {
                    cleanup: 0.0,
                    statistics: 0.0,
                    aging: 0.0,
                    deep: 0.0,
                }),
                stats: RwLock::new(WorkerStats::default()),
                sleep_interval_ms: AtomicU64::new(config.maintenance.check_interval_secs * 1000),
            }),
        }
    }

    pub fn ttl_manager(&self) -> &TtlManager {
        &self.inner.ttl
    }

    pub fn aging(&self) -> &AgingFunction {
        &self.inner.aging
    }

    /// Override the worker sleep interval (tests drive short cadences).
    pub fn set_sleep_interval_ms(&self, ms: u64) {
        self.inner.sleep_interval_ms.store(ms.max(1), Ordering::Relaxed);
    }

    // =====================================================================
    // Document lifecycle
    // =====================================================================

    /// Stamp lifecycle metadata onto a document at ingest and return the
    /// effective importance.
    ///
    /// A `permanence_flag = "critical"` metadata override raises importance
    /// into the permanent band when the base score is already high.
    pub fn process_document_lifecycle(
        &self,
        metadata: &mut Metadata,
        importance_score: f64,
        now: f64,
    ) -> f64 {
        let mut importance = importance_score;
        metadata.insert("importance_scored_at", now);

        if metadata.get_str("permanence_flag") == Some("critical") && importance >= 0.8 {
            importance = importance.max(0.95);
            metadata.insert("permanence_reason", "user_request");
        }

        metadata.insert("importance_score", importance);
        self.inner.ttl.add_ttl_metadata(metadata, importance, now);
        metadata.insert("aging_enabled", self.inner.aging.enabled());
        metadata.insert("lifecycle_processed_at", now);
        importance
    }

    // =====================================================================
    // Cleanup and aging passes
    // =====================================================================

    /// Delete expired chunks from the given collection (or all), honoring
    /// permanence.
    pub async fn cleanup_expired(&self, collection: Option<CollectionType>) -> CleanupReport {
        self.cleanup_expired_at(collection, now_secs()).await
    }

    /// Expiry pass against an explicit clock, so tests can advance time.
    pub async fn cleanup_expired_at(
        &self,
        collection: Option<CollectionType>,
        now: f64,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let collections: Vec<CollectionType> = match collection {
            Some(c) => vec![c],
            None => CollectionType::all().to_vec(),
        };

        for coll in collections {
            let store = self.inner.tiers.get(coll);
            let records = match store.get_all().await {
                Ok(records) => records,
                Err(e) => {
                    let msg = format!("error scanning {coll}: {e}");
                    error!("{msg}");
                    report.errors.push(msg);
                    continue;
                }
            };

            let total = records.len();
            let expired: Vec<String> = records
                .iter()
                .filter(|r| !r.metadata.is_system_doc())
                .filter(|r| self.inner.ttl.should_expire(&r.metadata, now))
                .map(|r| r.id.clone())
                .collect();

            let expired_count = expired.len();
            if !expired.is_empty() {
                if let Err(e) = store.delete(&expired).await {
                    // Leave the documents for the next cycle; never clear
                    // the collection as a fallback.
                    let msg = format!("failed to delete {expired_count} expired from {coll}: {e}");
                    error!("{msg}");
                    report.errors.push(msg);
                    continue;
                }
                self.inner
                    .graph
                    .cleanup_stale_references(Some(&expired))
                    .await;
            }

            info!(collection = %coll, expired = expired_count, total, "expiry cleanup pass");
            report.cleaned_collections.push(CollectionCleanup {
                collection: coll.to_string(),
                total_docs: total,
                expired_docs: expired_count,
            });
            report.total_expired += expired_count;
            report.total_checked += total;
        }

        report
    }

    /// Recompute aged importance scores for documents whose scores are
    /// stale, persisting the decayed values.
    pub async fn refresh_aging(
        &self,
        collection: Option<CollectionType>,
        sample_size: usize,
    ) -> AgingRefreshReport {
        self.refresh_aging_at(collection, sample_size, now_secs()).await
    }

    /// Aging pass against an explicit clock.
    pub async fn refresh_aging_at(
        &self,
        collection: Option<CollectionType>,
        sample_size: usize,
        now: f64,
    ) -> AgingRefreshReport {
        let mut report = AgingRefreshReport::default();
        let collections: Vec<CollectionType> = match collection {
            Some(c) => vec![c],
            None => CollectionType::all().to_vec(),
        };

        for coll in collections {
            let store = self.inner.tiers.get(coll);
            let records = match store.get_all().await {
                Ok(records) => records,
                Err(e) => {
                    let msg = format!("error scanning {coll}: {e}");
                    error!("{msg}");
                    report.errors.push(msg);
                    continue;
                }
            };

            let sample: Vec<_> = records
                .into_iter()
                .filter(|r| !r.metadata.is_system_doc())
                .take(sample_size)
                .collect();
            let total = sample.len();
            let mut refreshed = 0usize;

            for record in sample {
                if !self.inner.aging.needs_refresh(&record.metadata, now) {
                    continue;
                }
                let original = record.metadata.get_f64("importance_score").unwrap_or(0.5);
                let scored_at = record
                    .metadata
                    .get_f64("importance_scored_at")
                    .or_else(|| record.metadata.get_f64("timestamp"))
                    .unwrap_or(now);

                let aged = self.inner.aging.apply(original, scored_at, now);
                let mut metadata = record.metadata.clone();
                metadata.insert("importance_score", aged);
                metadata.insert("importance_scored_at", now);

                match store.update_metadata(&[record.id.clone()], vec![metadata]).await {
                    Ok(()) => refreshed += 1,
                    Err(e) => {
                        warn!(chunk_id = %record.id, error = %e, "failed to persist aged score")
                    }
                }
            }

            info!(collection = %coll, refreshed, total, "aging refresh pass");
            report.refreshed_collections.push(CollectionRefresh {
                collection: coll.to_string(),
                total_docs: total,
                refreshed_docs: refreshed,
            });
            report.total_refreshed += refreshed;
            report.total_checked += total;
        }

        report
    }

    // =====================================================================
    // Background worker
    // =====================================================================

    /// Start the background maintenance worker. Idempotent.
    pub async fn start_background_maintenance(&self) -> MemoryResult<bool> {
        if !self.inner.config.maintenance.enabled {
            info!("background maintenance disabled by configuration");
            return Ok(false);
        }

        let mut worker = self.inner.worker.lock().await;
        if worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            warn!("background maintenance already running");
            return Ok(false);
        }

        self.inner.shutdown.store(false, Ordering::SeqCst);
        let now = now_secs();
        {
            let mut due = self.inner.due.write().await;
            due.cleanup = now;
            due.statistics = now;
            due.aging = now;
            due.deep = now;
        }

        let controller = self.clone();
        *worker = Some(tokio::spawn(async move {
            controller.maintenance_loop().await;
        }));

        info!("background maintenance started");
        Ok(true)
    }

    /// Stop the worker, joining within a bounded timeout. Idempotent.
    pub async fn stop_background_maintenance(&self) -> MemoryResult<bool> {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();

        let mut worker = self.inner.worker.lock().await;
        let Some(handle) = worker.take() else {
            return Ok(false);
        };

        match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
            Ok(_) => info!("background maintenance stopped"),
            Err(_) => warn!("background maintenance did not stop within timeout"),
        }
        Ok(true)
    }

    /// Whether the worker task is currently alive.
    pub async fn maintenance_active(&self) -> bool {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    async fn maintenance_loop(&self) {
        let config = &self.inner.config.maintenance;

        loop {
            let sleep_ms = self.inner.sleep_interval_ms.load(Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)) => {}
                _ = self.inner.notify.notified() => {}
            }
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let now = now_secs();
            let (run_cleanup, run_statistics, run_aging, run_deep) = {
                let mut due = self.inner.due.write().await;
                let cleanup = now - due.cleanup >= config.cleanup_interval_secs as f64;
                let statistics = now - due.statistics >= config.statistics_interval_secs as f64;
                let aging = now - due.aging >= config.aging_interval_secs as f64;
                let deep = now - due.deep >= config.deep_interval_secs as f64;
                if cleanup {
                    due.cleanup = now;
                }
                if statistics {
                    due.statistics = now;
                }
                if aging {
                    due.aging = now;
                }
                if deep {
                    due.deep = now;
                }
                (cleanup, statistics, aging, deep)
            };

            if run_cleanup {
                let report = self.cleanup_expired(None).await;
                info!(
                    expired = report.total_expired,
                    checked = report.total_checked,
                    "scheduled cleanup complete"
                );
                self.inner.stats.write().await.cleanups_run += 1;
            }
            if run_statistics {
                let counts = self.collection_counts().await;
                info!(?counts, "scheduled statistics snapshot");
                self.inner.stats.write().await.statistics_run += 1;
            }
            if run_aging {
                let report = self.refresh_aging(None, 100).await;
                info!(refreshed = report.total_refreshed, "scheduled aging refresh complete");
                self.inner.stats.write().await.aging_refreshes_run += 1;
            }
            if run_deep {
                let cleanup = self.cleanup_expired(None).await;
                let aging = self.refresh_aging(None, 100).await;
                self.inner.graph.cleanup_stale_references(None).await;
                let counts = self.collection_counts().await;
                info!(
                    cleaned = cleanup.total_expired,
                    refreshed = aging.total_refreshed,
                    ?counts,
                    "deep maintenance complete"
                );
                self.inner.stats.write().await.deep_maintenance_run += 1;
            }
        }
    }

    // =====================================================================
    // Statistics
    // =====================================================================

    async fn collection_counts(&self) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for coll in CollectionType::all() {
            let count = self.inner.tiers.get(coll).count().await.unwrap_or(0);
            counts.insert(coll.to_string(), count);
        }
        counts
    }

    /// Lifecycle statistics and worker health.
    pub async fn lifecycle_stats(&self) -> LifecycleStats {
        let due = self.inner.due.read().await;
        LifecycleStats {
            aging_enabled: self.inner.aging.enabled(),
            decay_rate: self.inner.aging.decay_rate(),
            minimum_score: self.inner.aging.minimum_score(),
            maintenance_enabled: self.inner.config.maintenance.enabled,
            worker_active: self.maintenance_active().await,
            last_cleanup: due.cleanup,
            last_statistics: due.statistics,
            last_aging_refresh: due.aging,
            last_deep_maintenance: due.deep,
            counters: self.inner.stats.read().await.clone(),
            collection_counts: self.collection_counts().await,
        }
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("aging_enabled", &self.inner.aging.enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkRelationshipConfig, LifecycleConfig};
    use crate::store::VectorStore;
    use crate::types::ChunkRecord;

    const NOW: f64 = 1_700_000_000.0;

    fn controller() -> (LifecycleController, TierSet) {
        let tiers = TierSet::in_memory();
        let graph = Arc::new(RelationshipGraph::new(
            TierSet {
                short_term: Arc::clone(&tiers.short_term),
                long_term: Arc::clone(&tiers.long_term),
            },
            ChunkRelationshipConfig::default(),
        ));
        (
            LifecycleController::new(&LifecycleConfig::default(), tiers.clone(), graph),
            tiers,
        )
    }

    fn chunk_with_ttl(
        controller: &LifecycleController,
        id: &str,
        importance: f64,
        created: f64,
    ) -> ChunkRecord {
        let mut record = ChunkRecord::new(id, "content");
        record.embedding = Some(vec![1.0]);
        record.metadata.insert("chunk_id", id);
        record.metadata.insert("document_id", id.rsplit_once("_chunk_").map(|(d, _)| d).unwrap_or(id));
        record.metadata.insert("timestamp", created);
        let _ = controller.process_document_lifecycle(&mut record.metadata, importance, created);
        record
    }

    #[test]
    fn test_process_document_lifecycle_stamps_fields() {
        let (controller, _) = controller();
        let mut meta = Metadata::new();
        let importance = controller.process_document_lifecycle(&mut meta, 0.6, NOW);

        assert!((importance - 0.6).abs() < 1e-9);
        assert_eq!(meta.get_f64("importance_scored_at"), Some(NOW));
        assert_eq!(meta.get_str("ttl_tier"), Some("low_frequency"));
        assert_eq!(meta.get_bool("aging_enabled"), Some(true));
        assert!(meta.get_f64("ttl_expiry").unwrap() > NOW);
    }

    #[test]
    fn test_critical_permanence_override() {
        let (controller, _) = controller();
        let mut meta = Metadata::new();
        meta.insert("permanence_flag", "critical");

        let importance = controller.process_document_lifecycle(&mut meta, 0.85, NOW);
        assert!(importance >= 0.95);
        assert_eq!(meta.get_str("permanence_reason"), Some("user_request"));
        assert_eq!(meta.get_str("ttl_tier"), Some("permanent"));
        assert_eq!(meta.get_bool("permanent_flag"), Some(true));
    }

    #[test]
    fn test_critical_override_needs_high_base_score() {
        let (controller, _) = controller();
        let mut meta = Metadata::new();
        meta.insert("permanence_flag", "critical");

        let importance = controller.process_document_lifecycle(&mut meta, 0.4, NOW);
        assert!((importance - 0.4).abs() < 1e-9);
        assert_eq!(meta.get_str("ttl_tier"), Some("medium_frequency"));
    }

    #[tokio::test]
    async fn test_cleanup_expired_deletes_only_expired() {
        let (controller, tiers) = controller();

        // High-frequency doc created an hour ago has long expired; the
        // permanent doc from the same moment must survive.
        let stale = chunk_with_ttl(&controller, "a_chunk_0", 0.1, NOW);
        let keeper = chunk_with_ttl(&controller, "b_chunk_0", 0.99, NOW);
        tiers.short_term.add(vec![stale, keeper]).await.unwrap();

        let report = controller
            .cleanup_expired_at(Some(CollectionType::ShortTerm), NOW + 3600.0)
            .await;

        assert_eq!(report.total_expired, 1);
        assert_eq!(report.total_checked, 2);
        assert_eq!(tiers.short_term.count().await.unwrap(), 1);

        let survivors = tiers.short_term.get_all().await.unwrap();
        assert_eq!(survivors[0].metadata.get_str("chunk_id"), Some("b_chunk_0"));
    }

    #[tokio::test]
    async fn test_cleanup_skips_unexpired() {
        let (controller, tiers) = controller();
        let fresh = chunk_with_ttl(&controller, "a_chunk_0", 0.6, NOW);
        tiers.short_term.add(vec![fresh]).await.unwrap();

        let report = controller
            .cleanup_expired_at(Some(CollectionType::ShortTerm), NOW + 60.0)
            .await;
        assert_eq!(report.total_expired, 0);
        assert_eq!(tiers.short_term.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_aging_persists_decayed_score() {
        let (controller, tiers) = controller();

        let mut record = ChunkRecord::new("a_chunk_0", "content");
        record.embedding = Some(vec![1.0]);
        record.metadata.insert("chunk_id", "a_chunk_0");
        record.metadata.insert("importance_score", 0.6);
        record.metadata.insert("importance_scored_at", NOW - 10.0 * 86_400.0);
        record.metadata.insert("timestamp", NOW - 10.0 * 86_400.0);
        tiers.short_term.add(vec![record]).await.unwrap();

        let report = controller
            .refresh_aging_at(Some(CollectionType::ShortTerm), 100, NOW)
            .await;
        assert_eq!(report.total_refreshed, 1);

        let rows = tiers.short_term.get_all().await.unwrap();
        let new_score = rows[0].metadata.get_f64("importance_score").unwrap();
        let expected = 0.6 * (-1.0f64).exp();
        assert!((new_score - expected).abs() < 1e-9, "got {new_score}");
        assert_eq!(rows[0].metadata.get_f64("importance_scored_at"), Some(NOW));
    }

    #[tokio::test]
    async fn test_refresh_aging_skips_fresh_scores() {
        let (controller, tiers) = controller();
        let mut record = ChunkRecord::new("a_chunk_0", "content");
        record.metadata.insert("chunk_id", "a_chunk_0");
        record.metadata.insert("importance_score", 0.6);
        record.metadata.insert("importance_scored_at", NOW - 3600.0);
        tiers.short_term.add(vec![record]).await.unwrap();

        let report = controller
            .refresh_aging_at(Some(CollectionType::ShortTerm), 100, NOW)
            .await;
        assert_eq!(report.total_refreshed, 0);
    }

    #[tokio::test]
    async fn test_worker_start_stop_idempotent() {
        let (controller, _) = controller();
        controller.set_sleep_interval_ms(10);

        assert!(controller.start_background_maintenance().await.unwrap());
        assert!(controller.maintenance_active().await);
        // Second start is a no-op.
        assert!(!controller.start_background_maintenance().await.unwrap());

        assert!(controller.stop_background_maintenance().await.unwrap());
        assert!(!controller.maintenance_active().await);
        // Second stop is a no-op.
        assert!(!controller.stop_background_maintenance().await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_restart_after_stop() {
        let (controller, _) = controller();
        controller.set_sleep_interval_ms(10);

        controller.start_background_maintenance().await.unwrap();
        controller.stop_background_maintenance().await.unwrap();
        assert!(controller.start_background_maintenance().await.unwrap());
        controller.stop_background_maintenance().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_stats_shape() {
        let (controller, _) = controller();
        let stats = controller.lifecycle_stats().await;
        assert!(stats.aging_enabled);
        assert!((stats.decay_rate - 0.1).abs() < 1e-9);
        assert!(!stats.worker_active);
        assert_eq!(stats.collection_counts.get("short_term"), Some(&0));
        assert_eq!(stats.collection_counts.get("long_term"), Some(&0));
    }
}
