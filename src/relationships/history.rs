//! Durable, bounded log of deduplication merge events.
//!
//! Backed by the system document in the short-term collection. The log is
//! loaded lazily on first access, saved after every mutation, and pruned
//! to the newest [`MAX_MERGE_HISTORY_SIZE`] events by timestamp.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MemoryResult;
use crate::relationships::persistence::{get_system_document, save_system_document};
use crate::store::VectorStore;
use crate::types::{now_secs, MAX_MERGE_HISTORY_SIZE, SYSTEM_DOC_TYPE_MERGE_HISTORY};

/// One recorded merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub merge_id: String,
    pub timestamp: f64,
    pub primary_document: String,
    pub merged_documents: Vec<String>,
    /// merged document id -> similarity to the primary
    pub similarity_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub preserved_relationships: Vec<String>,
    #[serde(default)]
    pub consolidated_metadata: serde_json::Map<String, serde_json::Value>,
}

/// System-document-backed merge-event log.
pub struct MergeHistoryStore {
    short_term: Arc<dyn VectorStore>,
    history: Mutex<HashMap<String, MergeEvent>>,
    loaded: AtomicBool,
}

impl MergeHistoryStore {
    pub fn new(short_term: Arc<dyn VectorStore>) -> Self {
        MergeHistoryStore {
            short_term,
            history: Mutex::new(HashMap::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Load the log from the system document. Idempotent; safe to call on
    /// every access path.
    pub async fn ensure_loaded(&self) -> MemoryResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }

        let loaded = match get_system_document(self.short_term.as_ref(), SYSTEM_DOC_TYPE_MERGE_HISTORY)
            .await
        {
            Ok(Some(doc)) => match serde_json::from_str::<HashMap<String, MergeEvent>>(&doc.content) {
                Ok(map) => {
                    info!(records = map.len(), "loaded merge history from storage");
                    map
                }
                Err(e) => {
                    warn!(error = %e, "merge history payload unreadable, starting empty");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "failed to load merge history, starting empty");
                HashMap::new()
            }
        };

        let mut guard = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_empty() {
            *guard = loaded;
        }
        drop(guard);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Build and append a merge event, then persist. Returns the event.
    pub async fn record_merge(
        &self,
        primary_document: &str,
        merged_documents: &[String],
        similarity_scores: &[f64],
    ) -> MemoryResult<MergeEvent> {
        self.ensure_loaded().await?;

        let now = now_secs();
        let merge_id = format!(
            "merge_{}_{}",
            (now * 1000.0) as i64,
            rand::thread_rng().gen_range(1000..10000)
        );

        let event = MergeEvent {
            merge_id: merge_id.clone(),
            timestamp: now,
            primary_document: primary_document.to_string(),
            merged_documents: merged_documents.to_vec(),
            similarity_scores: merged_documents
                .iter()
                .cloned()
                .zip(similarity_scores.iter().copied())
                .collect(),
            preserved_relationships: Vec::new(),
            consolidated_metadata: serde_json::Map::new(),
        };

        self.append(event.clone()).await?;
        Ok(event)
    }

    /// Append an event (with preserved relationships already filled in)
    /// and persist, pruning if over the cap.
    pub async fn append(&self, event: MergeEvent) -> MemoryResult<()> {
        self.ensure_loaded().await?;

        let snapshot = {
            let mut guard = self.history.lock().unwrap_or_else(|p| p.into_inner());
            guard.insert(event.merge_id.clone(), event);

            if guard.len() > MAX_MERGE_HISTORY_SIZE {
                let mut by_age: Vec<(String, f64)> = guard
                    .iter()
                    .map(|(k, v)| (k.clone(), v.timestamp))
                    .collect();
                by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                let excess = guard.len() - MAX_MERGE_HISTORY_SIZE;
                for (key, _) in by_age.into_iter().take(excess) {
                    guard.remove(&key);
                }
                info!(cap = MAX_MERGE_HISTORY_SIZE, "pruned merge history to cap");
            }

            guard.clone()
        };

        self.save(&snapshot).await
    }

    async fn save(&self, snapshot: &HashMap<String, MergeEvent>) -> MemoryResult<()> {
        let payload = serde_json::to_string(snapshot)?;
        save_system_document(
            self.short_term.as_ref(),
            SYSTEM_DOC_TYPE_MERGE_HISTORY,
            payload,
        )
        .await
    }

    /// A point-in-time copy of the log. Stale reads are acceptable.
    pub fn snapshot(&self) -> HashMap<String, MergeEvent> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MergeHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeHistoryStore")
            .field("records", &self.len())
            .field("loaded", &self.loaded.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVectorStore;

    fn store() -> Arc<dyn VectorStore> {
        Arc::new(InMemoryVectorStore::new())
    }

    #[tokio::test]
    async fn test_record_and_snapshot() {
        let history = MergeHistoryStore::new(store());
        let event = history
            .record_merge("doc_a", &["doc_b".to_string()], &[0.97])
            .await
            .unwrap();

        assert_eq!(event.primary_document, "doc_a");
        assert_eq!(event.similarity_scores.get("doc_b"), Some(&0.97));
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_survives_reload_from_system_document() {
        let backing = store();

        let first = MergeHistoryStore::new(Arc::clone(&backing));
        first
            .record_merge("doc_a", &["doc_b".to_string()], &[0.96])
            .await
            .unwrap();

        // A fresh store instance over the same backing collection sees the
        // same log.
        let second = MergeHistoryStore::new(backing);
        second.ensure_loaded().await.unwrap();
        assert_eq!(second.len(), 1);
        let snapshot = second.snapshot();
        let event = snapshot.values().next().unwrap();
        assert_eq!(event.primary_document, "doc_a");
    }

    #[tokio::test]
    async fn test_prunes_oldest_beyond_cap() {
        let history = MergeHistoryStore::new(store());
        history.ensure_loaded().await.unwrap();

        for i in 0..(MAX_MERGE_HISTORY_SIZE + 5) {
            let event = MergeEvent {
                merge_id: format!("merge_{i}"),
                timestamp: i as f64,
                primary_document: "p".to_string(),
                merged_documents: vec!["q".to_string()],
                similarity_scores: BTreeMap::new(),
                preserved_relationships: Vec::new(),
                consolidated_metadata: serde_json::Map::new(),
            };
            history.append(event).await.unwrap();
        }

        assert_eq!(history.len(), MAX_MERGE_HISTORY_SIZE);
        let snapshot = history.snapshot();
        // The oldest five were pruned.
        for i in 0..5 {
            assert!(!snapshot.contains_key(&format!("merge_{i}")));
        }
        assert!(snapshot.contains_key(&format!("merge_{}", MAX_MERGE_HISTORY_SIZE + 4)));
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let history = MergeHistoryStore::new(store());
        history.ensure_loaded().await.unwrap();
        history
            .record_merge("doc_a", &["doc_b".to_string()], &[0.95])
            .await
            .unwrap();
        history.ensure_loaded().await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
