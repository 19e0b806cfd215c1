//! Document CRUD: deletion, importance edits with TTL recompute, metadata
//! merges, and content replacement (delete + re-add).

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::lifecycle::LifecycleController;
use crate::relationships::RelationshipGraph;
use crate::scoring::ScoreContext;
use crate::services::storage::{MemoryType, StorageService};
use crate::store::{MetadataFilter, TierSet, VectorStore};
use crate::types::{now_secs, CollectionType, Metadata};

/// Result of a document deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub success: bool,
    pub document_id: String,
    pub chunks_deleted: usize,
    pub collection: String,
    pub message: String,
}

/// Result of an importance update.
#[derive(Debug, Clone, Serialize)]
pub struct ImportanceUpdateReport {
    pub success: bool,
    pub document_id: String,
    pub old_importance: Option<f64>,
    pub new_importance: f64,
    pub old_ttl_tier: Option<String>,
    pub new_ttl_tier: Option<String>,
    pub chunks_updated: usize,
    pub collection: String,
    pub message: String,
}

/// Result of a single-chunk metadata merge.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataUpdateReport {
    pub success: bool,
    pub chunk_id: String,
    pub fields_updated: Vec<String>,
    pub collection: String,
}

/// Result of a content replacement.
#[derive(Debug, Clone, Serialize)]
pub struct ContentUpdateReport {
    pub success: bool,
    pub document_id: String,
    pub new_document_id: Option<String>,
    pub old_chunks: usize,
    pub new_chunks: usize,
    pub collection: String,
    pub importance_preserved: bool,
    pub message: String,
}

/// The update service.
pub struct UpdateService {
    tiers: TierSet,
    graph: Arc<RelationshipGraph>,
    lifecycle: Option<LifecycleController>,
    storage: Arc<StorageService>,
}

impl UpdateService {
    pub fn new(
        tiers: TierSet,
        graph: Arc<RelationshipGraph>,
        lifecycle: Option<LifecycleController>,
        storage: Arc<StorageService>,
    ) -> Self {
        UpdateService {
            tiers,
            graph,
            lifecycle,
            storage,
        }
    }

    /// Delete a document and all its chunks from whichever tier holds it.
    /// A second call for the same id returns `NotFound` with no state
    /// change.
    pub async fn delete_document(&self, document_id: &str) -> MemoryResult<DeleteReport> {
        if document_id.is_empty() {
            return Err(MemoryError::Validation {
                reason: "document_id must be non-empty".to_string(),
            });
        }

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let rows = store
                .get(&MetadataFilter::DocumentId(document_id.to_string()))
                .await?;
            if rows.is_empty() {
                continue;
            }

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            store.delete(&ids).await?;
            self.graph.evict(document_id, &ids);

            info!(
                document_id,
                chunks = ids.len(),
                collection = %collection,
                "deleted document"
            );
            return Ok(DeleteReport {
                success: true,
                document_id: document_id.to_string(),
                chunks_deleted: ids.len(),
                collection: collection.to_string(),
                message: format!("Deleted {} chunks from {collection}", ids.len()),
            });
        }

        Err(MemoryError::NotFound {
            document_id: document_id.to_string(),
        })
    }

    /// Update a document's importance and recompute its TTL.
    pub async fn update_document_importance(
        &self,
        document_id: &str,
        new_importance: f64,
        reason: Option<&str>,
    ) -> MemoryResult<ImportanceUpdateReport> {
        if !(0.0..=1.0).contains(&new_importance) {
            return Err(MemoryError::Validation {
                reason: "importance score must be between 0.0 and 1.0".to_string(),
            });
        }

        let now = now_secs();
        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let rows = store
                .get(&MetadataFilter::DocumentId(document_id.to_string()))
                .await?;
            if rows.is_empty() {
                continue;
            }

            let old_importance = rows[0].metadata.get_f64("importance_score");
            let old_ttl_tier = rows[0].metadata.get_str("ttl_tier").map(String::from);

            let mut ids = Vec::with_capacity(rows.len());
            let mut metadatas = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut metadata = row.metadata.clone();
                metadata.insert("importance_score", new_importance);
                if let Some(reason) = reason {
                    metadata.insert("importance_change_reason", reason);
                }
                metadata.insert("importance_changed_at", now);

                if let Some(lifecycle) = &self.lifecycle {
                    lifecycle
                        .ttl_manager()
                        .add_ttl_metadata(&mut metadata, new_importance, now);
                }

                ids.push(row.id.clone());
                metadatas.push(metadata);
            }

            let new_ttl_tier = metadatas[0].get_str("ttl_tier").map(String::from);
            store.update_metadata(&ids, metadatas).await?;

            let message = format!(
                "Updated {} chunks: importance {} -> {new_importance:.2}, TTL tier {} -> {}",
                ids.len(),
                old_importance
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "unset".to_string()),
                old_ttl_tier.as_deref().unwrap_or("unset"),
                new_ttl_tier.as_deref().unwrap_or("unset"),
            );
            info!(document_id, "{message}");

            return Ok(ImportanceUpdateReport {
                success: true,
                document_id: document_id.to_string(),
                old_importance,
                new_importance,
                old_ttl_tier,
                new_ttl_tier,
                chunks_updated: ids.len(),
                collection: collection.to_string(),
                message,
            });
        }

        Err(MemoryError::NotFound {
            document_id: document_id.to_string(),
        })
    }

    /// Merge metadata updates into the single chunk matching `chunk_id`.
    pub async fn update_document_metadata(
        &self,
        chunk_id: &str,
        updates: &Metadata,
    ) -> MemoryResult<MetadataUpdateReport> {
        if chunk_id.is_empty() {
            return Err(MemoryError::Validation {
                reason: "chunk_id must be non-empty".to_string(),
            });
        }
        if updates.0.is_empty() {
            return Err(MemoryError::Validation {
                reason: "metadata updates must be non-empty".to_string(),
            });
        }

        for collection in CollectionType::all() {
            let store = self.tiers.get(collection);
            let rows = store
                .get(&MetadataFilter::ChunkId(chunk_id.to_string()))
                .await?;
            let Some(row) = rows.into_iter().next() else {
                continue;
            };

            let mut metadata = row.metadata.clone();
            metadata.merge(updates);
            metadata.insert("metadata_updated_at", now_secs());
            store.update_metadata(&[row.id.clone()], vec![metadata]).await?;

            return Ok(MetadataUpdateReport {
                success: true,
                chunk_id: chunk_id.to_string(),
                fields_updated: updates.0.keys().cloned().collect(),
                collection: collection.to_string(),
            });
        }

        Err(MemoryError::NotFound {
            document_id: chunk_id.to_string(),
        })
    }

    /// Replace a document's content by deleting and re-adding it,
    /// optionally preserving the original importance through the add
    /// context.
    pub async fn update_document_content(
        &self,
        document_id: &str,
        new_content: &str,
        new_metadata: Option<&serde_json::Map<String, serde_json::Value>>,
        preserve_importance: bool,
    ) -> MemoryResult<ContentUpdateReport> {
        if new_content.trim().is_empty() {
            return Err(MemoryError::Validation {
                reason: "new content must be non-empty".to_string(),
            });
        }

        // Locate the existing document first so a missing id fails before
        // any mutation.
        let mut existing_metadata: Option<Metadata> = None;
        let mut source_collection = CollectionType::ShortTerm;
        for collection in CollectionType::all() {
            let rows = self
                .tiers
                .get(collection)
                .get(&MetadataFilter::DocumentId(document_id.to_string()))
                .await?;
            if let Some(row) = rows.into_iter().next() {
                existing_metadata = Some(row.metadata.clone());
                source_collection = collection;
                break;
            }
        }
        let Some(existing_metadata) = existing_metadata else {
            return Err(MemoryError::NotFound {
                document_id: document_id.to_string(),
            });
        };

        let delete_report = self.delete_document(document_id).await?;

        // Merge the old metadata with caller updates and restamp.
        let mut final_metadata = existing_metadata
            .to_json()
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(updates) = new_metadata {
            for (k, v) in updates {
                final_metadata.insert(k.clone(), v.clone());
            }
        }
        final_metadata.insert("updated_at".to_string(), serde_json::json!(now_secs()));
        let update_count = existing_metadata.get_i64("update_count").unwrap_or(0) + 1;
        final_metadata.insert("update_count".to_string(), serde_json::json!(update_count));

        let mut context = ScoreContext::new();
        let mut importance_preserved = false;
        if preserve_importance {
            if let Some(old) = existing_metadata.get_f64("importance_score") {
                context.insert("preserved_importance".to_string(), serde_json::json!(old));
                importance_preserved = true;
            }
        }

        let add_report = self
            .storage
            .add_memory(
                new_content,
                Some(&final_metadata),
                Some(&context),
                MemoryType::Auto,
                existing_metadata.get_str("language"),
            )
            .await?;

        if !add_report.success {
            warn!(
                document_id,
                error = add_report.error.as_deref().unwrap_or("unknown"),
                "re-add failed during content update"
            );
            return Ok(ContentUpdateReport {
                success: false,
                document_id: document_id.to_string(),
                new_document_id: None,
                old_chunks: delete_report.chunks_deleted,
                new_chunks: 0,
                collection: source_collection.to_string(),
                importance_preserved,
                message: format!(
                    "Failed to add updated document: {}",
                    add_report.message
                ),
            });
        }

        info!(
            document_id,
            new_document_id = add_report.document_id.as_deref().unwrap_or(""),
            old_chunks = delete_report.chunks_deleted,
            new_chunks = add_report.chunks_added,
            "updated document content"
        );

        Ok(ContentUpdateReport {
            success: true,
            document_id: document_id.to_string(),
            new_document_id: add_report.document_id.clone(),
            old_chunks: delete_report.chunks_deleted,
            new_chunks: add_report.chunks_added,
            collection: add_report.collection,
            importance_preserved,
            message: format!(
                "Document updated: {} old chunks removed, {} new chunks added",
                delete_report.chunks_deleted, add_report.chunks_added
            ),
        })
    }
}

impl std::fmt::Debug for UpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateService").finish_non_exhaustive()
    }
}
