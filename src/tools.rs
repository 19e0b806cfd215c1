//! Tool surface over the memory engine.
//!
//! Each tool takes a typed parameter struct (deserialized from JSON-RPC
//! params by the transport) and returns a structured envelope with
//! `success`, a human message, and tool-specific data. Engine errors are
//! mapped to stable codes in the -32000..-32009 range; the engine itself
//! never exits.

use serde::Deserialize;
use serde_json::json;

use crate::error::MemoryError;
use crate::monitor::TimeWindow;
use crate::services::{MemoryEngine, MemoryType};
use crate::types::CollectionType;

/// Generic tool execution failure.
pub const CODE_TOOL_EXECUTION: i32 = -32000;
/// Vector-store failure.
pub const CODE_STORAGE: i32 = -32001;
/// Disk or permission failure.
pub const CODE_FILESYSTEM: i32 = -32002;
/// Deduplication failure.
pub const CODE_DEDUP: i32 = -32003;
/// Lifecycle/TTL failure.
pub const CODE_LIFECYCLE: i32 = -32004;
/// Parameter validation failure.
pub const CODE_VALIDATION: i32 = -32005;
/// Document or chunk not found.
pub const CODE_NOT_FOUND: i32 = -32006;
/// Relationship cache/persist failure.
pub const CODE_RELATIONSHIP: i32 = -32007;
/// Cleanup/delete failure.
pub const CODE_CLEANUP: i32 = -32008;
/// Metadata serialization failure.
pub const CODE_SERIALIZATION: i32 = -32009;

/// Structured response envelope shared by every tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolEnvelope {
    pub success: bool,
    pub message: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

impl ToolEnvelope {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        ToolEnvelope {
            success: true,
            message: message.into(),
            data,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>, code: i32) -> Self {
        ToolEnvelope {
            success: false,
            message: message.into(),
            data: serde_json::Value::Null,
            error_code: Some(code),
        }
    }

    pub fn from_error(error: &MemoryError) -> Self {
        ToolEnvelope::error(error.to_string(), error_code(error))
    }
}

/// Map an engine error kind onto its JSON-RPC code.
pub fn error_code(error: &MemoryError) -> i32 {
    match error {
        MemoryError::Validation { .. } => CODE_VALIDATION,
        MemoryError::NotFound { .. } => CODE_NOT_FOUND,
        MemoryError::Storage(_) => CODE_STORAGE,
        MemoryError::Filesystem(_) => CODE_FILESYSTEM,
        MemoryError::Dedup(_) => CODE_DEDUP,
        MemoryError::Cleanup(_) => CODE_CLEANUP,
        MemoryError::Relationship(_) => CODE_RELATIONSHIP,
        MemoryError::Lifecycle(_) => CODE_LIFECYCLE,
        MemoryError::Serialization(_) => CODE_SERIALIZATION,
    }
}

fn parse_collections(names: &[String]) -> Result<Vec<CollectionType>, ToolEnvelope> {
    names
        .iter()
        .map(|name| {
            CollectionType::parse(name).ok_or_else(|| {
                ToolEnvelope::error(format!("unknown collection '{name}'"), CODE_VALIDATION)
            })
        })
        .collect()
}

fn default_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_memory_type() -> String {
    "auto".to_string()
}

// =========================================================================
// Document tools
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AddDocumentParams {
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_memory_type")]
    pub memory_type: String,
}

/// Store a document in the appropriate memory tier.
pub async fn add_document(engine: &MemoryEngine, params: AddDocumentParams) -> ToolEnvelope {
    let Some(memory_type) = MemoryType::parse(&params.memory_type) else {
        return ToolEnvelope::error(
            format!(
                "memory_type must be one of auto, short_term, long_term (got '{}')",
                params.memory_type
            ),
            CODE_VALIDATION,
        );
    };

    match engine
        .add_memory(
            &params.content,
            params.metadata.as_ref(),
            params.context.as_ref(),
            memory_type,
            params.language.as_deref(),
        )
        .await
    {
        Ok(report) => {
            let data = json!({
                "status": if report.success { "stored" } else { "failed" },
                "document_id": report.document_id,
                "assigned_tier": report.collection,
                "importance_score": report.importance_score,
                "action": report.action,
                "chunks_added": report.chunks_added,
                "similarity_score": report.similarity_score,
            });
            if report.success {
                ToolEnvelope::ok(report.message, data)
            } else {
                ToolEnvelope {
                    success: false,
                    message: report.message,
                    data,
                    error_code: Some(match report.error_type.as_deref() {
                        Some("filesystem") => CODE_FILESYSTEM,
                        Some("storage") => CODE_STORAGE,
                        _ => CODE_TOOL_EXECUTION,
                    }),
                }
            }
        }
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryDocumentsParams {
    pub query: String,
    #[serde(default)]
    pub collections: Option<Vec<String>>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_true")]
    pub use_reranker: bool,
    #[serde(default = "default_true")]
    pub use_smart_routing: bool,
}

/// Search memory with dedup-aware smart routing.
pub async fn query_documents(engine: &MemoryEngine, params: QueryDocumentsParams) -> ToolEnvelope {
    let collections = match &params.collections {
        Some(names) => match parse_collections(names) {
            Ok(parsed) => Some(parsed),
            Err(envelope) => return envelope,
        },
        None => None,
    };

    match engine
        .query_memories(
            &params.query,
            collections.as_deref(),
            params.k,
            params.use_smart_routing,
            params.use_reranker,
        )
        .await
    {
        Ok(response) => ToolEnvelope::ok(
            format!("Found {} results", response.content.len()),
            serde_json::to_value(&response).unwrap_or_default(),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryPermanentParams {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

/// Search only permanent content.
pub async fn query_permanent_documents(
    engine: &MemoryEngine,
    params: QueryPermanentParams,
) -> ToolEnvelope {
    match engine.query_permanent(&params.query, params.k).await {
        Ok(response) => ToolEnvelope::ok(
            format!("Found {} permanent documents", response.content.len()),
            serde_json::to_value(&response).unwrap_or_default(),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteDocumentParams {
    pub document_id: String,
    #[serde(default)]
    pub confirm: bool,
}

/// Delete a document. Requires explicit confirmation.
pub async fn delete_document(engine: &MemoryEngine, params: DeleteDocumentParams) -> ToolEnvelope {
    if !params.confirm {
        return ToolEnvelope::error(
            "deletion requires confirm=true".to_string(),
            CODE_VALIDATION,
        );
    }

    match engine.delete_document(&params.document_id).await {
        Ok(report) => ToolEnvelope::ok(
            report.message.clone(),
            serde_json::to_value(&report).unwrap_or_default(),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoteImportanceParams {
    pub document_id: String,
    pub new_importance: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lower a document's importance. Values in the permanent band are
/// rejected; demotion cannot promote.
pub async fn demote_importance(
    engine: &MemoryEngine,
    params: DemoteImportanceParams,
) -> ToolEnvelope {
    if !(0.0..=0.94).contains(&params.new_importance) {
        return ToolEnvelope::error(
            "demoted importance must be between 0.0 and 0.94".to_string(),
            CODE_VALIDATION,
        );
    }

    match engine
        .update_document_importance(
            &params.document_id,
            params.new_importance,
            params.reason.as_deref(),
        )
        .await
    {
        Ok(report) => ToolEnvelope::ok(
            report.message.clone(),
            serde_json::to_value(&report).unwrap_or_default(),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateDocumentParams {
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub preserve_importance: bool,
}

/// Replace a document's content.
pub async fn update_document(engine: &MemoryEngine, params: UpdateDocumentParams) -> ToolEnvelope {
    if params.content.len() < 10 {
        return ToolEnvelope::error(
            "content must be at least 10 characters".to_string(),
            CODE_VALIDATION,
        );
    }

    match engine
        .update_document_content(
            &params.document_id,
            &params.content,
            params.metadata.as_ref(),
            params.preserve_importance,
        )
        .await
    {
        Ok(report) => ToolEnvelope::ok(
            report.message.clone(),
            serde_json::to_value(&report).unwrap_or_default(),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

// =========================================================================
// Statistics tools
// =========================================================================

/// Collection counts and health.
pub async fn get_memory_stats(engine: &MemoryEngine) -> ToolEnvelope {
    let stats = engine.memory_stats().await;
    ToolEnvelope::ok(
        "Memory statistics",
        serde_json::to_value(&stats).unwrap_or_default(),
    )
}

/// Lifecycle statistics and worker health.
pub async fn get_lifecycle_stats(engine: &MemoryEngine) -> ToolEnvelope {
    let stats = engine.lifecycle_stats().await;
    ToolEnvelope::ok(
        "Lifecycle statistics",
        serde_json::to_value(&stats).unwrap_or_default(),
    )
}

/// Permanent-content statistics.
pub async fn get_permanence_stats(engine: &MemoryEngine) -> ToolEnvelope {
    let stats = engine.permanence_stats().await;
    ToolEnvelope::ok(
        format!(
            "Permanence statistics: {} permanent documents",
            stats.total_permanent_documents
        ),
        serde_json::to_value(&stats).unwrap_or_default(),
    )
}

/// Deduplication statistics.
pub async fn get_deduplication_stats(engine: &MemoryEngine) -> ToolEnvelope {
    ToolEnvelope::ok("Deduplication statistics", engine.deduplication_stats())
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryPerformanceParams {
    #[serde(default)]
    pub time_window: Option<String>,
}

/// Query performance over a time window.
pub async fn get_query_performance(
    engine: &MemoryEngine,
    params: QueryPerformanceParams,
) -> ToolEnvelope {
    let window = TimeWindow::parse(params.time_window.as_deref().unwrap_or("all"));
    ToolEnvelope::ok(
        "Query performance",
        serde_json::to_value(engine.query_performance(window)).unwrap_or_default(),
    )
}

// =========================================================================
// Deduplication tools
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewDuplicatesParams {
    pub collection: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Preview duplicate pairs without changing anything.
pub async fn preview_duplicates(
    engine: &MemoryEngine,
    params: PreviewDuplicatesParams,
) -> ToolEnvelope {
    let Some(collection) = CollectionType::parse(&params.collection) else {
        return ToolEnvelope::error(
            format!("unknown collection '{}'", params.collection),
            CODE_VALIDATION,
        );
    };

    match engine.preview_duplicates(collection).await {
        Ok(mut report) => {
            if let Some(limit) = params.limit {
                report.duplicate_pairs.truncate(limit);
            }
            ToolEnvelope::ok(
                report.message.clone(),
                serde_json::to_value(&report).unwrap_or_default(),
            )
        }
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeduplicateMemoriesParams {
    #[serde(default)]
    pub collections: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

/// Run a batch dedup pass over the target collections.
pub async fn deduplicate_memories(
    engine: &MemoryEngine,
    params: DeduplicateMemoriesParams,
) -> ToolEnvelope {
    let collections = match &params.collections {
        Some(names) => match parse_collections(names) {
            Ok(parsed) => parsed,
            Err(envelope) => return envelope,
        },
        None => CollectionType::all().to_vec(),
    };

    let mut reports = Vec::new();
    for collection in collections {
        match engine.deduplicate_collection(collection, params.dry_run).await {
            Ok(report) => reports.push(serde_json::to_value(&report).unwrap_or_default()),
            Err(e) => return ToolEnvelope::from_error(&e),
        }
    }

    ToolEnvelope::ok(
        format!("Deduplication pass over {} collections", reports.len()),
        json!({ "reports": reports, "dry_run": params.dry_run }),
    )
}

// =========================================================================
// Relationship and lifecycle tools
// =========================================================================

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChunkRelationshipsParams {
    #[serde(default)]
    pub document_id: Option<String>,
}

/// Relationship context for one document, or graph-wide statistics.
pub async fn get_chunk_relationships(
    engine: &MemoryEngine,
    params: ChunkRelationshipsParams,
) -> ToolEnvelope {
    match &params.document_id {
        Some(document_id) => match engine.document_context(document_id).await {
            Some(context) => ToolEnvelope::ok("Document relationship context", context),
            None => ToolEnvelope::error(
                format!("Document '{document_id}' not found"),
                CODE_NOT_FOUND,
            ),
        },
        None => {
            let stats = engine.relationship_stats().await;
            ToolEnvelope::ok(
                "Relationship statistics",
                serde_json::to_value(&stats).unwrap_or_default(),
            )
        }
    }
}

/// Start the background maintenance worker.
pub async fn start_background_maintenance(engine: &MemoryEngine) -> ToolEnvelope {
    match engine.start_background_maintenance().await {
        Ok(true) => ToolEnvelope::ok("Background maintenance started", json!({"started": true})),
        Ok(false) => ToolEnvelope::ok(
            "Background maintenance already running or disabled",
            json!({"started": false}),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

/// Stop the background maintenance worker.
pub async fn stop_background_maintenance(engine: &MemoryEngine) -> ToolEnvelope {
    match engine.stop_background_maintenance().await {
        Ok(stopped) => ToolEnvelope::ok(
            if stopped {
                "Background maintenance stopped"
            } else {
                "Background maintenance was not running"
            },
            json!({"stopped": stopped}),
        ),
        Err(e) => ToolEnvelope::from_error(&e),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CleanupExpiredParams {
    #[serde(default)]
    pub collection: Option<String>,
}

/// Delete expired chunks now.
pub async fn cleanup_expired_memories(
    engine: &MemoryEngine,
    params: CleanupExpiredParams,
) -> ToolEnvelope {
    let collection = match &params.collection {
        Some(name) => match CollectionType::parse(name) {
            Some(parsed) => Some(parsed),
            None => {
                return ToolEnvelope::error(
                    format!("unknown collection '{name}'"),
                    CODE_VALIDATION,
                )
            }
        },
        None => None,
    };

    let report = engine.cleanup_expired(collection).await;
    ToolEnvelope::ok(
        format!(
            "Cleaned {} expired of {} checked",
            report.total_expired, report.total_checked
        ),
        serde_json::to_value(&report).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngramConfig;

    fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(&EngramConfig::default())
    }

    #[tokio::test]
    async fn test_add_document_envelope() {
        let engine = engine();
        let envelope = add_document(
            &engine,
            AddDocumentParams {
                content: "a note to remember about error handling".to_string(),
                metadata: None,
                context: None,
                language: None,
                memory_type: "auto".to_string(),
            },
        )
        .await;

        assert!(envelope.success);
        assert_eq!(envelope.data["action"], "added");
        assert_eq!(envelope.data["assigned_tier"], "short_term");
        assert!(envelope.data["document_id"].is_string());
    }

    #[tokio::test]
    async fn test_add_document_rejects_bad_memory_type() {
        let engine = engine();
        let envelope = add_document(
            &engine,
            AddDocumentParams {
                content: "content".to_string(),
                metadata: None,
                context: None,
                language: None,
                memory_type: "forever".to_string(),
            },
        )
        .await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some(CODE_VALIDATION));
    }

    #[tokio::test]
    async fn test_delete_requires_confirm() {
        let engine = engine();
        let envelope = delete_document(
            &engine,
            DeleteDocumentParams {
                document_id: "whatever".to_string(),
                confirm: false,
            },
        )
        .await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some(CODE_VALIDATION));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let engine = engine();
        let envelope = delete_document(
            &engine,
            DeleteDocumentParams {
                document_id: "missing_doc".to_string(),
                confirm: true,
            },
        )
        .await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some(CODE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_demote_rejects_permanent_band() {
        let engine = engine();
        let envelope = demote_importance(
            &engine,
            DemoteImportanceParams {
                document_id: "doc".to_string(),
                new_importance: 0.97,
                reason: None,
            },
        )
        .await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some(CODE_VALIDATION));
    }

    #[tokio::test]
    async fn test_update_document_requires_min_content() {
        let engine = engine();
        let envelope = update_document(
            &engine,
            UpdateDocumentParams {
                document_id: "doc".to_string(),
                content: "short".to_string(),
                metadata: None,
                preserve_importance: true,
            },
        )
        .await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some(CODE_VALIDATION));
    }

    #[tokio::test]
    async fn test_stats_tools_succeed_on_empty_engine() {
        let engine = engine();
        assert!(get_memory_stats(&engine).await.success);
        assert!(get_lifecycle_stats(&engine).await.success);
        assert!(get_permanence_stats(&engine).await.success);
        assert!(get_deduplication_stats(&engine).await.success);
        assert!(
            get_query_performance(&engine, QueryPerformanceParams { time_window: None })
                .await
                .success
        );
        assert!(
            get_chunk_relationships(&engine, ChunkRelationshipsParams::default())
                .await
                .success
        );
    }

    #[tokio::test]
    async fn test_error_code_mapping() {
        assert_eq!(
            error_code(&MemoryError::Validation {
                reason: "x".to_string()
            }),
            CODE_VALIDATION
        );
        assert_eq!(
            error_code(&MemoryError::NotFound {
                document_id: "x".to_string()
            }),
            CODE_NOT_FOUND
        );
        assert_eq!(error_code(&MemoryError::Storage("x".to_string())), CODE_STORAGE);
        assert_eq!(
            error_code(&MemoryError::Filesystem("x".to_string())),
            CODE_FILESYSTEM
        );
    }
}
