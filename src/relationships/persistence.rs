//! Persistence contract for relationship data.
//!
//! Each chunk carries up to four JSON-encoded metadata fields holding its
//! edge list, dedup lineage, relationship strengths, and (stamped at the
//! document level) dedup history. Reads are backward-compatible: missing
//! fields deserialize to empty. Global state (the merge-history log) lives
//! in a designated system document in the short-term collection so it
//! survives restarts without a side database.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MemoryResult;
use crate::store::{MetadataFilter, VectorStore};
use crate::types::{
    now_secs, ChunkRecord, Metadata, FIELD_DEDUP_SOURCES, FIELD_RELATED_CHUNKS,
    FIELD_RELATIONSHIP_STRENGTH, MAX_RELATIONSHIPS_PER_CHUNK,
};

/// Kind of a related-chunk edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Neighbor within the same document
    Adjacent,
    /// Established from embedding similarity at ingest
    SemanticSimilarity,
    /// Established from shared vocabulary within a document
    CoOccurrence,
    /// Chunk of a document absorbed during deduplication
    MergedSource,
    /// Anything written by an unknown producer
    #[serde(other)]
    Related,
}

/// One persisted related-chunk edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedChunkEdge {
    pub target_chunk_id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_relevance: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_terms: Vec<String>,
}

/// Lineage record written onto a chunk whose document absorbed another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupSourceRecord {
    pub original_document: String,
    pub merge_timestamp: f64,
    pub similarity_score: f64,
    pub merged_into: String,
}

/// The chunk-level relationship fields decoded from store metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedChunkData {
    pub related_chunks: Vec<RelatedChunkEdge>,
    pub deduplication_sources: Vec<DedupSourceRecord>,
    pub relationship_strength: std::collections::BTreeMap<String, f64>,
}

/// Serialize a value to a JSON string, degrading to an empty container on
/// failure so a bad edge never poisons a metadata write.
pub fn serialize_json<T: Serialize>(value: &T, empty: &'static str) -> String {
    match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to serialize relationship data");
            empty.to_string()
        }
    }
}

/// Deserialize a JSON string, returning the default on absence or parse
/// failure (backward compatibility with records written before these
/// fields existed).
pub fn deserialize_json<T: for<'de> Deserialize<'de> + Default>(raw: Option<&str>) -> T {
    match raw {
        None | Some("") => T::default(),
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            debug!(error = %e, "failed to deserialize relationship data, using default");
            T::default()
        }),
    }
}

/// Serialize a chunk's relationship fields into metadata updates.
///
/// The edge list is truncated to [`MAX_RELATIONSHIPS_PER_CHUNK`]; empty
/// collections produce no field at all.
pub fn serialize_chunk_fields(
    related_chunks: &[RelatedChunkEdge],
    dedup_sources: &[DedupSourceRecord],
    relationship_strength: &std::collections::BTreeMap<String, f64>,
) -> Vec<(String, String)> {
    let mut fields = Vec::new();

    if !related_chunks.is_empty() {
        let limited = &related_chunks[..related_chunks.len().min(MAX_RELATIONSHIPS_PER_CHUNK)];
        fields.push((FIELD_RELATED_CHUNKS.to_string(), serialize_json(&limited, "[]")));
    }
    if !dedup_sources.is_empty() {
        fields.push((FIELD_DEDUP_SOURCES.to_string(), serialize_json(&dedup_sources, "[]")));
    }
    if !relationship_strength.is_empty() {
        fields.push((
            FIELD_RELATIONSHIP_STRENGTH.to_string(),
            serialize_json(&relationship_strength, "{}"),
        ));
    }

    fields
}

/// Decode the chunk-level relationship fields from store metadata.
pub fn deserialize_chunk_fields(metadata: &Metadata) -> PersistedChunkData {
    PersistedChunkData {
        related_chunks: deserialize_json(metadata.get_str(FIELD_RELATED_CHUNKS)),
        deduplication_sources: deserialize_json(metadata.get_str(FIELD_DEDUP_SOURCES)),
        relationship_strength: deserialize_json(metadata.get_str(FIELD_RELATIONSHIP_STRENGTH)),
    }
}

/// Fetch a system document by type from the short-term collection.
pub async fn get_system_document(
    short_term: &dyn VectorStore,
    doc_type: &str,
) -> MemoryResult<Option<ChunkRecord>> {
    let hits = short_term
        .get(&MetadataFilter::DocumentType(doc_type.to_string()))
        .await?;
    Ok(hits.into_iter().next())
}

/// Save (update-or-insert) a system document in the short-term collection.
pub async fn save_system_document(
    short_term: &dyn VectorStore,
    doc_type: &str,
    payload: String,
) -> MemoryResult<()> {
    let now = now_secs();
    let mut metadata = Metadata::new();
    metadata.insert("document_type", doc_type);
    metadata.insert("is_system_doc", true);
    metadata.insert("updated_at", now);
    metadata.insert("chunk_id", format!("__system_{doc_type}__"));
    metadata.insert("document_id", format!("__system_{doc_type}__"));

    match get_system_document(short_term, doc_type).await? {
        Some(existing) => {
            // The store replaces metadata wholesale; rewrite content by
            // re-adding under the same id.
            let record = ChunkRecord {
                id: existing.id.clone(),
                content: payload,
                embedding: None,
                metadata,
            };
            short_term.add(vec![record]).await?;
            debug!(doc_type, "updated system document");
        }
        None => {
            let record = ChunkRecord {
                id: format!("system_{doc_type}_{}", (now * 1000.0) as i64),
                content: payload,
                embedding: None,
                metadata,
            };
            short_term.add(vec![record]).await?;
            debug!(doc_type, "created system document");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVectorStore;
    use crate::types::SYSTEM_DOC_TYPE_MERGE_HISTORY;
    use proptest::prelude::*;

    fn edge(target: &str, score: f64) -> RelatedChunkEdge {
        RelatedChunkEdge {
            target_chunk_id: target.to_string(),
            edge_type: EdgeType::SemanticSimilarity,
            score,
            context_relevance: Some(score + 0.1),
            common_terms: Vec::new(),
        }
    }

    #[test]
    fn test_round_trip_edges() {
        let edges = vec![edge("a_chunk_0", 0.9), edge("b_chunk_1", 0.85)];
        let fields = serialize_chunk_fields(&edges, &[], &Default::default());
        assert_eq!(fields.len(), 1);

        let mut meta = Metadata::new();
        meta.insert(fields[0].0.clone(), fields[0].1.clone());
        let decoded = deserialize_chunk_fields(&meta);
        assert_eq!(decoded.related_chunks, edges);
    }

    #[test]
    fn test_edge_list_capped_on_serialize() {
        let edges: Vec<_> = (0..80).map(|i| edge(&format!("c{i}"), 0.8)).collect();
        let fields = serialize_chunk_fields(&edges, &[], &Default::default());

        let mut meta = Metadata::new();
        meta.insert(fields[0].0.clone(), fields[0].1.clone());
        let decoded = deserialize_chunk_fields(&meta);
        assert_eq!(decoded.related_chunks.len(), MAX_RELATIONSHIPS_PER_CHUNK);
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let decoded = deserialize_chunk_fields(&Metadata::new());
        assert!(decoded.related_chunks.is_empty());
        assert!(decoded.deduplication_sources.is_empty());
        assert!(decoded.relationship_strength.is_empty());
    }

    #[test]
    fn test_garbage_field_deserializes_empty() {
        let mut meta = Metadata::new();
        meta.insert(FIELD_RELATED_CHUNKS, "not json at all");
        let decoded = deserialize_chunk_fields(&meta);
        assert!(decoded.related_chunks.is_empty());
    }

    #[test]
    fn test_unknown_edge_type_reads_as_related() {
        let mut meta = Metadata::new();
        meta.insert(
            FIELD_RELATED_CHUNKS,
            r#"[{"target_chunk_id":"x","type":"from_the_future","score":0.5}]"#,
        );
        let decoded = deserialize_chunk_fields(&meta);
        assert_eq!(decoded.related_chunks[0].edge_type, EdgeType::Related);
    }

    #[tokio::test]
    async fn test_system_document_save_then_get_round_trip() {
        let store = InMemoryVectorStore::new();
        let payload = r#"{"merge_1":{"timestamp":1.0}}"#.to_string();

        save_system_document(&store, SYSTEM_DOC_TYPE_MERGE_HISTORY, payload.clone())
            .await
            .unwrap();
        let doc = get_system_document(&store, SYSTEM_DOC_TYPE_MERGE_HISTORY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.content, payload);
        assert!(doc.metadata.is_system_doc());
    }

    #[tokio::test]
    async fn test_system_document_update_keeps_single_row() {
        let store = InMemoryVectorStore::new();
        save_system_document(&store, SYSTEM_DOC_TYPE_MERGE_HISTORY, "{}".to_string())
            .await
            .unwrap();
        save_system_document(&store, SYSTEM_DOC_TYPE_MERGE_HISTORY, r#"{"a":1}"#.to_string())
            .await
            .unwrap();

        use crate::store::VectorStore as _;
        assert_eq!(store.count().await.unwrap(), 1);
        let doc = get_system_document(&store, SYSTEM_DOC_TYPE_MERGE_HISTORY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.content, r#"{"a":1}"#);
    }

    proptest! {
        #[test]
        fn prop_edge_list_round_trips(scores in proptest::collection::vec(0.0f64..1.0, 0..50)) {
            let edges: Vec<_> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| edge(&format!("doc_chunk_{i}"), *s))
                .collect();

            let fields = serialize_chunk_fields(&edges, &[], &Default::default());
            let mut meta = Metadata::new();
            for (k, v) in fields {
                meta.insert(k, v);
            }
            let decoded = deserialize_chunk_fields(&meta);
            prop_assert_eq!(decoded.related_chunks, edges);
        }
    }
}
