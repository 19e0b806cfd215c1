//! External collaborator contracts: the vector store, the embedding model,
//! and the cross-encoder reranker.
//!
//! Any embedding-indexed KV with metadata filters satisfies [`VectorStore`];
//! the engine ships a DashMap-backed flat-cosine implementation that doubles
//! as the test store. [`HashEmbedder`] is a deterministic bag-of-tokens
//! embedding for embedding-free deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, MemoryResult};
use crate::similarity::SimilarityCalculator;
use crate::types::{ChunkRecord, Metadata};

/// Single-field equality filter over chunk metadata — the subset of
/// filtering the engine needs from a store.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    ChunkId(String),
    DocumentId(String),
    DocumentType(String),
}

impl MetadataFilter {
    /// Whether a record's metadata matches this filter.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataFilter::ChunkId(id) => metadata.get_str("chunk_id") == Some(id.as_str()),
            MetadataFilter::DocumentId(id) => {
                metadata.get_str("document_id") == Some(id.as_str())
                    || metadata.get_str("memory_id") == Some(id.as_str())
            }
            MetadataFilter::DocumentType(t) => {
                metadata.get_str("document_type") == Some(t.as_str())
            }
        }
    }
}

/// A search hit: the record plus its cosine similarity to the query.
pub type SearchHit = (ChunkRecord, f32);

/// The vector-store collaborator contract. One instance per tier.
///
/// Metadata values must be scalars at this boundary. Implementations are
/// expected to provide per-call atomicity for `delete` (deleting an
/// already-gone id is a no-op) but no cross-call transactions.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records. Ids are caller-chosen and unique; re-adding an
    /// existing id replaces the whole row (upsert).
    async fn add(&self, records: Vec<ChunkRecord>) -> MemoryResult<()>;

    /// Fetch records matching a metadata filter.
    async fn get(&self, filter: &MetadataFilter) -> MemoryResult<Vec<ChunkRecord>>;

    /// Fetch every record in the collection.
    async fn get_all(&self) -> MemoryResult<Vec<ChunkRecord>>;

    /// k-nearest search by embedding; hits sorted by similarity descending.
    async fn search(&self, embedding: &[f32], k: usize) -> MemoryResult<Vec<SearchHit>>;

    /// Replace the metadata of existing records, matched positionally by id.
    async fn update_metadata(&self, ids: &[String], metadatas: Vec<Metadata>) -> MemoryResult<()>;

    /// Delete records by id. Missing ids are ignored.
    async fn delete(&self, ids: &[String]) -> MemoryResult<()>;

    /// Number of records in the collection.
    async fn count(&self) -> MemoryResult<usize>;
}

/// Text to fixed-dimension unit vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;

    /// Output dimension, fixed for the lifetime of the model.
    fn dimension(&self) -> usize;
}

/// Cross-encoder relevance scorer for (query, document) pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, document: &str) -> MemoryResult<f32>;
}

/// The pair of tier collections the engine operates on.
#[derive(Clone)]
pub struct TierSet {
    pub short_term: std::sync::Arc<dyn VectorStore>,
    pub long_term: std::sync::Arc<dyn VectorStore>,
}

impl TierSet {
    /// Fresh in-memory tiers, the default backend.
    pub fn in_memory() -> Self {
        TierSet {
            short_term: std::sync::Arc::new(InMemoryVectorStore::new()),
            long_term: std::sync::Arc::new(InMemoryVectorStore::new()),
        }
    }

    pub fn get(&self, collection: crate::types::CollectionType) -> &std::sync::Arc<dyn VectorStore> {
        match collection {
            crate::types::CollectionType::ShortTerm => &self.short_term,
            crate::types::CollectionType::LongTerm => &self.long_term,
        }
    }
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierSet").finish_non_exhaustive()
    }
}

/// In-memory flat-cosine vector store.
///
/// Stores all records in a concurrent map and performs exact k-NN by
/// scanning every embedding. O(n) per query, which is the right trade for
/// bounded tiers and for tests.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    records: DashMap<String, ChunkRecord>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        InMemoryVectorStore {
            records: DashMap::new(),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, records: Vec<ChunkRecord>) -> MemoryResult<()> {
        for record in records {
            if record.id.is_empty() {
                return Err(MemoryError::Storage("record with empty id".to_string()));
            }
            self.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn get(&self, filter: &MetadataFilter) -> MemoryResult<Vec<ChunkRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| filter.matches(&entry.value().metadata))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_all(&self) -> MemoryResult<Vec<ChunkRecord>> {
        Ok(self.records.iter().map(|e| e.value().clone()).collect())
    }

    async fn search(&self, embedding: &[f32], k: usize) -> MemoryResult<Vec<SearchHit>> {
        let mut hits: Vec<SearchHit> = self
            .records
            .iter()
            .filter_map(|entry| {
                let record = entry.value();
                record
                    .embedding
                    .as_ref()
                    .map(|emb| (record.clone(), SimilarityCalculator::cosine(embedding, emb)))
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn update_metadata(&self, ids: &[String], metadatas: Vec<Metadata>) -> MemoryResult<()> {
        if ids.len() != metadatas.len() {
            return Err(MemoryError::Storage(format!(
                "update arity mismatch: {} ids, {} metadatas",
                ids.len(),
                metadatas.len()
            )));
        }
        for (id, metadata) in ids.iter().zip(metadatas) {
            match self.records.get_mut(id) {
                Some(mut record) => record.metadata = metadata,
                None => {
                    return Err(MemoryError::Storage(format!(
                        "cannot update missing record '{id}'"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> MemoryResult<()> {
        for id in ids {
            self.records.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> MemoryResult<usize> {
        Ok(self.records.len())
    }
}

/// Deterministic bag-of-tokens embedding.
///
/// Each lowercase token is hashed into one of `dimension` buckets; the
/// resulting count vector is L2-normalized. Identical texts embed
/// identically, token-sharing texts score high cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashEmbedder {
            dimension: dimension.max(8),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(bytes) % self.dimension as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(token)] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, content: &str, embedding: Vec<f32>) -> ChunkRecord {
        let mut r = ChunkRecord::new(id, content);
        r.embedding = Some(embedding);
        r.metadata.insert("chunk_id", id);
        r
    }

    #[tokio::test]
    async fn test_add_get_count() {
        let store = InMemoryVectorStore::new();
        store
            .add(vec![record("a_chunk_0", "hello", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let hits = store
            .get(&MetadataFilter::ChunkId("a_chunk_0".to_string()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "hello");
    }

    #[tokio::test]
    async fn test_document_filter_matches_alias() {
        let store = InMemoryVectorStore::new();
        let mut r = record("c0", "x", vec![1.0]);
        r.metadata.insert("memory_id", "doc_1");
        store.add(vec![r]).await.unwrap();

        let hits = store
            .get(&MetadataFilter::DocumentId("doc_1".to_string()))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .add(vec![
                record("a", "one", vec![1.0, 0.0]),
                record("b", "two", vec![0.7, 0.7]),
                record("c", "three", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, "a");
        assert_eq!(hits[1].0.id, "b");
        assert!(hits[0].1 > hits[1].1);
    }

    #[tokio::test]
    async fn test_search_skips_embeddingless_rows() {
        let store = InMemoryVectorStore::new();
        let mut system = ChunkRecord::new("sys", "{}");
        system.metadata.insert("document_type", "system_merge_history");
        store.add(vec![system, record("a", "one", vec![1.0])]).await.unwrap();

        let hits = store.search(&[1.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, "a");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store.add(vec![record("a", "one", vec![1.0])]).await.unwrap();

        store.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        // Second delete of a gone id is a no-op.
        store.delete(&["a".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_metadata_replaces() {
        let store = InMemoryVectorStore::new();
        store.add(vec![record("a", "one", vec![1.0])]).await.unwrap();

        let mut meta = Metadata::new();
        meta.insert("chunk_id", "a");
        meta.insert("access_count", 5i64);
        store
            .update_metadata(&["a".to_string()], vec![meta])
            .await
            .unwrap();

        let hits = store
            .get(&MetadataFilter::ChunkId("a".to_string()))
            .await
            .unwrap();
        assert_eq!(hits[0].metadata.get_i64("access_count"), Some(5));
    }

    #[tokio::test]
    async fn test_update_missing_record_errors() {
        let store = InMemoryVectorStore::new();
        let err = store
            .update_metadata(&["missing".to_string()], vec![Metadata::new()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage");
    }

    #[tokio::test]
    async fn test_hash_embedder_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("the quick brown fox").await.unwrap();
        let b = embedder.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hash_embedder_similarity_ordering() {
        let embedder = HashEmbedder::new(128);
        let base = embedder.embed("memory engine lifecycle scoring").await.unwrap();
        let near = embedder.embed("memory engine lifecycle design").await.unwrap();
        let far = embedder.embed("unrelated grocery shopping list").await.unwrap();

        let near_sim = SimilarityCalculator::cosine(&base, &near);
        let far_sim = SimilarityCalculator::cosine(&base, &far);
        assert!(near_sim > far_sim);
        assert!(near_sim > 0.5);
    }
}
