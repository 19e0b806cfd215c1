//! Cosine similarity over document embeddings.
//!
//! Implements the batch calculations used by the deduplication engine:
//! all-pairs duplicate detection, threshold-filtered top-k candidate
//! probing, and greedy single-linkage clustering. All operations expect
//! unit-normalized embeddings; normalization is the caller's (embedder's)
//! responsibility. Records without embeddings are skipped with a logged
//! count, never a failure.

use tracing::{debug, info};

/// A document handed to the batch similarity operations: an opaque index
/// into the caller's collection plus an optional embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedDoc {
    /// Caller-side identity (index into the candidate set)
    pub index: usize,
    /// Unit-normalized embedding, if the record carries one
    pub embedding: Option<Vec<f32>>,
}

/// A duplicate pair found by the batch pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicatePair {
    pub first: usize,
    pub second: usize,
    pub similarity: f32,
}

/// Cosine similarity calculator for document embeddings.
#[derive(Debug, Clone)]
pub struct SimilarityCalculator {
    similarity_threshold: f32,
}

impl SimilarityCalculator {
    pub fn new(similarity_threshold: f32) -> Self {
        SimilarityCalculator { similarity_threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Cosine similarity between two embeddings, in [-1, 1].
    ///
    /// Dimension mismatches and zero vectors score 0.0.
    pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }

    /// Find duplicate pairs with one upper-triangular pass over the
    /// similarity matrix.
    ///
    /// Pairs scoring strictly above `threshold` (instance default when
    /// `None`) are returned in row-major order.
    pub fn find_duplicates_batch(
        &self,
        docs: &[EmbeddedDoc],
        threshold: Option<f32>,
    ) -> Vec<DuplicatePair> {
        let threshold = threshold.unwrap_or(self.similarity_threshold);

        if docs.len() < 2 {
            return Vec::new();
        }

        let (valid, skipped) = Self::partition_valid(docs);
        if skipped > 0 {
            debug!(skipped, "skipped documents without embeddings in batch pass");
        }
        if valid.len() < 2 {
            info!("not enough documents with embeddings for duplicate detection");
            return Vec::new();
        }

        let mut duplicates = Vec::new();
        for i in 0..valid.len() {
            for j in (i + 1)..valid.len() {
                let (idx_i, emb_i) = valid[i];
                let (idx_j, emb_j) = valid[j];
                let similarity = Self::cosine(emb_i, emb_j);
                if similarity > threshold {
                    duplicates.push(DuplicatePair {
                        first: idx_i,
                        second: idx_j,
                        similarity,
                    });
                }
            }
        }

        info!(
            duplicates = duplicates.len(),
            documents = valid.len(),
            "batch similarity pass complete"
        );
        duplicates
    }

    /// Find the most similar candidates to `target`, sorted by similarity
    /// descending and filtered by the instance threshold.
    pub fn top_k_candidates(
        &self,
        target: &[f32],
        pool: &[EmbeddedDoc],
        k: usize,
    ) -> Vec<(usize, f32)> {
        let (valid, _) = Self::partition_valid(pool);
        if valid.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = valid
            .iter()
            .map(|(idx, emb)| (*idx, Self::cosine(target, emb)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(k)
            .filter(|(_, score)| *score > self.similarity_threshold)
            .collect()
    }

    /// Group documents into similarity clusters by greedy single-linkage:
    /// each cluster is seeded from the first unassigned document and
    /// absorbs every later unassigned document above the threshold.
    pub fn cluster(&self, docs: &[EmbeddedDoc], cluster_threshold: f32) -> Vec<Vec<usize>> {
        let (valid, _) = Self::partition_valid(docs);
        if valid.len() < 2 {
            return valid.iter().map(|(idx, _)| vec![*idx]).collect();
        }

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut assigned = vec![false; valid.len()];

        for i in 0..valid.len() {
            if assigned[i] {
                continue;
            }
            let mut cluster = vec![valid[i].0];
            assigned[i] = true;

            for j in (i + 1)..valid.len() {
                if !assigned[j] && Self::cosine(valid[i].1, valid[j].1) > cluster_threshold {
                    cluster.push(valid[j].0);
                    assigned[j] = true;
                }
            }
            clusters.push(cluster);
        }

        info!(
            clusters = clusters.len(),
            documents = valid.len(),
            "document clustering complete"
        );
        clusters
    }

    fn partition_valid(docs: &[EmbeddedDoc]) -> (Vec<(usize, &[f32])>, usize) {
        let mut valid = Vec::with_capacity(docs.len());
        let mut skipped = 0usize;
        for doc in docs {
            match &doc.embedding {
                Some(emb) => valid.push((doc.index, emb.as_slice())),
                None => skipped += 1,
            }
        }
        (valid, skipped)
    }
}
