//! Metadata merging for duplicate documents.
//!
//! When two rows are duplicates, the winner is chosen by importance, then
//! access count, then recency; the merged metadata keeps the strongest
//! retention signals from both sides and records an audit trail.

use crate::types::{ChunkRecord, Metadata, TtlTier};

/// Winner selection and metadata merge for duplicate pairs.
#[derive(Debug, Clone, Default)]
pub struct DocumentMerger;

impl DocumentMerger {
    pub fn new() -> Self {
        DocumentMerger
    }

    /// Choose the record to keep: higher importance, then higher access
    /// count, then later timestamp.
    pub fn choose_best<'a>(&self, a: &'a ChunkRecord, b: &'a ChunkRecord) -> &'a ChunkRecord {
        let importance_a = a.metadata.get_f64("importance_score").unwrap_or(0.0);
        let importance_b = b.metadata.get_f64("importance_score").unwrap_or(0.0);
        if importance_a != importance_b {
            return if importance_a > importance_b { a } else { b };
        }

        let access_a = a.metadata.get_i64("access_count").unwrap_or(0);
        let access_b = b.metadata.get_i64("access_count").unwrap_or(0);
        if access_a != access_b {
            return if access_a > access_b { a } else { b };
        }

        let ts_a = a.metadata.get_f64("timestamp").unwrap_or(0.0);
        let ts_b = b.metadata.get_f64("timestamp").unwrap_or(0.0);
        if ts_a > ts_b {
            a
        } else {
            b
        }
    }

    /// Merge metadata from a duplicate pair onto the winner's record.
    pub fn merge_metadata(
        &self,
        winner: &ChunkRecord,
        loser: &ChunkRecord,
        similarity: f64,
        now: f64,
    ) -> Metadata {
        let mut merged = winner.metadata.clone();
        let a = &winner.metadata;
        let b = &loser.metadata;

        merged.insert(
            "importance_score",
            a.get_f64("importance_score")
                .unwrap_or(0.0)
                .max(b.get_f64("importance_score").unwrap_or(0.0)),
        );
        merged.insert(
            "access_count",
            a.get_i64("access_count").unwrap_or(0) + b.get_i64("access_count").unwrap_or(0),
        );
        merged.insert(
            "first_seen",
            a.get_f64("timestamp")
                .unwrap_or(now)
                .min(b.get_f64("timestamp").unwrap_or(now)),
        );
        merged.insert(
            "last_accessed",
            a.get_f64("last_accessed")
                .unwrap_or(now)
                .max(b.get_f64("last_accessed").unwrap_or(now)),
        );

        let winner_id = a.document_id().unwrap_or(winner.id.as_str());
        let loser_id = b.document_id().unwrap_or(loser.id.as_str());
        merged.insert(
            "duplicate_sources",
            serde_json::to_string(&[winner_id, loser_id]).unwrap_or_else(|_| "[]".to_string()),
        );
        merged.insert("duplicate_merged", true);
        merged.insert("merge_timestamp", now);
        merged.insert("similarity_score", similarity);
        merged.insert("merged_from_count", 2i64);
        merged.insert(
            "content_length",
            winner.content.len().max(loser.content.len()) as i64,
        );

        merged.insert(
            "permanent_flag",
            a.get_bool("permanent_flag").unwrap_or(false)
                || b.get_bool("permanent_flag").unwrap_or(false),
        );
        merged.insert("ttl_tier", self.merge_ttl_tiers(a.ttl_tier(), b.ttl_tier()).to_string());

        let mut reasons: Vec<&str> = Vec::new();
        if let Some(r) = a.get_str("permanence_reason") {
            reasons.push(r);
        }
        if let Some(r) = b.get_str("permanence_reason") {
            if !reasons.contains(&r) {
                reasons.push(r);
            }
        }
        if !reasons.is_empty() {
            merged.insert("permanence_reason", reasons.join(", "));
        }

        merged
    }

    /// Keep the more permanent tier; absent tiers default to medium.
    fn merge_ttl_tiers(&self, a: Option<TtlTier>, b: Option<TtlTier>) -> TtlTier {
        match (a, b) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => TtlTier::MediumFrequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_700_000_000.0;

    fn record(id: &str, importance: f64, access: i64, timestamp: f64) -> ChunkRecord {
        let mut r = ChunkRecord::new(id, format!("content of {id}"));
        r.metadata.insert("chunk_id", id);
        r.metadata.insert("document_id", id.rsplit_once("_chunk_").map(|(d, _)| d.to_string()).unwrap_or_else(|| id.to_string()));
        r.metadata.insert("importance_score", importance);
        r.metadata.insert("access_count", access);
        r.metadata.insert("timestamp", timestamp);
        r.metadata.insert("last_accessed", timestamp);
        r
    }

    #[test]
    fn test_choose_best_by_importance() {
        let merger = DocumentMerger::new();
        let a = record("a_chunk_0", 0.9, 0, NOW);
        let b = record("b_chunk_0", 0.5, 100, NOW + 100.0);
        assert_eq!(merger.choose_best(&a, &b).id, "a_chunk_0");
    }

    #[test]
    fn test_choose_best_by_access_count_on_tie() {
        let merger = DocumentMerger::new();
        let a = record("a_chunk_0", 0.5, 3, NOW);
        let b = record("b_chunk_0", 0.5, 9, NOW - 100.0);
        assert_eq!(merger.choose_best(&a, &b).id, "b_chunk_0");
    }

    #[test]
    fn test_choose_best_by_recency_last() {
        let merger = DocumentMerger::new();
        let a = record("a_chunk_0", 0.5, 3, NOW + 50.0);
        let b = record("b_chunk_0", 0.5, 3, NOW);
        assert_eq!(merger.choose_best(&a, &b).id, "a_chunk_0");
    }

    #[test]
    fn test_merge_metadata_aggregates() {
        let merger = DocumentMerger::new();
        let mut a = record("a_chunk_0", 0.8, 3, NOW - 500.0);
        a.metadata.insert("ttl_tier", TtlTier::Static.to_string());
        let mut b = record("b_chunk_0", 0.6, 4, NOW - 1000.0);
        b.metadata.insert("ttl_tier", TtlTier::Permanent.to_string());
        b.metadata.insert("permanent_flag", true);
        b.metadata.insert("permanence_reason", "user_request");

        let merged = merger.merge_metadata(&a, &b, 0.97, NOW);

        assert_eq!(merged.get_f64("importance_score"), Some(0.8));
        assert_eq!(merged.get_i64("access_count"), Some(7));
        assert_eq!(merged.get_f64("first_seen"), Some(NOW - 1000.0));
        assert_eq!(merged.get_f64("last_accessed"), Some(NOW - 500.0));
        assert_eq!(merged.get_bool("permanent_flag"), Some(true));
        assert_eq!(merged.ttl_tier(), Some(TtlTier::Permanent));
        assert_eq!(merged.get_f64("similarity_score"), Some(0.97));
        assert_eq!(merged.get_bool("duplicate_merged"), Some(true));
        assert_eq!(merged.get_str("permanence_reason"), Some("user_request"));

        let sources: Vec<String> =
            serde_json::from_str(merged.get_str("duplicate_sources").unwrap()).unwrap();
        assert_eq!(sources, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_merge_metadata_concatenates_reasons() {
        let merger = DocumentMerger::new();
        let mut a = record("a_chunk_0", 0.8, 0, NOW);
        a.metadata.insert("permanence_reason", "high_importance");
        let mut b = record("b_chunk_0", 0.7, 0, NOW);
        b.metadata.insert("permanence_reason", "user_request");

        let merged = merger.merge_metadata(&a, &b, 0.96, NOW);
        assert_eq!(
            merged.get_str("permanence_reason"),
            Some("high_importance, user_request")
        );
    }

    #[test]
    fn test_merge_ttl_tiers_defaults_to_medium() {
        let merger = DocumentMerger::new();
        assert_eq!(merger.merge_ttl_tiers(None, None), TtlTier::MediumFrequency);
        assert_eq!(
            merger.merge_ttl_tiers(Some(TtlTier::HighFrequency), None),
            TtlTier::HighFrequency
        );
    }
}
