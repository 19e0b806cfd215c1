//! Smart query routing: order the tiers and allocate per-tier result
//! budgets from an estimated query importance, adjusted for how effective
//! deduplication has been.

use crate::dedup::DedupStats;
use crate::types::CollectionType;

/// Tokens that mark a technical, likely high-value query.
const TECHNICAL_TOKENS: [&str; 7] = [
    "error",
    "bug",
    "implementation",
    "algorithm",
    "function",
    "class",
    "method",
];

/// Substrings common in content that tends to get deduplicated.
const DEDUP_PATTERN_TOKENS: [&str; 12] = [
    "config", "setting", "preference", "option", "api", "endpoint", "request", "response", "test",
    "spec", "mock", "fixture",
];

/// A routing decision: ordered tiers, per-tier result limits, and the
/// effective total k.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub search_order: Vec<CollectionType>,
    pub collection_limits: Vec<usize>,
    pub effective_k: usize,
}

impl QueryPlan {
    /// The plan used when smart routing is off or the caller picked
    /// collections explicitly.
    pub fn default_plan(collections: &[CollectionType], k: usize) -> QueryPlan {
        let per = k / collections.len().max(1);
        QueryPlan {
            search_order: collections.to_vec(),
            collection_limits: vec![per; collections.len()],
            effective_k: k,
        }
    }

    /// Whether this plan deviates from the default tier order.
    pub fn differs_from_default(&self) -> bool {
        self.search_order != CollectionType::all()
    }
}

/// Dedup-aware smart query router.
#[derive(Debug, Clone, Default)]
pub struct QueryRouter;

impl QueryRouter {
    pub fn new() -> Self {
        QueryRouter
    }

    /// Plan a query: estimate importance, adjust k for dedup quality,
    /// order the tiers.
    pub fn smart_query_routing(
        &self,
        query: &str,
        k: usize,
        dedup_stats: Option<&DedupStats>,
    ) -> QueryPlan {
        let importance = self.estimate_query_importance(query);
        let effective_k = self.adjust_k_for_deduplication(k, dedup_stats);

        let (search_order, collection_limits) = if importance > 0.8 {
            // High importance: long-term holds the higher-quality,
            // post-dedup content.
            (
                vec![CollectionType::LongTerm, CollectionType::ShortTerm],
                vec![effective_k / 2 + 1, effective_k / 2],
            )
        } else if importance > 0.5 {
            (
                vec![CollectionType::ShortTerm, CollectionType::LongTerm],
                vec![effective_k / 2, effective_k / 2],
            )
        } else {
            (
                vec![CollectionType::ShortTerm, CollectionType::LongTerm],
                vec![effective_k / 2 + 1, effective_k / 2],
            )
        };

        QueryPlan {
            search_order,
            collection_limits,
            effective_k,
        }
    }

    /// Estimate query importance from surface features, capped at 1.0.
    pub fn estimate_query_importance(&self, query: &str) -> f64 {
        let lower = query.to_lowercase();
        let mut importance: f64 = 0.5;

        if TECHNICAL_TOKENS.iter().any(|t| lower.contains(t)) {
            importance += 0.2;
        }

        // camelCase or snake_case identifiers signal a specific lookup.
        let has_identifier =
            query.chars().skip(1).any(|c| c.is_uppercase()) || query.contains('_');
        if has_identifier {
            importance += 0.1;
        }

        if query.split_whitespace().count() > 5 {
            importance += 0.1;
        }

        if DEDUP_PATTERN_TOKENS.iter().any(|t| lower.contains(t)) {
            importance += 0.1;
        }

        importance.min(1.0)
    }

    /// When dedup has removed a large share of content, collections are
    /// cleaner and the search can be more selective.
    fn adjust_k_for_deduplication(&self, k: usize, stats: Option<&DedupStats>) -> usize {
        let Some(stats) = stats else {
            return k;
        };
        if stats.total_documents_processed == 0 {
            return k;
        }
        let ratio = stats.total_duplicates_removed as f64 / stats.total_documents_processed as f64;
        if ratio > 0.3 {
            k.max((k as f64 * 0.8) as usize)
        } else {
            k
        }
    }
}
