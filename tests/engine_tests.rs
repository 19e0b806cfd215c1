//! End-to-end engine scenarios: tier routing, ingest dedup boosting,
//! size-bounded maintenance, smart query routing, and document updates.

use engram::prelude::*;
use engram::services::MemoryType;
use serde_json::json;

fn engine() -> MemoryEngine {
    MemoryEngine::in_memory(&EngramConfig::default())
}

fn engine_with(configure: impl FnOnce(&mut EngramConfig)) -> MemoryEngine {
    let mut config = EngramConfig::default();
    configure(&mut config);
    MemoryEngine::in_memory(&config)
}

fn metadata(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn critical_configuration_routes_to_long_term_permanent() {
    let engine = engine();

    let report = engine
        .add_memory(
            "Critical system configuration",
            Some(&metadata(&[("permanence_flag", json!("critical"))])),
            None,
            MemoryType::Auto,
            None,
        )
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.collection, "long_term");
    assert!(report.importance_score >= 0.95, "got {}", report.importance_score);
    assert!(report.chunks_added >= 1);

    let rows = engine.tiers().long_term.get_all().await.unwrap();
    assert_eq!(rows.len(), report.chunks_added);
    let meta = &rows[0].metadata;
    assert_eq!(meta.get_str("ttl_tier"), Some("permanent"));
    assert_eq!(meta.get_bool("permanent_flag"), Some(true));
    assert!(!meta.contains_key("ttl_expiry"));
}

#[tokio::test]
async fn identical_resubmission_boosts_existing() {
    let engine = engine();
    let content = "Critical system configuration";
    let meta = metadata(&[("permanence_flag", json!("critical"))]);

    let first = engine
        .add_memory(content, Some(&meta), None, MemoryType::Auto, None)
        .await
        .unwrap();
    assert_eq!(first.action, "added");

    let second = engine
        .add_memory(content, Some(&meta), None, MemoryType::Auto, None)
        .await
        .unwrap();
    assert_eq!(second.action, "boosted_existing");
    assert_eq!(second.chunks_added, 0);
    assert!(second.similarity_score.unwrap() >= 0.95);

    // The original chunk absorbed the boost instead of a duplicate row.
    let rows = engine.tiers().long_term.get_all().await.unwrap();
    assert_eq!(rows.len(), first.chunks_added);
    assert_eq!(rows[0].metadata.get_i64("duplicate_boost_count"), Some(1));
    assert_eq!(rows[0].metadata.get_i64("access_count"), Some(1));
}

#[tokio::test]
async fn short_term_maintenance_enforces_size_bound() {
    let engine = engine_with(|c| {
        c.memory_management.short_term_max_size = 10;
    });

    // Insert 12 rows directly so the add-path auto-trigger cannot shrink
    // the set before the pass under test runs.
    let mut records = Vec::new();
    for i in 0..12 {
        let mut record = ChunkRecord::new(
            format!("doc_{i}_chunk_0"),
            format!("wholly distinct subject number {i}"),
        );
        let mut axis = vec![0.0f32; 16];
        axis[i % 16] = 1.0;
        record.embedding = Some(axis);
        record.metadata.insert("chunk_id", format!("doc_{i}_chunk_0"));
        record.metadata.insert("document_id", format!("doc_{i}"));
        record.metadata.insert("importance_score", 0.3);
        record.metadata.insert("access_count", i as i64 % 3);
        record
            .metadata
            .insert("timestamp", 1_700_000_000.0 + i as f64);
        records.push(record);
    }
    engine.tiers().short_term.add(records).await.unwrap();

    let report = engine.maintain_short_term().await.unwrap();
    assert!(report.triggered);
    assert_eq!(report.initial_count, 12);
    assert_eq!(report.target_size, 8);

    let remaining = engine.tiers().short_term.count().await.unwrap();
    assert!(remaining <= 8, "count after maintenance: {remaining}");
}

#[tokio::test]
async fn maintenance_removes_exact_duplicates_first() {
    let engine = engine_with(|c| {
        c.memory_management.short_term_max_size = 4;
    });

    // Two identical pairs plus two distinct docs: six rows, target 3.
    // The pair survivors carry access counts so the age fallback prefers
    // evicting the idle solo document.
    let mut records = Vec::new();
    let specs: [(&str, Vec<f32>, f64, i64); 6] = [
        ("dup_a1", vec![1.0, 0.0, 0.0], 0.2, 0),
        ("dup_a2", vec![1.0, 0.0, 0.0], 0.6, 5),
        ("dup_b1", vec![0.0, 1.0, 0.0], 0.7, 5),
        ("dup_b2", vec![0.0, 1.0, 0.0], 0.1, 0),
        ("solo_1", vec![0.0, 0.0, 1.0], 0.5, 0),
        ("solo_2", vec![0.5, 0.5, 0.7], 0.5, 3),
    ];
    for (name, embedding, importance, access) in specs {
        let mut record = ChunkRecord::new(format!("{name}_chunk_0"), format!("content {name}"));
        record.embedding = Some(embedding);
        record.metadata.insert("chunk_id", format!("{name}_chunk_0"));
        record.metadata.insert("document_id", name);
        record.metadata.insert("importance_score", importance);
        record.metadata.insert("access_count", access);
        record.metadata.insert("timestamp", 1_700_000_000.0);
        records.push(record);
    }
    engine.tiers().short_term.add(records).await.unwrap();

    let report = engine.maintain_short_term().await.unwrap();
    assert!(report.triggered);
    assert!(report.duplicate_removals >= 2);

    // The higher-quality member of each duplicate pair survived.
    let rows = engine.tiers().short_term.get_all().await.unwrap();
    let ids: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.metadata.get_str("chunk_id"))
        .collect();
    assert!(ids.contains(&"dup_a2_chunk_0"));
    assert!(!ids.contains(&"dup_a1_chunk_0"));
    assert!(ids.contains(&"dup_b1_chunk_0"));
    assert!(!ids.contains(&"dup_b2_chunk_0"));
}

#[tokio::test]
async fn cluster_phase_never_removes_fresh_documents() {
    let engine = engine_with(|c| {
        c.memory_management.short_term_max_size = 4;
    });

    // Six similar-but-not-identical rows created just now: the duplicate
    // sweep finds no pair above 0.95, and the clustering phase must skip
    // everything younger than a day, leaving the age fallback to do all
    // the work.
    let now = engram::now_secs();
    let mut records = Vec::new();
    for i in 0..6 {
        let mut record = ChunkRecord::new(
            format!("fresh_{i}_chunk_0"),
            format!("similar content variant {i}"),
        );
        // 20-degree angular spacing: every pair is below the exact-dup
        // threshold, neighbors are above the cluster threshold.
        let theta = (i as f32) * 20.0_f32.to_radians();
        record.embedding = Some(vec![theta.cos(), theta.sin()]);
        record.metadata.insert("chunk_id", format!("fresh_{i}_chunk_0"));
        record.metadata.insert("document_id", format!("fresh_{i}"));
        record.metadata.insert("importance_score", 0.3);
        record.metadata.insert("access_count", i as i64);
        record.metadata.insert("timestamp", now);
        records.push(record);
    }
    engine.tiers().short_term.add(records).await.unwrap();

    let report = engine.maintain_short_term().await.unwrap();
    assert!(report.triggered);
    assert_eq!(report.cluster_removals, 0, "phase 2 touched fresh documents");
    assert!(report.age_removals >= 1);
    assert!(engine.tiers().short_term.count().await.unwrap() <= 3);
}

#[tokio::test]
async fn technical_query_uses_smart_routing() {
    let engine = engine();
    engine
        .add_memory(
            "getUserById throws a null pointer error in the api endpoint handler",
            None,
            None,
            MemoryType::LongTerm,
            None,
        )
        .await
        .unwrap();

    let response = engine
        .query_memories(
            "error in getUserById implementation for api endpoint",
            None,
            10,
            true,
            false,
        )
        .await
        .unwrap();

    assert!(response.smart_routing_used);
    assert_eq!(
        response.collections_searched,
        vec!["long_term".to_string(), "short_term".to_string()]
    );
    assert!(!response.content.is_empty());
}

#[tokio::test]
async fn plain_query_does_not_report_smart_routing() {
    let engine = engine();
    engine
        .add_memory("grocery list for the weekend", None, None, MemoryType::ShortTerm, None)
        .await
        .unwrap();

    let response = engine
        .query_memories("grocery list", None, 5, true, false)
        .await
        .unwrap();
    // The plan matches the default order, so no smart routing is claimed.
    assert!(!response.smart_routing_used);
}

#[tokio::test]
async fn multi_chunk_documents_attach_related_context() {
    let engine = engine_with(|c| {
        c.memory_management.chunk_size = 80;
        c.memory_management.chunk_overlap = 10;
    });

    let content = "The lifecycle controller owns the TTL manager. \
                   The TTL manager assigns tiers from importance. \
                   Aging decays stored importance over wall time. \
                   Maintenance reclaims space in the bounded tier. \
                   Queries feed access statistics back into TTL.";
    let report = engine
        .add_memory(content, None, None, MemoryType::ShortTerm, None)
        .await
        .unwrap();
    assert!(report.chunks_added > 1);

    let response = engine
        .query_memories("TTL manager assigns tiers", None, 3, false, false)
        .await
        .unwrap();
    assert!(response.related_chunks_included > 0);
    let with_related = response
        .content
        .iter()
        .find(|hit| !hit.related_chunks.is_empty())
        .expect("at least one hit with related context");
    assert!(with_related.related_chunks.len() <= 2);
}

#[tokio::test]
async fn demote_then_update_same_value_is_stable() {
    let engine = engine();
    let report = engine
        .add_memory(
            "a document with moderate importance for later demotion",
            None,
            None,
            MemoryType::ShortTerm,
            None,
        )
        .await
        .unwrap();
    let doc_id = report.document_id.unwrap();

    let first = engine
        .update_document_importance(&doc_id, 0.4, Some("test demotion"))
        .await
        .unwrap();
    assert!(first.success);
    assert_eq!(first.new_ttl_tier.as_deref(), Some("medium_frequency"));

    let second = engine
        .update_document_importance(&doc_id, 0.4, None)
        .await
        .unwrap();
    assert_eq!(second.old_importance, Some(0.4));
    assert_eq!(second.new_importance, 0.4);
    assert_eq!(second.old_ttl_tier, second.new_ttl_tier);

    let rows = engine.tiers().short_term.get_all().await.unwrap();
    let row = rows.iter().find(|r| !r.metadata.is_system_doc()).unwrap();
    assert_eq!(row.metadata.get_f64("importance_score"), Some(0.4));
    assert_eq!(
        row.metadata.get_str("importance_change_reason"),
        Some("test demotion")
    );
}

#[tokio::test]
async fn content_update_replaces_and_preserves_importance() {
    let engine = engine();
    let report = engine
        .add_memory(
            "Essential deployment credentials must not be lost",
            Some(&metadata(&[("permanence_flag", json!("critical"))])),
            None,
            MemoryType::Auto,
            None,
        )
        .await
        .unwrap();
    let doc_id = report.document_id.unwrap();
    let original_importance = report.importance_score;
    assert!(original_importance >= 0.95);

    let update = engine
        .update_document_content(&doc_id, "tiny replacement text", None, true)
        .await
        .unwrap();
    assert!(update.success);
    assert!(update.importance_preserved);
    assert_eq!(update.old_chunks, report.chunks_added);
    assert!(update.new_chunks >= 1);

    // Old document gone, replacement inherits the preserved importance.
    assert!(engine.delete_document(&doc_id).await.is_err());
    let new_id = update.new_document_id.unwrap();
    let rows = engine.tiers().long_term.get_all().await.unwrap();
    let row = rows
        .iter()
        .find(|r| r.metadata.document_id() == Some(new_id.as_str()))
        .unwrap();
    assert!(row.metadata.get_f64("importance_score").unwrap() >= original_importance);
    assert!(row.metadata.get_f64("updated_at").is_some());
}

#[tokio::test]
async fn query_permanent_filters_out_ephemeral_content() {
    let engine = engine();
    engine
        .add_memory(
            "Critical permanent configuration for the payment gateway",
            Some(&metadata(&[("permanence_flag", json!("critical"))])),
            None,
            MemoryType::Auto,
            None,
        )
        .await
        .unwrap();
    engine
        .add_memory(
            "passing thought about the payment gateway",
            None,
            Some(&metadata(&[("is_important", json!(false))])),
            MemoryType::ShortTerm,
            None,
        )
        .await
        .unwrap();

    let response = engine.query_permanent("payment gateway", 5).await.unwrap();
    assert!(!response.content.is_empty());
    for hit in &response.content {
        let permanent = hit.metadata.get_bool("permanent_flag").unwrap_or(false)
            || hit.metadata.get_f64("importance_score").unwrap_or(0.0) >= 0.95;
        assert!(permanent, "ephemeral hit leaked into permanent query");
    }
}

#[tokio::test]
async fn batch_dedup_merges_lineage_across_restarts() {
    let engine = engine();

    // Two near-identical rows planted directly in short-term.
    let mut records = Vec::new();
    for (name, importance) in [("left", 0.8), ("right", 0.4)] {
        let mut record = ChunkRecord::new(
            format!("{name}_chunk_0"),
            "identical content in both rows".to_string(),
        );
        record.embedding = Some(vec![1.0, 0.0]);
        record.metadata.insert("chunk_id", format!("{name}_chunk_0"));
        record.metadata.insert("document_id", name);
        record.metadata.insert("importance_score", importance);
        record.metadata.insert("access_count", 1i64);
        record.metadata.insert("timestamp", 1_700_000_000.0);
        record.metadata.insert("last_accessed", 1_700_000_000.0);
        records.push(record);
    }
    engine.tiers().short_term.add(records).await.unwrap();

    let report = engine
        .deduplicate_collection(CollectionType::ShortTerm, false)
        .await
        .unwrap();
    assert_eq!(report.merged_documents, 1);

    let rows = engine.tiers().short_term.get_all().await.unwrap();
    let winner = rows
        .iter()
        .find(|r| r.metadata.get_str("chunk_id") == Some("left_chunk_0"))
        .unwrap();
    assert_eq!(winner.metadata.get_bool("duplicate_merged"), Some(true));
    assert_eq!(winner.metadata.get_i64("access_count"), Some(2));

    // The merge event survives in the durable system document.
    let stats = engine.deduplication_stats();
    assert_eq!(stats["merge_history_records"], 1);
    assert_eq!(stats["total_documents_merged"], 1);
}

#[tokio::test]
async fn monitor_records_queries() {
    let engine = engine();
    engine
        .add_memory("observable content", None, None, MemoryType::ShortTerm, None)
        .await
        .unwrap();
    engine
        .query_memories("observable", None, 5, true, false)
        .await
        .unwrap();

    let summary = engine.query_performance(engram::monitor::TimeWindow::All);
    assert_eq!(summary.query_count, 1);
    assert!(summary.avg_processing_time_ms >= 0.0);
}
