//! Core data types shared across the memory engine.
//!
//! The persisted unit is the chunk: a slice of a caller document together
//! with its embedding and a flat metadata record. Metadata values are
//! scalars at the vector-store boundary; richer structures are flattened
//! to JSON strings before they cross it.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Metadata field holding the serialized related-chunk edge list.
pub const FIELD_RELATED_CHUNKS: &str = "related_chunks_data";
/// Metadata field holding serialized deduplication source records.
pub const FIELD_DEDUP_SOURCES: &str = "dedup_sources_data";
/// Metadata field holding serialized relationship strengths.
pub const FIELD_RELATIONSHIP_STRENGTH: &str = "relationship_strength_data";
/// Metadata field holding the document-level dedup history, stamped per chunk.
pub const FIELD_DEDUP_HISTORY: &str = "dedup_history_data";

/// System document type marking the durable merge-history row.
pub const SYSTEM_DOC_TYPE_MERGE_HISTORY: &str = "system_merge_history";

/// Merge-history log entries are pruned (oldest first) beyond this size.
pub const MAX_MERGE_HISTORY_SIZE: usize = 1000;
/// Per-chunk persisted edge lists are truncated to this length on serialize.
pub const MAX_RELATIONSHIPS_PER_CHUNK: usize = 50;

/// Current wall time as f64 epoch seconds, the unit used by all persisted
/// timestamps.
pub fn now_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

/// Memory collection (retention tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    /// Bounded working set with aggressive cleanup
    ShortTerm,
    /// Durable high-importance storage
    LongTerm,
}

impl CollectionType {
    /// All tiers in default search order.
    pub fn all() -> [CollectionType; 2] {
        [CollectionType::ShortTerm, CollectionType::LongTerm]
    }

    /// Parse from the wire name used in metadata and tool parameters.
    pub fn parse(name: &str) -> Option<CollectionType> {
        match name {
            "short_term" => Some(CollectionType::ShortTerm),
            "long_term" => Some(CollectionType::LongTerm),
            _ => None,
        }
    }
}

impl std::fmt::Display for CollectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionType::ShortTerm => write!(f, "short_term"),
            CollectionType::LongTerm => write!(f, "long_term"),
        }
    }
}

/// TTL tier assigned from importance. Ordering is by permanence: a merge of
/// two tiers keeps the more permanent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    HighFrequency,
    MediumFrequency,
    LowFrequency,
    Static,
    Permanent,
}

impl TtlTier {
    /// Parse from the wire name stored in metadata.
    pub fn parse(name: &str) -> Option<TtlTier> {
        match name {
            "high_frequency" => Some(TtlTier::HighFrequency),
            "medium_frequency" => Some(TtlTier::MediumFrequency),
            "low_frequency" => Some(TtlTier::LowFrequency),
            "static" => Some(TtlTier::Static),
            "permanent" => Some(TtlTier::Permanent),
            _ => None,
        }
    }
}

impl std::fmt::Display for TtlTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtlTier::HighFrequency => write!(f, "high_frequency"),
            TtlTier::MediumFrequency => write!(f, "medium_frequency"),
            TtlTier::LowFrequency => write!(f, "low_frequency"),
            TtlTier::Static => write!(f, "static"),
            TtlTier::Permanent => write!(f, "permanent"),
        }
    }
}

/// A scalar metadata value as accepted by the vector-store boundary.
///
/// Lists and maps never appear here; callers flatten them to JSON strings
/// via [`Metadata::insert_flattened`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetaValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            MetaValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Float(f) => Some(*f),
            MetaValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

/// Flat metadata record attached to every persisted chunk.
///
/// Backed by an ordered map so serialized forms are deterministic. Typed
/// accessors return `None` for absent keys and for type mismatches, which
/// keeps reads backward-compatible with records written by older versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(pub BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Metadata(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Merge `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(MetaValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(MetaValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MetaValue::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetaValue::as_str)
    }

    /// The canonical document id, falling back to the `memory_id` read alias.
    pub fn document_id(&self) -> Option<&str> {
        self.get_str("document_id").or_else(|| self.get_str("memory_id"))
    }

    /// TTL tier decoded from its wire name.
    pub fn ttl_tier(&self) -> Option<TtlTier> {
        self.get_str("ttl_tier").and_then(TtlTier::parse)
    }

    /// Whether this record is an internal system document (merge history).
    pub fn is_system_doc(&self) -> bool {
        self.get_str("document_type").is_some() || self.get_bool("is_system_doc").unwrap_or(false)
    }

    /// Insert a JSON value, flattening anything non-scalar to a JSON string.
    ///
    /// Null becomes the empty string; numbers outside i64 range are stored
    /// as floats.
    pub fn insert_flattened(&mut self, key: impl Into<String>, value: &serde_json::Value) {
        let flattened = match value {
            serde_json::Value::Bool(b) => MetaValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MetaValue::Int(i)
                } else {
                    MetaValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => MetaValue::Str(s.clone()),
            serde_json::Value::Null => MetaValue::Str(String::new()),
            other => MetaValue::Str(other.to_string()),
        };
        self.0.insert(key.into(), flattened);
    }

    /// Flatten an entire JSON object into metadata, per-key.
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Metadata {
        let mut meta = Metadata::new();
        for (k, v) in object {
            meta.insert_flattened(k.clone(), v);
        }
        meta
    }

    /// Render as a JSON object for tool envelopes and reports.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A persisted chunk row as stored in (and returned by) a vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Store row id; equals the chunk id for rows written by this engine
    pub id: String,
    /// Full chunk text
    pub content: String,
    /// Unit-normalized embedding; absent for system documents
    pub embedding: Option<Vec<f32>>,
    /// Flat metadata record
    pub metadata: Metadata,
}

impl ChunkRecord {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        ChunkRecord {
            id: id.into(),
            content: content.into(),
            embedding: None,
            metadata: Metadata::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_type_display_and_parse() {
        assert_eq!(format!("{}", CollectionType::ShortTerm), "short_term");
        assert_eq!(format!("{}", CollectionType::LongTerm), "long_term");
        assert_eq!(CollectionType::parse("short_term"), Some(CollectionType::ShortTerm));
        assert_eq!(CollectionType::parse("bogus"), None);
    }

    #[test]
    fn test_ttl_tier_permanence_order() {
        assert!(TtlTier::Permanent > TtlTier::Static);
        assert!(TtlTier::Static > TtlTier::LowFrequency);
        assert!(TtlTier::LowFrequency > TtlTier::MediumFrequency);
        assert!(TtlTier::MediumFrequency > TtlTier::HighFrequency);
    }

    #[test]
    fn test_ttl_tier_round_trip() {
        for tier in [
            TtlTier::HighFrequency,
            TtlTier::MediumFrequency,
            TtlTier::LowFrequency,
            TtlTier::Static,
            TtlTier::Permanent,
        ] {
            assert_eq!(TtlTier::parse(&tier.to_string()), Some(tier));
        }
    }

    #[test]
    fn test_metadata_typed_accessors() {
        let mut meta = Metadata::new();
        meta.insert("importance_score", 0.75);
        meta.insert("access_count", 3i64);
        meta.insert("permanent_flag", true);
        meta.insert("chunk_id", "doc_chunk_0");

        assert_eq!(meta.get_f64("importance_score"), Some(0.75));
        assert_eq!(meta.get_i64("access_count"), Some(3));
        // Int coerces to f64 for callers that only care about magnitude
        assert_eq!(meta.get_f64("access_count"), Some(3.0));
        assert_eq!(meta.get_bool("permanent_flag"), Some(true));
        assert_eq!(meta.get_str("chunk_id"), Some("doc_chunk_0"));
        assert_eq!(meta.get_f64("missing"), None);
    }

    #[test]
    fn test_document_id_alias() {
        let mut meta = Metadata::new();
        meta.insert("memory_id", "short_term_1_2222");
        assert_eq!(meta.document_id(), Some("short_term_1_2222"));

        meta.insert("document_id", "short_term_9_1111");
        assert_eq!(meta.document_id(), Some("short_term_9_1111"));
    }

    #[test]
    fn test_flatten_complex_values() {
        let mut meta = Metadata::new();
        meta.insert_flattened("tags", &json!(["a", "b"]));
        meta.insert_flattened("nested", &json!({"k": 1}));
        meta.insert_flattened("none", &json!(null));
        meta.insert_flattened("n", &json!(42));

        assert_eq!(meta.get_str("tags"), Some(r#"["a","b"]"#));
        assert_eq!(meta.get_str("nested"), Some(r#"{"k":1}"#));
        assert_eq!(meta.get_str("none"), Some(""));
        assert_eq!(meta.get_i64("n"), Some(42));
    }

    #[test]
    fn test_metadata_merge_overwrites() {
        let mut base = Metadata::new();
        base.insert("a", 1i64);
        base.insert("b", 2i64);

        let mut update = Metadata::new();
        update.insert("b", 20i64);
        update.insert("c", 30i64);

        base.merge(&update);
        assert_eq!(base.get_i64("a"), Some(1));
        assert_eq!(base.get_i64("b"), Some(20));
        assert_eq!(base.get_i64("c"), Some(30));
    }
}
