//! # Engram — Hierarchical Semantic Memory
//!
//! A self-maintaining semantic memory store for long-running agent
//! workloads. Incoming documents are scored, chunked, embedded, routed
//! into one of two retention tiers, continuously deduplicated against
//! prior content, decayed by age and access, and garbage-collected when
//! their time-to-live expires. Queries are vector searches across tiers
//! with dedup-aware routing, context expansion through chunk
//! relationships, and access-statistics feedback.
//!
//! ## Quick Start
//!
//! ```ignore
//! use engram::{EngramConfig, MemoryEngine, MemoryType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     engram::init_logging();
//!     let engine = MemoryEngine::in_memory(&EngramConfig::load()?);
//!
//!     // Store a document; importance scoring picks the tier.
//!     let report = engine
//!         .add_memory("Critical system configuration", None, None, MemoryType::Auto, None)
//!         .await?;
//!     println!("stored {} in {}", report.document_id.unwrap(), report.collection);
//!
//!     // Query with smart routing.
//!     let results = engine
//!         .query_memories("system configuration", None, 5, true, false)
//!         .await?;
//!     for hit in results.content {
//!         println!("{:.3} {}", hit.retrieval_score, hit.content);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The engine is built from small, separately testable parts:
//!
//! 1. **Pure cores** — importance scoring, TTL assignment, aging decay,
//!    cosine similarity, chunking. Synchronous and cheap.
//! 2. **Subsystems** — the deduplication engine, the chunk relationship
//!    graph (with durable persistence in vector-store metadata), and the
//!    lifecycle controller with its background cadence.
//! 3. **Services** — ingest, query, maintenance, update, and statistics,
//!    composed by [`MemoryEngine`].
//!
//! The vector store, embedding model, and cross-encoder reranker are
//! collaborators behind traits in [`store`]; any embedding-indexed KV with
//! metadata filters satisfies the store contract.
//!
//! ## Thread Safety
//!
//! [`MemoryEngine`] is cheap to clone (`Arc` internally) and safe to share
//! across tasks:
//!
//! ```ignore
//! let engine = MemoryEngine::in_memory(&EngramConfig::default());
//! let clone = engine.clone();
//! tokio::spawn(async move {
//!     clone.query_memories("notes", None, 5, true, false).await.unwrap();
//! });
//! ```

// Pure cores
pub mod chunker;
pub mod scoring;
pub mod similarity;

// Subsystems
pub mod dedup;
pub mod lifecycle;
pub mod relationships;

// Collaborator contracts and default in-memory backend
pub mod store;

// Services and the engine facade
pub mod services;

// Observability
pub mod monitor;

// Configuration
pub mod config;

// Tool surface
pub mod tools;

mod error;
mod types;

// Public API exports
pub use config::EngramConfig;
pub use error::{MemoryError, MemoryResult};
pub use services::{
    AddReport, MemoryEngine, MemoryType, QueryHit, QueryResponse, StorageService,
};
pub use store::{Embedder, HashEmbedder, InMemoryVectorStore, Reranker, TierSet, VectorStore};
pub use types::{
    now_secs, ChunkRecord, CollectionType, MetaValue, Metadata, TtlTier, MAX_MERGE_HISTORY_SIZE,
    MAX_RELATIONSHIPS_PER_CHUNK, SYSTEM_DOC_TYPE_MERGE_HISTORY,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngramConfig;
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::services::{AddReport, MemoryEngine, MemoryType, QueryResponse};
    pub use crate::store::{Embedder, TierSet, VectorStore};
    pub use crate::types::{ChunkRecord, CollectionType, Metadata, TtlTier};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled by the
/// `ENGRAM_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("ENGRAM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
