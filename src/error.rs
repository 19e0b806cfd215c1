/// Error types for engram operations.
///
/// This module provides the error hierarchy covering all failure modes in
/// the memory engine. All errors are well-typed and can be pattern-matched
/// for precise error handling at the tool boundary.
use thiserror::Error;

/// The main error type for engram operations.
///
/// All fallible operations return `Result<T, MemoryError>`. Recoverable
/// errors stay local to the component that produced them and are reported
/// back as part of the operation's result record; everything that escapes
/// carries one of these kinds.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Bad parameter shape or range (importance outside [0,1], empty id, ...)
    #[error("Invalid parameter: {reason}")]
    Validation {
        /// Description of what was wrong with the input
        reason: String,
    },

    /// Document or chunk missing in both tiers
    #[error("Document '{document_id}' not found in any collection")]
    NotFound {
        /// The id that was searched for
        document_id: String,
    },

    /// Vector store call failed (transport, internal error)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Disk or permission problem surfaced by the store
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Similarity or merge failure inside the deduplication engine
    #[error("Deduplication error: {0}")]
    Dedup(String),

    /// Delete failed during a cleanup pass
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// Relationship cache or persistence error
    #[error("Relationship error: {0}")]
    Relationship(String),

    /// Misconfigured tier table or clock anomaly
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Serialization error when converting metadata or config to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Stable kind name used by the tool boundary when mapping to
    /// JSON-RPC error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::Validation { .. } => "validation",
            MemoryError::NotFound { .. } => "not_found",
            MemoryError::Storage(_) => "storage",
            MemoryError::Filesystem(_) => "filesystem",
            MemoryError::Dedup(_) => "dedup",
            MemoryError::Cleanup(_) => "cleanup",
            MemoryError::Relationship(_) => "relationship",
            MemoryError::Lifecycle(_) => "lifecycle",
            MemoryError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for engram operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
