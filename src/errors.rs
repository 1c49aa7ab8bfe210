//! Structured error types for the memory core
//!
//! Every public operation fails with one of these variants; callers get a
//! machine-readable code plus enough context (ids, candidate lists) to act.
//! No variant is process-fatal. Each operation fails independently and a
//! failed transaction leaves no partial writes behind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::EntityId;

/// Trimmed candidate carried inside an ambiguity error so the caller can
/// present a manual choice without re-running the lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateBrief {
    pub id: EntityId,
    pub display_name: String,
    pub score: f32,
}

/// Error taxonomy of the core.
#[derive(Debug)]
pub enum Error {
    /// Unknown entity id passed to update/history/merge.
    EntityNotFound(String),

    /// Unknown memory id, or no memory matched a todo query.
    MemoryNotFound(String),

    /// Disambiguation was inconclusive. Never silently guessed; the
    /// candidate list is surfaced for manual resolution.
    AmbiguousEntity {
        name: String,
        candidates: Vec<CandidateBrief>,
    },

    /// Optimistic concurrency check failed on an entity update.
    VersionConflict {
        entity_id: EntityId,
        expected: u64,
        actual: u64,
    },

    /// Vector or fuzzy index not yet built. Recovered locally by the
    /// retrieval engine (recency fallback), not surfaced to consumers.
    IndexUnavailable(String),

    /// Transient oracle or substrate failure. Retried once with fixed
    /// backoff before reaching the caller.
    Upstream(String),

    /// Input that cannot be persisted as requested.
    Validation { field: String, reason: String },

    /// Substrate storage failure.
    Storage(String),

    /// Encode/decode failure on stored records.
    Serialization(String),

    /// Generic wrapper for external errors.
    Internal(anyhow::Error),
}

impl Error {
    /// Machine-readable code for client identification.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EntityNotFound(_) => "ENTITY_NOT_FOUND",
            Self::MemoryNotFound(_) => "MEMORY_NOT_FOUND",
            Self::AmbiguousEntity { .. } => "AMBIGUOUS_ENTITY",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::IndexUnavailable(_) => "INDEX_UNAVAILABLE",
            Self::Upstream(_) => "UPSTREAM_TRANSIENT",
            Self::Validation { .. } => "VALIDATION",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Detailed human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::EntityNotFound(id) => format!("Entity not found: {id}"),
            Self::MemoryNotFound(id) => format!("Memory not found: {id}"),
            Self::AmbiguousEntity { name, candidates } => format!(
                "Ambiguous entity '{name}': {} candidates need manual resolution",
                candidates.len()
            ),
            Self::VersionConflict {
                entity_id,
                expected,
                actual,
            } => format!(
                "Version conflict on entity {entity_id}: expected v{expected}, found v{actual}"
            ),
            Self::IndexUnavailable(msg) => format!("Index unavailable: {msg}"),
            Self::Upstream(msg) => format!("Upstream failure: {msg}"),
            Self::Validation { field, reason } => {
                format!("Invalid input for '{field}': {reason}")
            }
            Self::Storage(msg) => format!("Storage error: {msg}"),
            Self::Serialization(msg) => format!("Serialization error: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tantivy::TantivyError> for Error {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::Storage(format!("name index: {err}"))
    }
}

/// Type alias for Results using the core error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::EntityNotFound("x".to_string()).code(),
            "ENTITY_NOT_FOUND"
        );
        assert_eq!(
            Error::IndexUnavailable("empty".to_string()).code(),
            "INDEX_UNAVAILABLE"
        );
    }

    #[test]
    fn test_conflict_message_carries_versions() {
        let err = Error::VersionConflict {
            entity_id: EntityId(Uuid::new_v4()),
            expected: 3,
            actual: 4,
        };
        let msg = err.message();
        assert!(msg.contains("v3"));
        assert!(msg.contains("v4"));
    }

    #[test]
    fn test_ambiguous_carries_candidates() {
        let err = Error::AmbiguousEntity {
            name: "John".to_string(),
            candidates: vec![CandidateBrief {
                id: EntityId(Uuid::new_v4()),
                display_name: "John Doe".to_string(),
                score: 0.7,
            }],
        };
        assert!(err.message().contains("1 candidates"));
    }
}
