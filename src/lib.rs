//! Smriti
//!
//! Embedded personal memory store over a knowledge graph.
//!
//! # Key Features
//! - Entity identity: dedup on (normalized name, type), aliases, merge
//! - Versioned entity properties with optimistic concurrency
//! - Hybrid retrieval (vector seeds + graph expansion over mention edges)
//! - Hypothetical-question index for recall beyond literal phrasing
//! - Atomic multi-statement writes (one observation, one commit)
//!
//! Extraction, embedding, and disambiguation are pluggable oracles; the
//! store itself is fully local (RocksDB + tantivy, no external database).

pub mod config;
pub mod constants;
pub mod entity_store;
pub mod errors;
pub mod memory_store;
pub mod model;
pub mod oracle;
pub mod orchestrator;
pub mod retrieval;
pub mod similarity;
pub mod substrate;

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use uuid;

pub use config::StoreConfig;
pub use errors::{Error, Result};
pub use orchestrator::{Answer, Orchestrator};
