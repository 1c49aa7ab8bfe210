//! Configuration for the memory core
//!
//! Sensible defaults, overridable from the environment. The constants in
//! `constants.rs` are the canonical defaults; this struct exists so
//! deployments can tune retrieval without recompiling.

use std::env;
use std::path::PathBuf;
use tracing::info;

use crate::constants::{
    EMBEDDING_DIM, EXPANSION_NEIGHBOR_LIMIT, FUZZY_CANDIDATE_LIMIT, UPSTREAM_RETRY_BACKOFF_MS,
};

/// Store configuration loaded from environment with defaults.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage path for the embedded substrate (default: ./smriti_data).
    pub storage_path: PathBuf,

    /// Embedding dimension the embedder oracle is expected to produce
    /// (default: 1536, cosine convention).
    pub embedding_dim: usize,

    /// Default k for recall when the caller does not specify one.
    pub default_recall_k: usize,

    /// Fuzzy candidates returned per entity lookup.
    pub fuzzy_candidate_limit: usize,

    /// Neighbors kept per seed during graph expansion.
    pub expansion_neighbor_limit: usize,

    /// Fixed backoff (ms) before the single upstream retry.
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./smriti_data"),
            embedding_dim: EMBEDDING_DIM,
            default_recall_k: 5,
            fuzzy_candidate_limit: FUZZY_CANDIDATE_LIMIT,
            expansion_neighbor_limit: EXPANSION_NEIGHBOR_LIMIT,
            retry_backoff_ms: UPSTREAM_RETRY_BACKOFF_MS,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("SMRITI_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("SMRITI_EMBEDDING_DIM") {
            if let Ok(n) = val.parse::<usize>() {
                config.embedding_dim = n.clamp(8, 8192);
            }
        }

        if let Ok(val) = env::var("SMRITI_RECALL_K") {
            if let Ok(n) = val.parse::<usize>() {
                config.default_recall_k = n.clamp(1, 100);
            }
        }

        if let Ok(val) = env::var("SMRITI_FUZZY_LIMIT") {
            if let Ok(n) = val.parse::<usize>() {
                config.fuzzy_candidate_limit = n.clamp(1, 100);
            }
        }

        if let Ok(val) = env::var("SMRITI_NEIGHBOR_LIMIT") {
            if let Ok(n) = val.parse::<usize>() {
                config.expansion_neighbor_limit = n.clamp(1, 50);
            }
        }

        if let Ok(val) = env::var("SMRITI_RETRY_BACKOFF_MS") {
            if let Ok(n) = val.parse() {
                config.retry_backoff_ms = n;
            }
        }

        config
    }

    /// Log the current configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!("   Storage: {:?}", self.storage_path);
        info!("   Embedding dim: {}", self.embedding_dim);
        info!("   Default recall k: {}", self.default_recall_k);
        info!(
            "   Fuzzy limit: {}, neighbor limit: {}",
            self.fuzzy_candidate_limit, self.expansion_neighbor_limit
        );
        info!("   Upstream retry backoff: {}ms", self.retry_backoff_ms);
    }
}
