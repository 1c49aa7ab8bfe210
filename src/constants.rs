//! Tuning constants for the memory core
//!
//! All magic numbers live here so retrieval behavior can be audited in one
//! place. Values that need per-deployment tuning are mirrored in
//! `config::StoreConfig`.

/// Embedding dimension expected from the embedder oracle (cosine convention).
pub const EMBEDDING_DIM: usize = 1536;

/// Maximum hypothetical questions attached per memory.
pub const MAX_HYPOTHETICAL_QUESTIONS: usize = 5;

/// Graph expansion: neighbors kept per seed memory.
pub const EXPANSION_NEIGHBOR_LIMIT: usize = 5;

/// Graph expansion: shared-entity count at which a neighbor's overlap
/// fraction saturates (min(1, shared/10)).
pub const NEIGHBOR_SHARE_SATURATION: f32 = 10.0;

/// Graph expansion: hard ceiling on a neighbor's score. Keeps purely
/// graph-expanded results below every seed except possibly the lowest-ranked.
pub const NEIGHBOR_SCORE_CEILING: f32 = 0.5;

/// Fuzzy name matches are scaled by this factor so only an exact
/// normalized-name match can ever score 1.0.
pub const FUZZY_SCORE_SCALE: f32 = 0.9;

/// Fuzzy lookup: default number of candidates returned.
pub const FUZZY_CANDIDATE_LIMIT: usize = 10;

/// Fuzzy lookup: overfetch multiplier before type filtering and rescoring.
pub const FUZZY_OVERFETCH: usize = 3;

/// Fixed backoff before the single retry of a transient oracle failure.
pub const UPSTREAM_RETRY_BACKOFF_MS: u64 = 250;

/// Tantivy writer heap (bytes) for the entity name index.
pub const NAME_INDEX_WRITER_HEAP: usize = 15_000_000;
