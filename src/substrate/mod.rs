//! Persistence port for the memory core
//!
//! The stores depend only on this interface; any transactional graph+vector
//! backend can sit behind it. It must provide unique-key entity lookup,
//! vector top-k over memory and question embeddings, a fuzzy/token text
//! search over entity names and aliases, and atomic multi-mutation writes.

pub mod rocks;

pub use rocks::RocksSubstrate;

use crate::errors::Result;
use crate::model::{
    Entity, EntityId, EntityType, EntityVersion, HypotheticalQuestion, Memory, MemoryId,
    MentionEdge, Relationship, RelationType,
};

/// One write against the store. A `Vec<Mutation>` passed to
/// [`Substrate::apply`] commits atomically: full success or full rollback.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Create or overwrite an entity. The substrate maintains the
    /// (normalized_name, type) unique key and the fuzzy name index from the
    /// record itself.
    PutEntity(Entity),

    /// Remove an entity, its unique key, its fuzzy index entry, and its
    /// version log. Edges are NOT touched; callers re-point them first.
    DeleteEntity(EntityId),

    /// Append one snapshot to an entity's version log.
    PutVersion(EntityVersion),

    /// Create or overwrite a memory record.
    PutMemory(Memory),

    PutMention(MentionEdge),
    DeleteMention(MentionEdge),

    /// Upsert on the (from, to, type) natural key.
    PutRelationship(Relationship),
    DeleteRelationship {
        from: EntityId,
        to: EntityId,
        relation_type: RelationType,
    },

    PutQuestion(HypotheticalQuestion),
}

/// Staged mutations for one logical transaction, plus the entity keys
/// created inside it so later stages of the same transaction can resolve
/// names that are not committed yet.
#[derive(Debug, Default)]
pub struct TxBatch {
    mutations: Vec<Mutation>,
    staged_entities: std::collections::HashMap<(EntityType, String), EntityId>,
}

impl TxBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Record an entity key created by this batch.
    pub fn stage_entity(&mut self, entity_type: EntityType, normalized_name: String, id: EntityId) {
        self.staged_entities.insert((entity_type, normalized_name), id);
    }

    /// Look up an entity key staged earlier in this batch.
    pub fn staged_entity(&self, entity_type: EntityType, normalized_name: &str) -> Option<EntityId> {
        self.staged_entities
            .get(&(entity_type, normalized_name.to_string()))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Record counts, for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstrateStats {
    pub entities: usize,
    pub memories: usize,
    pub relationships: usize,
    pub questions: usize,
}

/// Transactional graph + vector + fuzzy-text backend.
pub trait Substrate: Send + Sync {
    // --- entities ---

    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    /// Unique-key lookup on (normalized_name, type).
    fn entity_id_by_key(
        &self,
        entity_type: EntityType,
        normalized_name: &str,
    ) -> Result<Option<EntityId>>;

    /// Token-level fuzzy search over entity names and aliases. Scores are
    /// fractional (< 1.0); exact matching is the unique key's job. Results
    /// are sorted descending, deduplicated by id, optionally type-filtered.
    fn fuzzy_entities(
        &self,
        name: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<(EntityId, f32)>>;

    /// One snapshot from an entity's version log.
    fn get_version(&self, id: &EntityId, version: u64) -> Result<Option<EntityVersion>>;

    // --- memories ---

    fn get_memory(&self, id: &MemoryId) -> Result<Option<Memory>>;

    /// The k most recently created memories, newest first. Serves the
    /// recency fallback when no vector index exists yet.
    fn recent_memories(&self, k: usize) -> Result<Vec<Memory>>;

    /// Every todo memory still open. Completion matching ranks inside
    /// this set so unrelated memories can never crowd a todo out.
    fn open_todos(&self) -> Result<Vec<Memory>>;

    /// Top-k memories by embedding similarity, positive scores only.
    /// Errors with `IndexUnavailable` when no memory carries an embedding.
    fn memory_vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>>;

    /// Top-k hypothetical-question hits, already resolved to their parent
    /// memory ids. An empty question index is normal and yields no hits.
    fn question_vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>>;

    // --- edges ---

    /// Distinct entities a memory mentions.
    fn mentions_of_memory(&self, id: &MemoryId) -> Result<Vec<EntityId>>;

    /// Distinct memories mentioning an entity.
    fn memories_mentioning(&self, id: &EntityId) -> Result<Vec<MemoryId>>;

    /// Raw mention edges touching an entity (duplicates preserved).
    /// Used by merge to re-point edges one by one.
    fn mention_edges_of_entity(&self, id: &EntityId) -> Result<Vec<MentionEdge>>;

    /// All typed relationships touching an entity, both directions.
    fn relationships_of(&self, id: &EntityId) -> Result<Vec<Relationship>>;

    fn get_relationship(
        &self,
        from: &EntityId,
        to: &EntityId,
        relation_type: RelationType,
    ) -> Result<Option<Relationship>>;

    // --- writes ---

    /// Apply a batch of mutations atomically.
    fn apply(&self, batch: Vec<Mutation>) -> Result<()>;

    fn stats(&self) -> Result<SubstrateStats>;
}
