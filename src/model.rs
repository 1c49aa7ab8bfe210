//! Data model for the knowledge-graph memory store
//!
//! Memories are immutable observations (except todo status fields). Entities
//! are deduplicated, versioned concepts keyed by (normalized name, type).
//! Edges link memories to entities (MENTIONS) and entities to each other
//! (typed relationships, upserted on their natural key).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)] // Serialize as plain UUID string, not array
pub struct MemoryId(pub Uuid);

/// Unique identifier for entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of observation a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Todo,
    Reflection,
}

/// Todo lifecycle. Open → Done is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    Open,
    Done,
}

/// Optional situational metadata captured at remember time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetadata {
    pub location: Option<String>,
    pub activity: Option<String>,
    pub sentiment: Option<String>,
    pub time_of_day: Option<String>,
}

/// A stored observation with its embedding.
///
/// Immutable after creation except `status`, `resolution_summary`, and
/// `resolved_at`, which exist only for todo memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub content: String,
    pub summary: String,
    pub memory_type: MemoryType,
    pub timestamp: DateTime<Utc>,

    /// Fixed-dimension embedding. Empty means "not vector-indexed".
    pub embedding: Vec<f32>,

    #[serde(default)]
    pub metadata: MemoryMetadata,

    /// Raw temporal phrases the extractor found ("yesterday", "last week").
    #[serde(default)]
    pub temporal_references: Vec<String>,

    /// Present for todo memories only.
    pub status: Option<TodoStatus>,
    pub resolution_summary: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Entity categories. Part of the dedup key alongside the normalized name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Place,
    Concept,
    Organization,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Place => "place",
            Self::Concept => "concept",
            Self::Organization => "organization",
        }
    }

    /// Stable single-byte tag used in substrate keys.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Person => 0,
            Self::Place => 1,
            Self::Concept => 2,
            Self::Organization => 3,
        }
    }

    pub fn all() -> [EntityType; 4] {
        [Self::Person, Self::Place, Self::Concept, Self::Organization]
    }
}

/// A named, deduplicated concept with versioned properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    /// Latest-seen casing of the name (last-write-wins on re-observation).
    pub display_name: String,

    /// Case/whitespace-folded dedup key. See [`normalize_name`].
    pub normalized_name: String,

    pub entity_type: EntityType,

    /// Alternate names folded in by merges. Ordered, deduplicated by
    /// normalized form, original casing preserved for display.
    pub aliases: Vec<String>,

    pub properties: HashMap<String, String>,

    /// Starts at 0; bumps by exactly 1 per successful property update.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// True if `name` matches this entity's name or any alias after
    /// normalization.
    pub fn answers_to(&self, name: &str) -> bool {
        let normalized = normalize_name(name);
        self.normalized_name == normalized
            || self.aliases.iter().any(|a| normalize_name(a) == normalized)
    }
}

/// Immutable snapshot of an entity's state immediately *before* a property
/// update. The append-only log keyed (entity_id, version) is the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityVersion {
    pub entity_id: EntityId,
    pub version: u64,
    pub name: String,
    pub properties: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Typed, directed relationship between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    Knows,
    WorksAt,
    LivesIn,
    Visited,
    RelatedTo,
    PartOf,
    MentionedWith,
    Likes,
    Dislikes,
    Prefers,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knows => "KNOWS",
            Self::WorksAt => "WORKS_AT",
            Self::LivesIn => "LIVES_IN",
            Self::Visited => "VISITED",
            Self::RelatedTo => "RELATED_TO",
            Self::PartOf => "PART_OF",
            Self::MentionedWith => "MENTIONED_WITH",
            Self::Likes => "LIKES",
            Self::Dislikes => "DISLIKES",
            Self::Prefers => "PREFERS",
        }
    }

    /// Stable single-byte tag used in substrate keys.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Knows => 0,
            Self::WorksAt => 1,
            Self::LivesIn => 2,
            Self::Visited => 3,
            Self::RelatedTo => 4,
            Self::PartOf => 5,
            Self::MentionedWith => 6,
            Self::Likes => 7,
            Self::Dislikes => 8,
            Self::Prefers => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Knows,
            1 => Self::WorksAt,
            2 => Self::LivesIn,
            3 => Self::Visited,
            4 => Self::RelatedTo,
            5 => Self::PartOf,
            6 => Self::MentionedWith,
            7 => Self::Likes,
            8 => Self::Dislikes,
            9 => Self::Prefers,
            _ => return None,
        })
    }
}

/// Relationship edge, upserted on the (from, to, type) natural key.
/// Re-observation refreshes `last_seen` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from: EntityId,
    pub to: EntityId,
    pub relation_type: RelationType,
    pub context: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Memory → Entity mention. Non-unique per (memory, entity) pair; derived
/// counts must traverse DISTINCT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionEdge {
    pub id: Uuid,
    pub memory_id: MemoryId,
    pub entity_id: EntityId,
}

/// Pre-embedded question a memory could answer. Widens retrieval recall;
/// hits resolve back to the parent memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypotheticalQuestion {
    pub id: Uuid,
    pub memory_id: MemoryId,
    pub question: String,
    pub embedding: Vec<f32>,
}

/// Canonical name fold used as the dedup key: lowercase, trim, collapse
/// internal whitespace. Applied uniformly in resolve, upsert, alias dedup,
/// and merge.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
