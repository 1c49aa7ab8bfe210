//! Memory ingestion and the todo lifecycle
//!
//! `remember` is the single multi-statement write of the system: the
//! memory record, its mention edges, any newly created entities, typed
//! relationships, and pre-embedded hypothetical questions all land in one
//! atomic substrate batch. Either the whole observation commits or none
//! of it does.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::constants::MAX_HYPOTHETICAL_QUESTIONS;
use crate::entity_store::EntityStore;
use crate::errors::{Error, Result};
use crate::model::{
    normalize_name, EntityId, EntityType, HypotheticalQuestion, Memory, MemoryId, MemoryMetadata,
    MemoryType, MentionEdge, Relationship, TodoStatus,
};
use crate::oracle::ExtractedRelationship;
use crate::substrate::{Mutation, Substrate, TxBatch};

/// One entity a new memory mentions. `resolved` carries an id when
/// disambiguation already settled the identity; otherwise the store
/// upserts by (name, type).
#[derive(Debug, Clone)]
pub struct EntityRef {
    pub name: String,
    pub entity_type: EntityType,
    pub resolved: Option<EntityId>,
}

/// Draft of a memory before it gets an id and a timestamp.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub summary: String,
    pub memory_type: MemoryType,
    pub embedding: Vec<f32>,
    pub metadata: MemoryMetadata,
    pub temporal_references: Vec<String>,
}

/// Ingestion and todo state transitions.
pub struct MemoryStore {
    substrate: Arc<dyn Substrate>,
    entities: EntityStore,
}

impl MemoryStore {
    pub fn new(substrate: Arc<dyn Substrate>, config: &StoreConfig) -> Self {
        let entities = EntityStore::new(substrate.clone(), config);
        Self { substrate, entities }
    }

    /// Persist one observation atomically: the memory, one mention edge per
    /// entity reference (entities upserted as needed), relationship edges
    /// resolved by name, and up to [`MAX_HYPOTHETICAL_QUESTIONS`] embedded
    /// questions. Returns the new memory's id.
    pub fn remember(
        &self,
        draft: NewMemory,
        mentions: Vec<EntityRef>,
        relationships: Vec<ExtractedRelationship>,
        questions: Vec<(String, Vec<f32>)>,
    ) -> Result<MemoryId> {
        if draft.content.trim().is_empty() {
            return Err(Error::Validation {
                field: "content".to_string(),
                reason: "memory content cannot be empty".to_string(),
            });
        }

        let memory_id = MemoryId(Uuid::new_v4());
        let status = match draft.memory_type {
            MemoryType::Todo => Some(TodoStatus::Open),
            _ => None,
        };

        let mut tx = TxBatch::new();
        tx.push(Mutation::PutMemory(Memory {
            id: memory_id,
            content: draft.content,
            summary: draft.summary,
            memory_type: draft.memory_type,
            timestamp: Utc::now(),
            embedding: draft.embedding,
            metadata: draft.metadata,
            temporal_references: draft.temporal_references,
            status,
            resolution_summary: None,
            resolved_at: None,
        }));

        // Names settled in this batch, for relationship endpoint lookup.
        let mut resolved: HashMap<String, EntityId> = HashMap::new();

        for mention in mentions {
            let entity_id = match mention.resolved {
                Some(id) => {
                    // Latest-seen casing wins, but only when the mention is
                    // the entity's own name, not an alias or partial.
                    if let Some(mut entity) = self.substrate.get_entity(&id)? {
                        if entity.normalized_name == normalize_name(&mention.name)
                            && entity.display_name != mention.name
                        {
                            entity.display_name = mention.name.clone();
                            tx.push(Mutation::PutEntity(entity));
                        }
                    }
                    id
                }
                None => self
                    .entities
                    .stage_upsert(&mention.name, mention.entity_type, &mut tx)?,
            };
            resolved.insert(normalize_name(&mention.name), entity_id);
            tx.push(Mutation::PutMention(MentionEdge {
                id: Uuid::new_v4(),
                memory_id,
                entity_id,
            }));
        }

        for rel in relationships {
            let (Some(from), Some(to)) = (
                self.endpoint(&rel.from, &resolved, &tx)?,
                self.endpoint(&rel.to, &resolved, &tx)?,
            ) else {
                warn!(
                    "dropping {} edge '{}' -> '{}': endpoint did not resolve",
                    rel.relation_type.as_str(),
                    rel.from,
                    rel.to
                );
                continue;
            };
            if from == to {
                continue;
            }

            let now = Utc::now();
            let edge = match self.substrate.get_relationship(&from, &to, rel.relation_type)? {
                // Re-observation refreshes recency only.
                Some(existing) => Relationship {
                    last_seen: now,
                    ..existing
                },
                None => Relationship {
                    from,
                    to,
                    relation_type: rel.relation_type,
                    context: rel.context,
                    first_seen: now,
                    last_seen: now,
                },
            };
            tx.push(Mutation::PutRelationship(edge));
        }

        for (question, embedding) in questions.into_iter().take(MAX_HYPOTHETICAL_QUESTIONS) {
            tx.push(Mutation::PutQuestion(HypotheticalQuestion {
                id: Uuid::new_v4(),
                memory_id,
                question,
                embedding,
            }));
        }

        self.substrate.apply(tx.into_mutations())?;
        debug!("remembered memory {memory_id}");
        Ok(memory_id)
    }

    /// Resolve a relationship endpoint name: first against entities settled
    /// in this batch, then against stored keys across all types.
    fn endpoint(
        &self,
        name: &str,
        resolved: &HashMap<String, EntityId>,
        tx: &TxBatch,
    ) -> Result<Option<EntityId>> {
        let normalized = normalize_name(name);
        if let Some(id) = resolved.get(&normalized) {
            return Ok(Some(*id));
        }

        let mut hits: Vec<EntityId> = Vec::new();
        for entity_type in EntityType::all() {
            if let Some(id) = tx.staged_entity(entity_type, &normalized) {
                hits.push(id);
                continue;
            }
            if let Some(id) = self.substrate.entity_id_by_key(entity_type, &normalized)? {
                hits.push(id);
            }
        }
        if hits.len() > 1 {
            warn!("relationship endpoint '{name}' matches {} types, using first", hits.len());
        }
        Ok(hits.into_iter().next())
    }

    /// Transition a todo memory's lifecycle. Open → Done stamps
    /// `resolved_at` once; Done → Done is an idempotent no-op; reopening is
    /// rejected.
    pub fn set_todo_status(
        &self,
        id: &MemoryId,
        status: TodoStatus,
        resolution: Option<String>,
    ) -> Result<()> {
        let Some(mut memory) = self.substrate.get_memory(id)? else {
            return Err(Error::MemoryNotFound(id.to_string()));
        };
        if memory.memory_type != MemoryType::Todo {
            return Err(Error::Validation {
                field: "memory_id".to_string(),
                reason: format!("memory {id} is not a todo"),
            });
        }

        match (memory.status, status) {
            (Some(TodoStatus::Done), TodoStatus::Done) => return Ok(()),
            (Some(TodoStatus::Done), TodoStatus::Open) => {
                return Err(Error::Validation {
                    field: "status".to_string(),
                    reason: "a completed todo cannot be reopened".to_string(),
                });
            }
            _ => {}
        }

        memory.status = Some(status);
        if status == TodoStatus::Done {
            memory.resolved_at = Some(Utc::now());
            memory.resolution_summary = resolution;
        }
        self.substrate.apply(vec![Mutation::PutMemory(memory)])?;
        debug!("todo {id} marked {status:?}");
        Ok(())
    }
}
