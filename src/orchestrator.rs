//! Top-level flows: remember, recall, answer, todo completion
//!
//! The orchestrator is the only layer that talks to the oracles. It turns
//! raw text into an extraction, resolves each extracted mention through
//! disambiguation, and hands a fully decided write to the memory store.
//! Transient oracle failures are retried once; ambiguity is surfaced to
//! the caller rather than guessed at.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::entity_store::{EntityStore, Resolution, ResolvedCandidate};
use crate::errors::{Error, Result};
use crate::memory_store::{EntityRef, MemoryStore, NewMemory};
use crate::model::{
    normalize_name, Entity, EntityId, EntityType, EntityVersion, MemoryId, MemoryMetadata,
    TodoStatus,
};
use crate::oracle::{retry_transient, Disambiguator, Embedder, Extractor};
use crate::retrieval::{RetrievalEngine, ScoredMemory};
use crate::similarity::cosine_similarity;
use crate::substrate::{RocksSubstrate, Substrate, SubstrateStats};

/// A synthesized answer with the memories that back it.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<ScoredMemory>,
}

pub struct Orchestrator {
    substrate: Arc<dyn Substrate>,
    entities: EntityStore,
    memories: MemoryStore,
    retrieval: RetrievalEngine,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    disambiguator: Arc<dyn Disambiguator>,
    default_recall_k: usize,
    retry_backoff_ms: u64,
    embedding_dim: usize,
}

impl Orchestrator {
    /// Open the store at `config.storage_path` and wire the oracles to it.
    pub fn open(
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        disambiguator: Arc<dyn Disambiguator>,
        config: &StoreConfig,
    ) -> Result<Self> {
        let substrate = Arc::new(RocksSubstrate::open(&config.storage_path)?);
        Ok(Self::new(substrate, extractor, embedder, disambiguator, config))
    }

    pub fn new(
        substrate: Arc<dyn Substrate>,
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        disambiguator: Arc<dyn Disambiguator>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            entities: EntityStore::new(substrate.clone(), config),
            memories: MemoryStore::new(substrate.clone(), config),
            retrieval: RetrievalEngine::new(substrate.clone(), config),
            substrate,
            extractor,
            embedder,
            disambiguator,
            default_recall_k: config.default_recall_k,
            retry_backoff_ms: config.retry_backoff_ms,
            embedding_dim: config.embedding_dim,
        }
    }

    /// Reject an embedding whose dimensionality disagrees with the
    /// configured one before it can poison the vector index.
    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            return Err(Error::Validation {
                field: "embedding".to_string(),
                reason: format!(
                    "embedder returned {} dimensions, expected {}",
                    embedding.len(),
                    self.embedding_dim
                ),
            });
        }
        Ok(())
    }

    /// Ingest one observation end to end: extract, embed, resolve every
    /// mention, commit atomically, then apply any extracted property
    /// updates as versioned follow-ups. Errors with `AmbiguousEntity`
    /// before anything is written when a mention cannot be settled.
    pub fn remember(&self, text: &str) -> Result<MemoryId> {
        let extraction =
            retry_transient("extraction", self.retry_backoff_ms, || {
                self.extractor.extract(text)
            })?;
        let embedding = retry_transient("content embedding", self.retry_backoff_ms, || {
            self.embedder.embed(text)
        })?;
        self.check_dim(&embedding)?;

        let mut mentions = Vec::with_capacity(extraction.entities.len());
        for extracted in &extraction.entities {
            let candidates = self.entities.resolve(&extracted.name, extracted.entity_type)?;
            let surrounding = extracted.context.as_deref().unwrap_or(text);
            let resolution = self.entities.disambiguate(
                &extracted.name,
                extracted.entity_type,
                surrounding,
                &candidates,
                self.disambiguator.as_ref(),
            )?;
            let resolved = match resolution {
                Resolution::Resolved(id) => Some(id),
                Resolution::NewEntity => None,
                Resolution::Ambiguous(candidates) => {
                    return Err(Error::AmbiguousEntity {
                        name: extracted.name.clone(),
                        candidates: candidates.iter().map(ResolvedCandidate::brief).collect(),
                    });
                }
            };
            mentions.push(EntityRef {
                name: extracted.name.clone(),
                entity_type: extracted.entity_type,
                resolved,
            });
        }

        let mut questions = Vec::with_capacity(extraction.hypothetical_questions.len());
        for question in &extraction.hypothetical_questions {
            let embedding = retry_transient("question embedding", self.retry_backoff_ms, || {
                self.embedder.embed(question)
            })?;
            self.check_dim(&embedding)?;
            questions.push((question.clone(), embedding));
        }

        let draft = NewMemory {
            content: text.to_string(),
            summary: extraction.summary,
            memory_type: extraction.memory_type,
            embedding,
            metadata: MemoryMetadata {
                location: extraction.metadata.location,
                activity: extraction.metadata.activity,
                sentiment: extraction.metadata.sentiment,
                time_of_day: extraction.temporal.time_of_day,
            },
            temporal_references: extraction.temporal.references,
        };

        let memory_id =
            self.memories
                .remember(draft, mentions, extraction.relationships, questions)?;

        // Property updates ride after the commit so a conflicting update
        // never rolls back the observation itself.
        for update in extraction.property_updates {
            if let Err(e) = self.apply_property_update(&update.entity_name, update.updates) {
                warn!("property update for '{}' skipped: {e}", update.entity_name);
            }
        }

        info!("remembered '{}' as {memory_id}", truncate(text, 60));
        Ok(memory_id)
    }

    fn apply_property_update(
        &self,
        entity_name: &str,
        updates: HashMap<String, String>,
    ) -> Result<()> {
        let normalized = normalize_name(entity_name);
        for entity_type in EntityType::all() {
            if let Some(id) = self.substrate.entity_id_by_key(entity_type, &normalized)? {
                let Some(entity) = self.substrate.get_entity(&id)? else {
                    continue;
                };
                self.entities
                    .update_properties(&id, updates, entity.version)?;
                return Ok(());
            }
        }
        Err(Error::EntityNotFound(entity_name.to_string()))
    }

    /// Retrieve the memories most relevant to a natural-language query.
    pub fn recall(&self, query: &str, k: usize, use_graph_expansion: bool) -> Result<Vec<ScoredMemory>> {
        let embedding = retry_transient("query embedding", self.retry_backoff_ms, || {
            self.embedder.embed(query)
        })?;
        self.check_dim(&embedding)?;
        if use_graph_expansion {
            self.retrieval.hybrid_search(&embedding, k)
        } else {
            self.retrieval.vector_search(&embedding, k)
        }
    }

    /// Recall plus a deterministic synthesis of the top hits. No oracle is
    /// consulted for the answer text; it is assembled from stored
    /// summaries.
    pub fn answer(&self, query: &str, k: Option<usize>) -> Result<Answer> {
        let sources = self.recall(query, k.unwrap_or(self.default_recall_k), true)?;
        let text = if sources.is_empty() {
            "No memories match that question yet.".to_string()
        } else {
            sources
                .iter()
                .take(3)
                .map(|s| s.memory.summary.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };
        Ok(Answer { text, sources })
    }

    /// Complete the open todo best matching a natural-language description.
    /// Ranks within the open todos themselves, so nearby non-todo memories
    /// can never crowd a matching todo out of consideration. Errors with
    /// `MemoryNotFound` when no open todo is similar enough.
    pub fn mark_todo_done(&self, description: &str, resolution: Option<String>) -> Result<MemoryId> {
        let embedding = retry_transient("todo embedding", self.retry_backoff_ms, || {
            self.embedder.embed(description)
        })?;
        self.check_dim(&embedding)?;

        let hit = self
            .substrate
            .open_todos()?
            .into_iter()
            .map(|todo| {
                let score = cosine_similarity(&embedding, &todo.embedding);
                (todo, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((todo, score)) = hit else {
            return Err(Error::MemoryNotFound(format!(
                "no open todo matches '{description}'"
            )));
        };

        let id = todo.id;
        debug!("todo '{}' matched {id} at {score:.3}", description);
        self.memories
            .set_todo_status(&id, TodoStatus::Done, resolution)?;
        Ok(id)
    }

    // --- direct graph operations ---

    pub fn merge_entities(&self, keep: &EntityId, remove: &EntityId) -> Result<()> {
        self.entities.merge_entities(keep, remove)
    }

    pub fn update_entity_properties(
        &self,
        id: &EntityId,
        updates: HashMap<String, String>,
        expected_version: u64,
    ) -> Result<u64> {
        self.entities.update_properties(id, updates, expected_version)
    }

    pub fn get_entity_history(
        &self,
        id: &EntityId,
        limit: usize,
    ) -> Result<(Entity, Vec<EntityVersion>)> {
        self.entities.get_history(id, limit)
    }

    pub fn find_similar_entities(
        &self,
        name: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<ResolvedCandidate>> {
        self.retrieval.find_similar_entities(name, entity_type, limit)
    }

    pub fn stats(&self) -> Result<SubstrateStats> {
        self.substrate.stats()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
