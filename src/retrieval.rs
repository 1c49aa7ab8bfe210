//! Hybrid retrieval: vector search, graph expansion, entity similarity
//!
//! Vector seeds come from two indexes (memory embeddings and hypothetical
//! questions) merged by parent memory. Graph expansion walks mention edges
//! from the seeds to pull in memories that share entities with them, at a
//! discounted score, so directly relevant memories always outrank
//! graph-only neighbors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::constants::{NEIGHBOR_SCORE_CEILING, NEIGHBOR_SHARE_SATURATION};
use crate::entity_store::{EntityStore, ResolvedCandidate};
use crate::errors::{Error, Result};
use crate::model::{EntityType, Memory, MemoryId};
use crate::substrate::Substrate;

/// One retrieval hit.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

pub struct RetrievalEngine {
    substrate: Arc<dyn Substrate>,
    entities: EntityStore,
    expansion_neighbor_limit: usize,
}

impl RetrievalEngine {
    pub fn new(substrate: Arc<dyn Substrate>, config: &StoreConfig) -> Self {
        let entities = EntityStore::new(substrate.clone(), config);
        Self {
            substrate,
            entities,
            expansion_neighbor_limit: config.expansion_neighbor_limit,
        }
    }

    /// Top-k memories by cosine similarity against both vector indexes,
    /// deduplicated by memory keeping the better score. A store with no
    /// embeddings at all degrades to the k most recent memories at score
    /// zero rather than failing an empty-store recall.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredMemory>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let memory_hits = match self.substrate.memory_vector_search(query, k) {
            Ok(hits) => hits,
            Err(Error::IndexUnavailable(reason)) => {
                debug!("vector index unavailable ({reason}), recency fallback");
                return Ok(self
                    .substrate
                    .recent_memories(k)?
                    .into_iter()
                    .map(|memory| ScoredMemory { memory, score: 0.0 })
                    .collect());
            }
            Err(e) => return Err(e),
        };

        let mut best: HashMap<MemoryId, f32> = HashMap::new();
        for (id, score) in memory_hits
            .into_iter()
            .chain(self.substrate.question_vector_search(query, k)?)
        {
            let entry = best.entry(id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }

        let mut ranked: Vec<(MemoryId, f32)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        self.hydrate(ranked)
    }

    /// Vector seeds plus graph expansion. Seeds are re-scored by rank
    /// (1 - i/n) so expansion scores compose with them on one scale;
    /// neighbors score by how many entities they share with their seed,
    /// saturating well below any seed's score. A memory reached both ways
    /// keeps its seed score.
    pub fn hybrid_search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredMemory>> {
        let seeds = self.vector_search(query, k)?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let n = seeds.len();
        let mut scores: HashMap<MemoryId, f32> = HashMap::new();
        let mut seed_ids: HashSet<MemoryId> = HashSet::new();
        let mut order: Vec<MemoryId> = Vec::new();
        let mut memories: HashMap<MemoryId, Memory> = HashMap::new();

        for (i, seed) in seeds.iter().enumerate() {
            let rank_score = 1.0 - i as f32 / n as f32;
            scores.insert(seed.memory.id, rank_score);
            seed_ids.insert(seed.memory.id);
            order.push(seed.memory.id);
            memories.insert(seed.memory.id, seed.memory.clone());
        }

        for seed in &seeds {
            // Count shared entities per neighboring memory.
            let mut shared: HashMap<MemoryId, usize> = HashMap::new();
            for entity_id in self.substrate.mentions_of_memory(&seed.memory.id)? {
                for neighbor in self.substrate.memories_mentioning(&entity_id)? {
                    if neighbor != seed.memory.id {
                        *shared.entry(neighbor).or_insert(0) += 1;
                    }
                }
            }

            let mut neighbors: Vec<(MemoryId, usize)> = shared.into_iter().collect();
            neighbors.sort_by(|a, b| b.1.cmp(&a.1));
            neighbors.truncate(self.expansion_neighbor_limit);

            for (neighbor, count) in neighbors {
                // Seed hits are authoritative; expansion never overrides.
                if seed_ids.contains(&neighbor) {
                    continue;
                }
                let score = (count as f32 / NEIGHBOR_SHARE_SATURATION).min(1.0)
                    * NEIGHBOR_SCORE_CEILING;
                match scores.get_mut(&neighbor) {
                    Some(existing) => {
                        if score > *existing {
                            *existing = score;
                        }
                    }
                    None => {
                        scores.insert(neighbor, score);
                        order.push(neighbor);
                    }
                }
            }
        }

        // Stable sort on first-discovery order keeps seed ranking intact
        // among equal scores.
        let mut ranked: Vec<(MemoryId, f32)> = order
            .into_iter()
            .map(|id| (id, scores[&id]))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);

        let mut results = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            let memory = match memories.remove(&id) {
                Some(memory) => memory,
                None => match self.substrate.get_memory(&id)? {
                    Some(memory) => memory,
                    None => {
                        warn!("expansion reached dangling memory {id}");
                        continue;
                    }
                },
            };
            results.push(ScoredMemory { memory, score });
        }
        Ok(results)
    }

    /// Entities matching a name, exact first, fuzzy after.
    pub fn find_similar_entities(
        &self,
        name: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<ResolvedCandidate>> {
        let mut candidates: Vec<ResolvedCandidate> = Vec::new();
        let types: Vec<EntityType> = match entity_type {
            Some(t) => vec![t],
            None => EntityType::all().to_vec(),
        };

        for t in types {
            for candidate in self.entities.resolve(name, t)? {
                if !candidates.iter().any(|c| c.id == candidate.id) {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn hydrate(&self, ranked: Vec<(MemoryId, f32)>) -> Result<Vec<ScoredMemory>> {
        let mut results = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            match self.substrate.get_memory(&id)? {
                Some(memory) => results.push(ScoredMemory { memory, score }),
                None => warn!("vector index hit dangling memory {id}"),
            }
        }
        Ok(results)
    }
}
