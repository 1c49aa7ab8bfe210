//! Embedded substrate: RocksDB + tantivy
//!
//! Reference implementation of the [`Substrate`] port. One RocksDB keyspace
//! with prefix namespaces so a whole logical transaction fits in a single
//! `WriteBatch`, plus a tantivy index over entity names and aliases for the
//! token-level fuzzy lookup. Vector top-k is a cosine scan over stored
//! embeddings; a backend with a real ANN index can replace this struct
//! without touching the stores.
//!
//! Key layout (all ids are 16 raw UUID bytes):
//! ```text
//! ent:<id>                    -> Entity (bincode)
//! ekey:<type_tag><normalized> -> entity id
//! ver:<id><version be64>      -> EntityVersion
//! mem:<id>                    -> Memory
//! mnt:<mem><ent><edge>        -> ()   mention, forward
//! mre:<ent><mem><edge>        -> ()   mention, reverse
//! rel:<from><to><type_tag>    -> Relationship
//! rin:<to><from><type_tag>    -> ()   relationship, reverse
//! hq:<id>                     -> HypotheticalQuestion
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use rust_stemmers::{Algorithm, Stemmer};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Mutation, Substrate, SubstrateStats};
use crate::constants::{FUZZY_OVERFETCH, FUZZY_SCORE_SCALE, NAME_INDEX_WRITER_HEAP};
use crate::errors::{Error, Result};
use crate::model::{
    Entity, EntityId, EntityType, EntityVersion, HypotheticalQuestion, Memory, MemoryId,
    MemoryType, MentionEdge, Relationship, RelationType, TodoStatus,
};
use crate::similarity::cosine_similarity;

const P_ENTITY: &[u8] = b"ent:";
const P_ENTITY_KEY: &[u8] = b"ekey:";
const P_VERSION: &[u8] = b"ver:";
const P_MEMORY: &[u8] = b"mem:";
const P_MENTION_FWD: &[u8] = b"mnt:";
const P_MENTION_REV: &[u8] = b"mre:";
const P_REL: &[u8] = b"rel:";
const P_REL_REV: &[u8] = b"rin:";
const P_QUESTION: &[u8] = b"hq:";

/// Pending change to the tantivy name index, applied after the RocksDB
/// batch commits.
enum NameIndexOp {
    Upsert { id: EntityId, text: String },
    Delete(EntityId),
}

/// RocksDB-backed substrate with a tantivy fuzzy name index.
pub struct RocksSubstrate {
    db: Arc<DB>,
    name_index: Index,
    name_reader: IndexReader,
    name_writer: Arc<RwLock<IndexWriter>>,
    id_field: Field,
    names_field: Field,
}

impl RocksSubstrate {
    /// Open or create the substrate under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("create {path:?}: {e}")))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = Arc::new(DB::open(&opts, path.join("graph"))?);

        let index_path = path.join("name_index");
        std::fs::create_dir_all(&index_path)
            .map_err(|e| Error::Storage(format!("create {index_path:?}: {e}")))?;

        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let names_field = schema_builder.add_text_field("names", TEXT);
        let schema = schema_builder.build();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)
            .map_err(|e| Error::Storage(format!("open name index dir: {e}")))?;
        let name_index = if Index::exists(&dir)
            .map_err(|e| Error::Storage(format!("check name index: {e}")))?
        {
            Index::open(dir)?
        } else {
            Index::create_in_dir(&index_path, schema)?
        };

        let name_writer = name_index.writer(NAME_INDEX_WRITER_HEAP)?;
        let name_reader = name_index
            .reader_builder()
            .reload_policy(tantivy::ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        info!("Substrate opened at {:?}", path);

        Ok(Self {
            db,
            name_index,
            name_reader,
            name_writer: Arc::new(RwLock::new(name_writer)),
            id_field,
            names_field,
        })
    }

    fn get_decoded<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.db.get(key)? {
            Some(value) => {
                let (decoded, _): (T, _) =
                    bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?)
    }

    /// Iterate all values under a namespace prefix.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Box<[u8]>, Box<[u8]>)> {
        let mut out = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix,
            rocksdb::Direction::Forward,
        ));
        for (key, value) in iter.flatten() {
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        out
    }

    fn count_prefix(&self, prefix: &[u8]) -> usize {
        self.scan_prefix(prefix).len()
    }

    /// Searchable text for an entity: display name plus aliases, with
    /// stemmed token variants appended so inflected forms still match.
    fn entity_index_text(entity: &Entity) -> String {
        let stemmer = Stemmer::create(Algorithm::English);
        let mut parts: Vec<String> = Vec::new();
        parts.push(entity.display_name.clone());
        parts.extend(entity.aliases.iter().cloned());
        let stemmed: Vec<String> = parts
            .iter()
            .flat_map(|p| p.split_whitespace())
            .map(|w| stemmer.stem(&w.to_lowercase()).to_string())
            .collect();
        parts.extend(stemmed);
        parts.join(" ")
    }

    /// Stemmed lowercase tokens of a name, for overlap scoring.
    fn stem_tokens(name: &str) -> Vec<String> {
        let stemmer = Stemmer::create(Algorithm::English);
        name.split_whitespace()
            .map(|w| {
                let clean: String = w.chars().filter(|c| c.is_alphanumeric()).collect();
                stemmer.stem(&clean.to_lowercase()).to_string()
            })
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Token-set Jaccard overlap between a query and one candidate name.
    fn token_overlap(query_tokens: &[String], candidate: &str) -> f32 {
        let candidate_tokens = Self::stem_tokens(candidate);
        if query_tokens.is_empty() || candidate_tokens.is_empty() {
            return 0.0;
        }
        let shared = query_tokens
            .iter()
            .filter(|t| candidate_tokens.contains(t))
            .count();
        let union = query_tokens.len() + candidate_tokens.len() - shared;
        if union == 0 {
            return 0.0;
        }
        shared as f32 / union as f32
    }

    /// Best fuzzy score for an entity against query tokens, over its
    /// display name and every alias. Scaled so it stays below exact (1.0).
    fn fuzzy_score(entity: &Entity, query_tokens: &[String]) -> f32 {
        let mut best = Self::token_overlap(query_tokens, &entity.display_name);
        for alias in &entity.aliases {
            let score = Self::token_overlap(query_tokens, alias);
            if score > best {
                best = score;
            }
        }
        best * FUZZY_SCORE_SCALE
    }

    fn apply_name_index_ops(&self, ops: Vec<NameIndexOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        {
            let mut writer = self.name_writer.write();
            for op in ops {
                match op {
                    NameIndexOp::Upsert { id, text } => {
                        let id_str = id.0.to_string();
                        writer.delete_term(Term::from_field_text(self.id_field, &id_str));
                        let mut doc = TantivyDocument::new();
                        doc.add_text(self.id_field, &id_str);
                        doc.add_text(self.names_field, &text);
                        writer.add_document(doc)?;
                    }
                    NameIndexOp::Delete(id) => {
                        writer
                            .delete_term(Term::from_field_text(self.id_field, &id.0.to_string()));
                    }
                }
            }
            writer.commit()?;
        }
        self.name_reader.reload()?;
        Ok(())
    }
}

fn key_entity(id: &EntityId) -> Vec<u8> {
    [P_ENTITY, id.0.as_bytes()].concat()
}

fn key_entity_key(entity_type: EntityType, normalized: &str) -> Vec<u8> {
    [P_ENTITY_KEY, &[entity_type.tag()], normalized.as_bytes()].concat()
}

fn key_version(id: &EntityId, version: u64) -> Vec<u8> {
    [P_VERSION, id.0.as_bytes(), &version.to_be_bytes()].concat()
}

fn key_memory(id: &MemoryId) -> Vec<u8> {
    [P_MEMORY, id.0.as_bytes()].concat()
}

fn key_mention_fwd(edge: &MentionEdge) -> Vec<u8> {
    [
        P_MENTION_FWD,
        edge.memory_id.0.as_bytes(),
        edge.entity_id.0.as_bytes(),
        edge.id.as_bytes(),
    ]
    .concat()
}

fn key_mention_rev(edge: &MentionEdge) -> Vec<u8> {
    [
        P_MENTION_REV,
        edge.entity_id.0.as_bytes(),
        edge.memory_id.0.as_bytes(),
        edge.id.as_bytes(),
    ]
    .concat()
}

fn key_rel(from: &EntityId, to: &EntityId, relation_type: RelationType) -> Vec<u8> {
    [
        P_REL,
        from.0.as_bytes(),
        to.0.as_bytes(),
        &[relation_type.tag()],
    ]
    .concat()
}

fn key_rel_rev(from: &EntityId, to: &EntityId, relation_type: RelationType) -> Vec<u8> {
    [
        P_REL_REV,
        to.0.as_bytes(),
        from.0.as_bytes(),
        &[relation_type.tag()],
    ]
    .concat()
}

fn key_question(id: &Uuid) -> Vec<u8> {
    [P_QUESTION, id.as_bytes()].concat()
}

fn uuid_at(bytes: &[u8], offset: usize) -> Option<Uuid> {
    bytes
        .get(offset..offset + 16)
        .and_then(|s| Uuid::from_slice(s).ok())
}

impl Substrate for RocksSubstrate {
    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.get_decoded(&key_entity(id))
    }

    fn entity_id_by_key(
        &self,
        entity_type: EntityType,
        normalized_name: &str,
    ) -> Result<Option<EntityId>> {
        match self.db.get(key_entity_key(entity_type, normalized_name))? {
            Some(value) => Ok(Uuid::from_slice(&value).ok().map(EntityId)),
            None => Ok(None),
        }
    }

    fn fuzzy_entities(
        &self,
        name: &str,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> Result<Vec<(EntityId, f32)>> {
        let query_tokens = Self::stem_tokens(name);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.name_reader.searcher();
        if searcher.num_docs() == 0 {
            return Ok(Vec::new());
        }

        let query_parser = QueryParser::for_index(&self.name_index, vec![self.names_field]);
        // Sanitized tokens only; QueryParser treats whitespace as OR.
        let query_str = query_tokens.join(" ");
        let parsed = match query_parser.parse_query(&query_str) {
            Ok(q) => q,
            Err(e) => {
                debug!("fuzzy query parse error for '{query_str}': {e}");
                return Ok(Vec::new());
            }
        };

        let top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit * FUZZY_OVERFETCH))?;

        let mut scored: Vec<(EntityId, f32)> = Vec::new();
        for (_tantivy_score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            let Some(id_str) = doc.get_first(self.id_field).and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(uuid) = Uuid::parse_str(id_str) else {
                continue;
            };
            let id = EntityId(uuid);
            let Some(entity) = self.get_entity(&id)? else {
                // Name index can lag one crash behind the keyspace.
                debug!("fuzzy hit {id} has no entity record, skipping");
                continue;
            };
            if let Some(ty) = entity_type {
                if entity.entity_type != ty {
                    continue;
                }
            }
            let score = Self::fuzzy_score(&entity, &query_tokens);
            if score > 0.0 {
                scored.push((id, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    fn get_version(&self, id: &EntityId, version: u64) -> Result<Option<EntityVersion>> {
        self.get_decoded(&key_version(id, version))
    }

    fn get_memory(&self, id: &MemoryId) -> Result<Option<Memory>> {
        self.get_decoded(&key_memory(id))
    }

    fn recent_memories(&self, k: usize) -> Result<Vec<Memory>> {
        let mut memories: Vec<Memory> = Vec::new();
        for (_, value) in self.scan_prefix(P_MEMORY) {
            let (memory, _): (Memory, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            memories.push(memory);
        }
        memories.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        memories.truncate(k);
        Ok(memories)
    }

    fn open_todos(&self) -> Result<Vec<Memory>> {
        let mut todos: Vec<Memory> = Vec::new();
        for (_, value) in self.scan_prefix(P_MEMORY) {
            let (memory, _): (Memory, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            if memory.memory_type == MemoryType::Todo && memory.status == Some(TodoStatus::Open) {
                todos.push(memory);
            }
        }
        Ok(todos)
    }

    fn memory_vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        let mut scored: Vec<(MemoryId, f32)> = Vec::new();
        let mut indexed = 0usize;
        for (_, value) in self.scan_prefix(P_MEMORY) {
            let (memory, _): (Memory, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            // Zero-norm vectors carry no direction; treat them as
            // unindexed so an embedding-free store can be detected.
            if memory.embedding.iter().all(|v| *v == 0.0) {
                continue;
            }
            indexed += 1;
            let score = cosine_similarity(query, &memory.embedding);
            if score > 0.0 {
                scored.push((memory.id, score));
            }
        }
        if indexed == 0 {
            return Err(Error::IndexUnavailable(
                "no memory embeddings stored".to_string(),
            ));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn question_vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        // Multiple questions can point at one memory; keep the best score
        // per parent.
        let mut best: HashMap<MemoryId, f32> = HashMap::new();
        for (_, value) in self.scan_prefix(P_QUESTION) {
            let (question, _): (HypotheticalQuestion, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            if question.embedding.iter().all(|v| *v == 0.0) {
                continue;
            }
            let score = cosine_similarity(query, &question.embedding);
            if score <= 0.0 {
                continue;
            }
            let entry = best.entry(question.memory_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }
        let mut scored: Vec<(MemoryId, f32)> = best.into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn mentions_of_memory(&self, id: &MemoryId) -> Result<Vec<EntityId>> {
        let prefix = [P_MENTION_FWD, id.0.as_bytes()].concat();
        let mut out: Vec<EntityId> = Vec::new();
        for (key, _) in self.scan_prefix(&prefix) {
            if let Some(entity_uuid) = uuid_at(&key, P_MENTION_FWD.len() + 16) {
                let entity_id = EntityId(entity_uuid);
                if !out.contains(&entity_id) {
                    out.push(entity_id);
                }
            }
        }
        Ok(out)
    }

    fn memories_mentioning(&self, id: &EntityId) -> Result<Vec<MemoryId>> {
        let prefix = [P_MENTION_REV, id.0.as_bytes()].concat();
        let mut out: Vec<MemoryId> = Vec::new();
        for (key, _) in self.scan_prefix(&prefix) {
            if let Some(memory_uuid) = uuid_at(&key, P_MENTION_REV.len() + 16) {
                let memory_id = MemoryId(memory_uuid);
                if !out.contains(&memory_id) {
                    out.push(memory_id);
                }
            }
        }
        Ok(out)
    }

    fn mention_edges_of_entity(&self, id: &EntityId) -> Result<Vec<MentionEdge>> {
        let prefix = [P_MENTION_REV, id.0.as_bytes()].concat();
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(&prefix) {
            let base = P_MENTION_REV.len();
            if let (Some(memory_uuid), Some(edge_uuid)) =
                (uuid_at(&key, base + 16), uuid_at(&key, base + 32))
            {
                out.push(MentionEdge {
                    id: edge_uuid,
                    memory_id: MemoryId(memory_uuid),
                    entity_id: *id,
                });
            }
        }
        Ok(out)
    }

    fn relationships_of(&self, id: &EntityId) -> Result<Vec<Relationship>> {
        let mut out: Vec<Relationship> = Vec::new();

        // Outgoing: rel:<id><to><tag>
        let prefix = [P_REL, id.0.as_bytes()].concat();
        for (_, value) in self.scan_prefix(&prefix) {
            let (rel, _): (Relationship, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())?;
            out.push(rel);
        }

        // Incoming via reverse index: rin:<id><from><tag>
        let prefix = [P_REL_REV, id.0.as_bytes()].concat();
        for (key, _) in self.scan_prefix(&prefix) {
            let base = P_REL_REV.len();
            let Some(from_uuid) = uuid_at(&key, base + 16) else {
                continue;
            };
            let Some(&tag) = key.get(base + 32) else {
                continue;
            };
            let Some(relation_type) = RelationType::from_tag(tag) else {
                continue;
            };
            let from = EntityId(from_uuid);
            if from == *id {
                continue; // self-loops already covered by the outgoing scan
            }
            if let Some(rel) = self.get_relationship(&from, id, relation_type)? {
                out.push(rel);
            }
        }

        Ok(out)
    }

    fn get_relationship(
        &self,
        from: &EntityId,
        to: &EntityId,
        relation_type: RelationType,
    ) -> Result<Option<Relationship>> {
        self.get_decoded(&key_rel(from, to, relation_type))
    }

    fn apply(&self, mutations: Vec<Mutation>) -> Result<()> {
        let mut batch = WriteBatch::default();
        let mut index_ops: Vec<NameIndexOp> = Vec::new();

        for mutation in mutations {
            match mutation {
                Mutation::PutEntity(entity) => {
                    batch.put(key_entity(&entity.id), Self::encode(&entity)?);
                    batch.put(
                        key_entity_key(entity.entity_type, &entity.normalized_name),
                        entity.id.0.as_bytes(),
                    );
                    index_ops.push(NameIndexOp::Upsert {
                        id: entity.id,
                        text: Self::entity_index_text(&entity),
                    });
                }
                Mutation::DeleteEntity(id) => {
                    // The record is needed to locate the key-index entry.
                    let Some(entity) = self.get_entity(&id)? else {
                        return Err(Error::EntityNotFound(id.to_string()));
                    };
                    batch.delete(key_entity(&id));
                    batch.delete(key_entity_key(entity.entity_type, &entity.normalized_name));
                    // Version log goes with the entity.
                    let prefix = [P_VERSION, id.0.as_bytes()].concat();
                    for (key, _) in self.scan_prefix(&prefix) {
                        batch.delete(key);
                    }
                    index_ops.push(NameIndexOp::Delete(id));
                }
                Mutation::PutVersion(version) => {
                    batch.put(
                        key_version(&version.entity_id, version.version),
                        Self::encode(&version)?,
                    );
                }
                Mutation::PutMemory(memory) => {
                    batch.put(key_memory(&memory.id), Self::encode(&memory)?);
                }
                Mutation::PutMention(edge) => {
                    batch.put(key_mention_fwd(&edge), b"");
                    batch.put(key_mention_rev(&edge), b"");
                }
                Mutation::DeleteMention(edge) => {
                    batch.delete(key_mention_fwd(&edge));
                    batch.delete(key_mention_rev(&edge));
                }
                Mutation::PutRelationship(rel) => {
                    batch.put(
                        key_rel(&rel.from, &rel.to, rel.relation_type),
                        Self::encode(&rel)?,
                    );
                    batch.put(key_rel_rev(&rel.from, &rel.to, rel.relation_type), b"");
                }
                Mutation::DeleteRelationship {
                    from,
                    to,
                    relation_type,
                } => {
                    batch.delete(key_rel(&from, &to, relation_type));
                    batch.delete(key_rel_rev(&from, &to, relation_type));
                }
                Mutation::PutQuestion(question) => {
                    batch.put(key_question(&question.id), Self::encode(&question)?);
                }
            }
        }

        self.db.write(batch)?;

        // Name index follows the committed batch. A crash here leaves the
        // fuzzy index stale for at most one entity; exact-key resolution
        // reads the keyspace and is unaffected.
        self.apply_name_index_ops(index_ops)?;

        Ok(())
    }

    fn stats(&self) -> Result<SubstrateStats> {
        Ok(SubstrateStats {
            entities: self.count_prefix(P_ENTITY),
            memories: self.count_prefix(P_MEMORY),
            relationships: self.count_prefix(P_REL),
            questions: self.count_prefix(P_QUESTION),
        })
    }
}
