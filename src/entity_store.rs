//! Entity identity, versioning, and merge
//!
//! Entities are deduplicated on (normalized name, type). Property updates
//! are copy-on-write: the pre-update state is snapshotted into an
//! append-only version log before the new version is written, under an
//! optimistic expected-version check. Merge is destructive and one-way:
//! the removed entity's edges are re-pointed, its names become aliases of
//! the kept entity, and the node is deleted.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::errors::{CandidateBrief, Error, Result};
use crate::model::{normalize_name, Entity, EntityId, EntityType, EntityVersion, Relationship};
use crate::oracle::{Confidence, Disambiguator};
use crate::substrate::{Mutation, Substrate, TxBatch};

/// One ranked match from identity resolution.
#[derive(Debug, Clone)]
pub struct ResolvedCandidate {
    pub id: EntityId,
    pub entity: Entity,
    pub score: f32,
}

impl ResolvedCandidate {
    pub fn brief(&self) -> CandidateBrief {
        CandidateBrief {
            id: self.id,
            display_name: self.entity.display_name.clone(),
            score: self.score,
        }
    }
}

/// Outcome of resolving one extracted mention, decided before any store
/// mutation happens.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The mention refers to this existing entity.
    Resolved(EntityId),
    /// The mention is a brand-new entity.
    NewEntity,
    /// Inconclusive; surfaced to the caller for manual choice.
    Ambiguous(Vec<ResolvedCandidate>),
}

/// Identity resolution, alias/property management, version history, merge.
pub struct EntityStore {
    substrate: Arc<dyn Substrate>,
    fuzzy_limit: usize,
}

impl EntityStore {
    pub fn new(substrate: Arc<dyn Substrate>, config: &StoreConfig) -> Self {
        Self {
            substrate,
            fuzzy_limit: config.fuzzy_candidate_limit,
        }
    }

    /// Resolve a name to ranked candidates. A normalized match on the
    /// entity's name or an alias scores 1.0; partial token matches score
    /// fractionally. Deduplicated by id keeping the maximum score,
    /// sorted descending (stable).
    pub fn resolve(&self, name: &str, entity_type: EntityType) -> Result<Vec<ResolvedCandidate>> {
        let normalized = normalize_name(name);
        let mut candidates: Vec<ResolvedCandidate> = Vec::new();

        if let Some(id) = self.substrate.entity_id_by_key(entity_type, &normalized)? {
            if let Some(entity) = self.substrate.get_entity(&id)? {
                candidates.push(ResolvedCandidate {
                    id,
                    entity,
                    score: 1.0,
                });
            } else {
                warn!("entity key '{normalized}' points at missing record {id}");
            }
        }

        for (id, score) in self
            .substrate
            .fuzzy_entities(name, Some(entity_type), self.fuzzy_limit)?
        {
            // Exact score is always >= fuzzy, so first-seen wins on dedup.
            if candidates.iter().any(|c| c.id == id) {
                continue;
            }
            if let Some(entity) = self.substrate.get_entity(&id)? {
                // An alias is one of the entity's names; a normalized alias
                // match is exact, not fuzzy.
                let score = if entity.answers_to(name) { 1.0 } else { score };
                candidates.push(ResolvedCandidate { id, entity, score });
            }
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates)
    }

    /// Stage an idempotent create-or-match into `tx`. On a match the display
    /// name is overwritten with the latest-seen casing; on a miss a fresh
    /// version-0 entity is staged. Nothing touches the substrate until the
    /// batch is applied.
    pub fn stage_upsert(
        &self,
        name: &str,
        entity_type: EntityType,
        tx: &mut TxBatch,
    ) -> Result<EntityId> {
        let normalized = normalize_name(name);

        if let Some(id) = tx.staged_entity(entity_type, &normalized) {
            return Ok(id);
        }

        if let Some(id) = self.substrate.entity_id_by_key(entity_type, &normalized)? {
            match self.substrate.get_entity(&id)? {
                Some(mut entity) => {
                    if entity.display_name != name {
                        // Latest-seen casing wins.
                        entity.display_name = name.to_string();
                        tx.push(Mutation::PutEntity(entity));
                    }
                    return Ok(id);
                }
                None => {
                    // Stale key with no record; recreate below.
                    warn!("stale entity key '{normalized}' (id {id}), recreating");
                }
            }
        }

        let entity = Entity {
            id: EntityId(Uuid::new_v4()),
            display_name: name.to_string(),
            normalized_name: normalized.clone(),
            entity_type,
            aliases: Vec::new(),
            properties: HashMap::new(),
            version: 0,
            created_at: Utc::now(),
            updated_at: None,
        };
        let id = entity.id;
        tx.push(Mutation::PutEntity(entity));
        tx.stage_entity(entity_type, normalized, id);
        debug!("staged new {} entity '{}'", entity_type.as_str(), name);
        Ok(id)
    }

    /// Create-or-match as a standalone operation.
    pub fn upsert(&self, name: &str, entity_type: EntityType) -> Result<EntityId> {
        let mut tx = TxBatch::new();
        let id = self.stage_upsert(name, entity_type, &mut tx)?;
        if !tx.is_empty() {
            self.substrate.apply(tx.into_mutations())?;
        }
        Ok(id)
    }

    /// Merge `updates` into the entity's properties (last-write-wins per
    /// key) under an optimistic version check. The pre-update state is
    /// snapshotted into the version log atomically with the new version.
    /// Returns the new version number.
    pub fn update_properties(
        &self,
        id: &EntityId,
        updates: HashMap<String, String>,
        expected_version: u64,
    ) -> Result<u64> {
        let Some(mut entity) = self.substrate.get_entity(id)? else {
            return Err(Error::EntityNotFound(id.to_string()));
        };

        if entity.version != expected_version {
            return Err(Error::VersionConflict {
                entity_id: *id,
                expected: expected_version,
                actual: entity.version,
            });
        }

        let snapshot = EntityVersion {
            entity_id: *id,
            version: entity.version,
            name: entity.display_name.clone(),
            properties: entity.properties.clone(),
            created_at: Utc::now(),
        };

        for (key, value) in updates {
            entity.properties.insert(key, value);
        }
        entity.version += 1;
        entity.updated_at = Some(Utc::now());
        let new_version = entity.version;

        self.substrate.apply(vec![
            Mutation::PutVersion(snapshot),
            Mutation::PutEntity(entity),
        ])?;

        debug!("entity {id} updated to v{new_version}");
        Ok(new_version)
    }

    /// Current state plus up to `limit` prior snapshots, newest first.
    pub fn get_history(
        &self,
        id: &EntityId,
        limit: usize,
    ) -> Result<(Entity, Vec<EntityVersion>)> {
        let Some(entity) = self.substrate.get_entity(id)? else {
            return Err(Error::EntityNotFound(id.to_string()));
        };

        let mut snapshots = Vec::new();
        for version in (0..entity.version).rev().take(limit) {
            match self.substrate.get_version(id, version)? {
                Some(snapshot) => snapshots.push(snapshot),
                None => warn!("version log gap: entity {id} missing snapshot v{version}"),
            }
        }

        Ok((entity, snapshots))
    }

    /// Absorb `remove` into `keep`: re-point every mention and typed
    /// relationship, fold remove's names into keep's aliases, delete the
    /// node. Destructive, one-way, atomic.
    pub fn merge_entities(&self, keep: &EntityId, remove: &EntityId) -> Result<()> {
        if keep == remove {
            return Err(Error::Validation {
                field: "remove_id".to_string(),
                reason: "cannot merge an entity into itself".to_string(),
            });
        }

        let Some(mut keep_entity) = self.substrate.get_entity(keep)? else {
            return Err(Error::EntityNotFound(keep.to_string()));
        };
        let Some(remove_entity) = self.substrate.get_entity(remove)? else {
            return Err(Error::EntityNotFound(remove.to_string()));
        };

        let mut tx = TxBatch::new();

        // Re-point mention edges, preserving each edge's identity.
        for edge in self.substrate.mention_edges_of_entity(remove)? {
            tx.push(Mutation::DeleteMention(edge));
            tx.push(Mutation::PutMention(crate::model::MentionEdge {
                id: edge.id,
                memory_id: edge.memory_id,
                entity_id: *keep,
            }));
        }

        // Re-point typed relationships, both directions, preserving type
        // and context. Re-keyed edges that collide with an existing edge of
        // keep fold into it; self-loops are dropped.
        for rel in self.substrate.relationships_of(remove)? {
            tx.push(Mutation::DeleteRelationship {
                from: rel.from,
                to: rel.to,
                relation_type: rel.relation_type,
            });

            let from = if rel.from == *remove { *keep } else { rel.from };
            let to = if rel.to == *remove { *keep } else { rel.to };
            if from == to {
                debug!(
                    "dropping {} self-loop produced by merge",
                    rel.relation_type.as_str()
                );
                continue;
            }

            let folded = match self.substrate.get_relationship(&from, &to, rel.relation_type)? {
                Some(existing) => Relationship {
                    from,
                    to,
                    relation_type: rel.relation_type,
                    context: existing.context.or(rel.context),
                    first_seen: existing.first_seen.min(rel.first_seen),
                    last_seen: existing.last_seen.max(rel.last_seen),
                },
                None => Relationship { from, to, ..rel },
            };
            tx.push(Mutation::PutRelationship(folded));
        }

        // Remove's display name and aliases become aliases of keep,
        // deduplicated by normalized form.
        let mut incoming = vec![remove_entity.display_name.clone()];
        incoming.extend(remove_entity.aliases.iter().cloned());
        for alias in incoming {
            if !keep_entity.answers_to(&alias) {
                keep_entity.aliases.push(alias);
            }
        }

        tx.push(Mutation::PutEntity(keep_entity));
        tx.push(Mutation::DeleteEntity(*remove));

        self.substrate.apply(tx.into_mutations())?;

        info!(
            "merged entity {remove} ('{}') into {keep}",
            remove_entity.display_name
        );
        Ok(())
    }

    /// Decide what an extracted mention refers to. Zero candidates or a
    /// single exact match need no escalation; everything else goes to the
    /// disambiguator oracle. Auto-resolution requires a positive selection
    /// at high confidence; an inconclusive verdict is surfaced, never
    /// guessed.
    pub fn disambiguate(
        &self,
        name: &str,
        entity_type: EntityType,
        surrounding_text: &str,
        candidates: &[ResolvedCandidate],
        oracle: &dyn Disambiguator,
    ) -> Result<Resolution> {
        if candidates.is_empty() {
            return Ok(Resolution::NewEntity);
        }
        if candidates.len() == 1 && candidates[0].score >= 1.0 {
            return Ok(Resolution::Resolved(candidates[0].id));
        }

        let verdict = oracle.judge(name, entity_type, surrounding_text, candidates)?;
        debug!(
            "disambiguator verdict for '{name}': index {} ({:?})",
            verdict.selected_index, verdict.confidence
        );

        if verdict.selected_index > 0 && verdict.confidence == Confidence::High {
            let idx = verdict.selected_index as usize;
            if let Some(candidate) = candidates.get(idx - 1) {
                return Ok(Resolution::Resolved(candidate.id));
            }
            warn!(
                "disambiguator selected out-of-range candidate {idx} of {}",
                candidates.len()
            );
            return Ok(Resolution::Ambiguous(candidates.to_vec()));
        }
        if verdict.selected_index == 0 {
            return Ok(Resolution::NewEntity);
        }
        Ok(Resolution::Ambiguous(candidates.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DisambiguatorVerdict;
    use crate::substrate::RocksSubstrate;
    use tempfile::TempDir;

    fn setup() -> (EntityStore, Arc<dyn Substrate>, TempDir) {
        let temp_dir = TempDir::new().expect("temp dir");
        let substrate: Arc<dyn Substrate> =
            Arc::new(RocksSubstrate::open(temp_dir.path()).expect("open substrate"));
        let store = EntityStore::new(substrate.clone(), &StoreConfig::default());
        (store, substrate, temp_dir)
    }

    /// Disambiguator returning a fixed verdict.
    struct FixedVerdict(i32, Confidence);

    impl Disambiguator for FixedVerdict {
        fn judge(
            &self,
            _name: &str,
            _entity_type: EntityType,
            _surrounding_text: &str,
            _candidates: &[ResolvedCandidate],
        ) -> Result<DisambiguatorVerdict> {
            Ok(DisambiguatorVerdict {
                selected_index: self.0,
                confidence: self.1,
                reasoning: String::new(),
            })
        }
    }

    #[test]
    fn test_upsert_dedups_on_case_and_whitespace() {
        let (store, _, _dir) = setup();
        let a = store.upsert("Sarah", EntityType::Person).unwrap();
        let b = store.upsert("sarah", EntityType::Person).unwrap();
        let c = store.upsert("  SARAH ", EntityType::Person).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_upsert_same_name_different_type_is_distinct() {
        let (store, _, _dir) = setup();
        let person = store.upsert("Phoenix", EntityType::Person).unwrap();
        let place = store.upsert("Phoenix", EntityType::Place).unwrap();
        assert_ne!(person, place);
    }

    #[test]
    fn test_upsert_display_name_last_write_wins() {
        let (store, substrate, _dir) = setup();
        let id = store.upsert("sarah connor", EntityType::Person).unwrap();
        store.upsert("Sarah Connor", EntityType::Person).unwrap();
        let entity = substrate.get_entity(&id).unwrap().unwrap();
        assert_eq!(entity.display_name, "Sarah Connor");
    }

    #[test]
    fn test_resolve_exact_scores_one() {
        let (store, _, _dir) = setup();
        let id = store.upsert("Rust", EntityType::Concept).unwrap();
        let candidates = store.resolve("rust", EntityType::Concept).unwrap();
        assert_eq!(candidates[0].id, id);
        assert_eq!(candidates[0].score, 1.0);
    }

    #[test]
    fn test_resolve_no_duplicate_ids() {
        let (store, _, _dir) = setup();
        // "Rust" matches both exactly and fuzzily; only one candidate comes
        // back, at the exact score.
        store.upsert("Rust", EntityType::Concept).unwrap();
        store.upsert("Rust Belt", EntityType::Concept).unwrap();
        let candidates = store.resolve("Rust", EntityType::Concept).unwrap();
        let mut ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), candidates.len());
        assert_eq!(candidates[0].score, 1.0);
        assert!(candidates.iter().skip(1).all(|c| c.score < 1.0));
    }

    #[test]
    fn test_update_properties_versioning() {
        let (store, substrate, _dir) = setup();
        let id = store.upsert("John", EntityType::Person).unwrap();

        let v1 = store
            .update_properties(
                &id,
                HashMap::from([("lastName".to_string(), "Jackson".to_string())]),
                0,
            )
            .unwrap();
        assert_eq!(v1, 1);

        let entity = substrate.get_entity(&id).unwrap().unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.properties.get("lastName").unwrap(), "Jackson");

        let (_, history) = store.get_history(&id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 0);
        assert!(history[0].properties.is_empty());
    }

    #[test]
    fn test_history_is_newest_first_and_truncated() {
        let (store, _, _dir) = setup();
        let id = store.upsert("John", EntityType::Person).unwrap();
        for v in 0..4 {
            store
                .update_properties(
                    &id,
                    HashMap::from([("step".to_string(), v.to_string())]),
                    v,
                )
                .unwrap();
        }

        let (current, history) = store.get_history(&id, 2).unwrap();
        assert_eq!(current.version, 4);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 3);
        assert_eq!(history[1].version, 2);
        // Snapshot v3 is the state before the fourth update.
        assert_eq!(history[0].properties.get("step").unwrap(), "2");
    }

    #[test]
    fn test_update_properties_version_conflict() {
        let (store, _, _dir) = setup();
        let id = store.upsert("John", EntityType::Person).unwrap();
        let err = store
            .update_properties(&id, HashMap::new(), 3)
            .unwrap_err();
        assert_eq!(err.code(), "VERSION_CONFLICT");
    }

    #[test]
    fn test_update_properties_unknown_entity() {
        let (store, _, _dir) = setup();
        let err = store
            .update_properties(&EntityId(Uuid::new_v4()), HashMap::new(), 0)
            .unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
    }

    #[test]
    fn test_merge_moves_relationships_and_aliases() {
        let (store, substrate, _dir) = setup();
        let john = store.upsert("John", EntityType::Person).unwrap();
        let john_doe = store.upsert("John Doe", EntityType::Person).unwrap();
        let google = store.upsert("Google", EntityType::Organization).unwrap();

        substrate
            .apply(vec![Mutation::PutRelationship(Relationship {
                from: john_doe,
                to: google,
                relation_type: crate::model::RelationType::WorksAt,
                context: None,
                first_seen: Utc::now(),
                last_seen: Utc::now(),
            })])
            .unwrap();

        store.merge_entities(&john, &john_doe).unwrap();

        // Edge moved, preserving type.
        let rels = substrate.relationships_of(&john).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].from, john);
        assert_eq!(rels[0].to, google);
        assert_eq!(
            rels[0].relation_type,
            crate::model::RelationType::WorksAt
        );

        // Removed entity gone; its name is now an alias of keep.
        assert!(substrate.get_entity(&john_doe).unwrap().is_none());
        let keep = substrate.get_entity(&john).unwrap().unwrap();
        assert!(keep.aliases.contains(&"John Doe".to_string()));

        // The alias now resolves to keep.
        let candidates = store.resolve("John Doe", EntityType::Person).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, john);
    }

    #[test]
    fn test_merge_does_not_duplicate_aliases() {
        let (store, substrate, _dir) = setup();
        let keep = store.upsert("John", EntityType::Person).unwrap();
        let first = store.upsert("John Doe", EntityType::Person).unwrap();
        store.merge_entities(&keep, &first).unwrap();

        // A later sighting differing only in casing and spacing creates a
        // fresh node (the old key was deleted with the merge)...
        let second = store.upsert("JOHN  DOE", EntityType::Person).unwrap();
        assert_ne!(second, first);
        store.merge_entities(&keep, &second).unwrap();

        // ...but absorbing it must not append a second alias for the same
        // normalized form.
        let entity = substrate.get_entity(&keep).unwrap().unwrap();
        assert_eq!(entity.aliases, vec!["John Doe".to_string()]);
    }

    #[test]
    fn test_merge_is_not_idempotent() {
        let (store, _, _dir) = setup();
        let keep = store.upsert("John", EntityType::Person).unwrap();
        let remove = store.upsert("John Doe", EntityType::Person).unwrap();

        store.merge_entities(&keep, &remove).unwrap();
        let err = store.merge_entities(&keep, &remove).unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
    }

    #[test]
    fn test_merge_rejects_self() {
        let (store, _, _dir) = setup();
        let id = store.upsert("John", EntityType::Person).unwrap();
        let err = store.merge_entities(&id, &id).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn test_disambiguate_empty_is_new_entity() {
        let (store, _, _dir) = setup();
        let resolution = store
            .disambiguate(
                "Nobody",
                EntityType::Person,
                "",
                &[],
                &FixedVerdict(-1, Confidence::Low),
            )
            .unwrap();
        assert!(matches!(resolution, Resolution::NewEntity));
    }

    #[test]
    fn test_disambiguate_single_exact_skips_oracle() {
        let (store, _, _dir) = setup();
        let id = store.upsert("Sarah", EntityType::Person).unwrap();
        let candidates = store.resolve("Sarah", EntityType::Person).unwrap();

        /// Oracle that must never be consulted.
        struct Panicking;
        impl Disambiguator for Panicking {
            fn judge(
                &self,
                _: &str,
                _: EntityType,
                _: &str,
                _: &[ResolvedCandidate],
            ) -> Result<DisambiguatorVerdict> {
                panic!("exact match must not escalate");
            }
        }

        let resolution = store
            .disambiguate("Sarah", EntityType::Person, "", &candidates, &Panicking)
            .unwrap();
        match resolution {
            Resolution::Resolved(resolved) => assert_eq!(resolved, id),
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn test_disambiguate_high_confidence_selection() {
        let (store, _, _dir) = setup();
        store.upsert("John Smith", EntityType::Person).unwrap();
        let jones = store.upsert("John Jones", EntityType::Person).unwrap();
        let mut candidates = store.resolve("John Smith", EntityType::Person).unwrap();
        candidates.extend(store.resolve("John Jones", EntityType::Person).unwrap());

        let resolution = store
            .disambiguate(
                "John",
                EntityType::Person,
                "John from the Jones family",
                &candidates,
                &FixedVerdict(2, Confidence::High),
            )
            .unwrap();
        match resolution {
            Resolution::Resolved(resolved) => assert_eq!(resolved, jones),
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[test]
    fn test_disambiguate_low_confidence_is_ambiguous() {
        let (store, _, _dir) = setup();
        store.upsert("John Smith", EntityType::Person).unwrap();
        store.upsert("John Jones", EntityType::Person).unwrap();
        let mut candidates = store.resolve("John Smith", EntityType::Person).unwrap();
        candidates.extend(store.resolve("John Jones", EntityType::Person).unwrap());

        let resolution = store
            .disambiguate(
                "John",
                EntityType::Person,
                "",
                &candidates,
                &FixedVerdict(1, Confidence::Medium),
            )
            .unwrap();
        assert!(matches!(resolution, Resolution::Ambiguous(_)));
    }

    #[test]
    fn test_disambiguate_zero_index_means_new() {
        let (store, _, _dir) = setup();
        store.upsert("John Smith", EntityType::Person).unwrap();
        let candidates = store.resolve("John", EntityType::Person).unwrap();
        if candidates.is_empty() {
            // Fuzzy recall can legitimately miss; nothing to disambiguate.
            return;
        }
        let resolution = store
            .disambiguate(
                "John",
                EntityType::Person,
                "a different John entirely",
                &candidates,
                &FixedVerdict(0, Confidence::High),
            )
            .unwrap();
        assert!(matches!(resolution, Resolution::NewEntity));
    }
}
