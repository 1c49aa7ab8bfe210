//! Entity Identity Tests
//!
//! End-to-end coverage for the identity layer driven through the
//! orchestrator:
//! - Dedup on (normalized name, type) across repeated observations
//! - Disambiguation escalation and its outcomes
//! - Property versioning via extracted updates
//! - Entity merge and alias resolution

use smriti::config::StoreConfig;
use smriti::entity_store::ResolvedCandidate;
use smriti::errors::{Error, Result};
use smriti::model::{EntityType, MemoryType, RelationType};
use smriti::oracle::{
    Confidence, Disambiguator, DisambiguatorVerdict, Embedder, ExtractedEntity,
    ExtractedRelationship, Extraction, ExtractionMetadata, Extractor, PropertyUpdate,
    TemporalCues,
};
use smriti::orchestrator::Orchestrator;
use smriti::substrate::{RocksSubstrate, Substrate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Extractor replaying canned extractions keyed by input text.
struct ScriptedExtractor {
    responses: Mutex<HashMap<String, Extraction>>,
}

impl ScriptedExtractor {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, text: &str, extraction: Extraction) {
        self.responses
            .lock()
            .unwrap()
            .insert(text.to_string(), extraction);
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, text: &str) -> Result<Extraction> {
        self.responses
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("no scripted extraction for '{text}'")))
    }
}

/// Deterministic embedder: one axis per known keyword, presence-based.
struct KeywordEmbedder;

const KEYWORDS: [&str; 6] = ["sarah", "john", "google", "coffee", "roadmap", "milk"];

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        Ok(KEYWORDS
            .iter()
            .map(|kw| if lowered.contains(kw) { 1.0 } else { 0.0 })
            .collect())
    }

    fn dim(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Disambiguator replaying a fixed sequence of verdicts, then a default.
struct ScriptedDisambiguator {
    queue: Mutex<Vec<(i32, Confidence)>>,
    fallback: (i32, Confidence),
}

impl ScriptedDisambiguator {
    /// Verdicts are consumed front to back, one per consultation.
    fn new(verdicts: Vec<(i32, Confidence)>, fallback: (i32, Confidence)) -> Self {
        let mut queue = verdicts;
        queue.reverse();
        Self {
            queue: Mutex::new(queue),
            fallback,
        }
    }
}

impl Disambiguator for ScriptedDisambiguator {
    fn judge(
        &self,
        _name: &str,
        _entity_type: EntityType,
        _surrounding_text: &str,
        _candidates: &[ResolvedCandidate],
    ) -> Result<DisambiguatorVerdict> {
        let (selected_index, confidence) =
            self.queue.lock().unwrap().pop().unwrap_or(self.fallback);
        Ok(DisambiguatorVerdict {
            selected_index,
            confidence,
            reasoning: String::new(),
        })
    }
}

fn bare_extraction(summary: &str, memory_type: MemoryType) -> Extraction {
    Extraction {
        summary: summary.to_string(),
        memory_type,
        entities: Vec::new(),
        relationships: Vec::new(),
        property_updates: Vec::new(),
        temporal: TemporalCues::default(),
        metadata: ExtractionMetadata::default(),
        hypothetical_questions: Vec::new(),
    }
}

fn person(name: &str) -> ExtractedEntity {
    ExtractedEntity {
        name: name.to_string(),
        entity_type: EntityType::Person,
        context: None,
    }
}

fn setup(
    extractor: Arc<ScriptedExtractor>,
    disambiguator: Arc<dyn Disambiguator>,
) -> (Orchestrator, Arc<dyn Substrate>, TempDir) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let temp_dir = TempDir::new().expect("temp dir");
    let substrate: Arc<dyn Substrate> =
        Arc::new(RocksSubstrate::open(temp_dir.path()).expect("open substrate"));
    let orchestrator = Orchestrator::new(
        substrate.clone(),
        extractor,
        Arc::new(KeywordEmbedder),
        disambiguator,
        &StoreConfig {
            embedding_dim: KEYWORDS.len(),
            ..StoreConfig::default()
        },
    );
    (orchestrator, substrate, temp_dir)
}

#[test]
fn test_repeated_mentions_dedup_to_one_entity() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let texts = [
        "Met Sarah for coffee",
        "sarah recommended a book",
        "SARAH started a new project",
    ];
    for text in &texts {
        let mut extraction = bare_extraction(text, MemoryType::Episodic);
        let name = text.split_whitespace().find(|w| w.to_lowercase() == "sarah");
        extraction.entities.push(person(name.unwrap()));
        extractor.script(text, extraction);
    }

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(vec![], (-1, Confidence::Low))));

    for text in &texts {
        orchestrator.remember(text).unwrap();
    }

    let stats = substrate.stats().unwrap();
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.memories, 3);

    let sarah = substrate
        .entity_id_by_key(EntityType::Person, "sarah")
        .unwrap()
        .expect("sarah exists");
    assert_eq!(substrate.memories_mentioning(&sarah).unwrap().len(), 3);

    // Latest-seen casing wins for display.
    let entity = substrate.get_entity(&sarah).unwrap().unwrap();
    assert_eq!(entity.display_name, "SARAH");
}

#[test]
fn test_ambiguous_mention_is_surfaced_not_guessed() {
    let extractor = Arc::new(ScriptedExtractor::new());
    for name in ["John Smith", "John Johnson"] {
        let text = format!("Met {name} today");
        let mut extraction = bare_extraction(&text, MemoryType::Episodic);
        extraction.entities.push(person(name));
        extractor.script(&text, extraction);
    }
    let mut extraction = bare_extraction("John called", MemoryType::Episodic);
    extraction.entities.push(person("John"));
    extractor.script("John called", extraction);

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(
            vec![(0, Confidence::High), (1, Confidence::Low)],
            (-1, Confidence::Low),
        )));

    orchestrator.remember("Met John Smith today").unwrap();
    orchestrator.remember("Met John Johnson today").unwrap();

    let err = orchestrator.remember("John called").unwrap_err();
    match err {
        Error::AmbiguousEntity { name, candidates } => {
            assert_eq!(name, "John");
            assert_eq!(candidates.len(), 2);
        }
        other => panic!("expected AmbiguousEntity, got {other:?}"),
    }
    // Nothing about the failed observation was written.
    assert_eq!(substrate.stats().unwrap().memories, 2);
}

#[test]
fn test_high_confidence_verdict_resolves_mention() {
    let extractor = Arc::new(ScriptedExtractor::new());
    for name in ["John Smith", "John Johnson"] {
        let text = format!("Met {name} today");
        let mut extraction = bare_extraction(&text, MemoryType::Episodic);
        extraction.entities.push(person(name));
        extractor.script(&text, extraction);
    }
    let mut extraction = bare_extraction("John called", MemoryType::Episodic);
    extraction.entities.push(person("John"));
    extractor.script("John called", extraction);

    // Second observation forks a new John; the bare mention then selects
    // the top candidate at high confidence.
    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(
            vec![(0, Confidence::High), (1, Confidence::High)],
            (-1, Confidence::Low),
        )));

    orchestrator.remember("Met John Smith today").unwrap();
    orchestrator.remember("Met John Johnson today").unwrap();
    orchestrator.remember("John called").unwrap();

    // The mention attached to an existing entity instead of creating a
    // third John.
    assert_eq!(substrate.stats().unwrap().entities, 2);
}

#[test]
fn test_extracted_property_updates_are_versioned() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let mut first = bare_extraction("Met John", MemoryType::Episodic);
    first.entities.push(person("John"));
    extractor.script("Met John", first);

    let mut second = bare_extraction("John's last name is Jackson", MemoryType::Semantic);
    second.entities.push(person("John"));
    second.property_updates.push(PropertyUpdate {
        entity_name: "John".to_string(),
        updates: HashMap::from([("lastName".to_string(), "Jackson".to_string())]),
    });
    extractor.script("John's last name is Jackson", second);

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(vec![], (-1, Confidence::Low))));

    orchestrator.remember("Met John").unwrap();
    orchestrator.remember("John's last name is Jackson").unwrap();

    let john = substrate
        .entity_id_by_key(EntityType::Person, "john")
        .unwrap()
        .unwrap();
    let (current, history) = orchestrator.get_entity_history(&john, 10).unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.properties.get("lastName").unwrap(), "Jackson");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 0);
    assert!(history[0].properties.is_empty());
}

#[test]
fn test_merge_preserves_relationships_and_answers_to_alias() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let mut extraction = bare_extraction("John Doe works at Google", MemoryType::Semantic);
    extraction.entities.push(person("John Doe"));
    extraction.entities.push(ExtractedEntity {
        name: "Google".to_string(),
        entity_type: EntityType::Organization,
        context: None,
    });
    extraction.relationships.push(ExtractedRelationship {
        from: "John Doe".to_string(),
        to: "Google".to_string(),
        relation_type: RelationType::WorksAt,
        context: None,
    });
    extractor.script("John Doe works at Google", extraction);

    let mut other = bare_extraction("Met John for coffee", MemoryType::Episodic);
    other.entities.push(person("John"));
    extractor.script("Met John for coffee", other);

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(vec![(0, Confidence::High)], (-1, Confidence::Low))));

    orchestrator.remember("John Doe works at Google").unwrap();
    orchestrator.remember("Met John for coffee").unwrap();

    let john = substrate
        .entity_id_by_key(EntityType::Person, "john")
        .unwrap()
        .unwrap();
    let john_doe = substrate
        .entity_id_by_key(EntityType::Person, "john doe")
        .unwrap()
        .unwrap();

    orchestrator.merge_entities(&john, &john_doe).unwrap();

    // The WORKS_AT edge now hangs off the kept entity.
    let rels = substrate.relationships_of(&john).unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].relation_type, RelationType::WorksAt);
    assert_eq!(rels[0].from, john);

    // Both memories now reach the kept entity.
    assert_eq!(substrate.memories_mentioning(&john).unwrap().len(), 2);
    assert!(substrate.get_entity(&john_doe).unwrap().is_none());

    // The removed name resolves to the kept entity as an alias.
    let similar = orchestrator
        .find_similar_entities("John Doe", Some(EntityType::Person), 10)
        .unwrap();
    assert_eq!(similar[0].id, john);
    assert_eq!(similar[0].score, 1.0);
}

#[test]
fn test_optimistic_concurrency_rejects_stale_writer() {
    let extractor = Arc::new(ScriptedExtractor::new());
    let mut extraction = bare_extraction("Met John", MemoryType::Episodic);
    extraction.entities.push(person("John"));
    extractor.script("Met John", extraction);

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(vec![], (-1, Confidence::Low))));
    orchestrator.remember("Met John").unwrap();

    let john = substrate
        .entity_id_by_key(EntityType::Person, "john")
        .unwrap()
        .unwrap();

    let updates = HashMap::from([("team".to_string(), "infra".to_string())]);
    orchestrator
        .update_entity_properties(&john, updates.clone(), 0)
        .unwrap();

    // A second writer still holding version 0 must fail, not clobber.
    let err = orchestrator
        .update_entity_properties(&john, updates, 0)
        .unwrap_err();
    match err {
        Error::VersionConflict { expected, actual, .. } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
}

#[test]
fn test_relationship_reobservation_is_one_edge() {
    let extractor = Arc::new(ScriptedExtractor::new());
    for text in ["John works at Google", "John still works at Google"] {
        let mut extraction = bare_extraction(text, MemoryType::Semantic);
        extraction.entities.push(person("John"));
        extraction.entities.push(ExtractedEntity {
            name: "Google".to_string(),
            entity_type: EntityType::Organization,
            context: None,
        });
        extraction.relationships.push(ExtractedRelationship {
            from: "John".to_string(),
            to: "Google".to_string(),
            relation_type: RelationType::WorksAt,
            context: None,
        });
        extractor.script(text, extraction);
    }

    let (orchestrator, substrate, _dir) =
        setup(extractor, Arc::new(ScriptedDisambiguator::new(vec![], (-1, Confidence::Low))));
    orchestrator.remember("John works at Google").unwrap();
    orchestrator.remember("John still works at Google").unwrap();

    assert_eq!(substrate.stats().unwrap().relationships, 1);
    let john = substrate
        .entity_id_by_key(EntityType::Person, "john")
        .unwrap()
        .unwrap();
    let rels = substrate.relationships_of(&john).unwrap();
    assert_eq!(rels.len(), 1);
    assert!(rels[0].last_seen >= rels[0].first_seen);
}
