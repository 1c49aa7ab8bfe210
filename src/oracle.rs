//! Oracle boundary: extraction, embedding, and disambiguation services
//!
//! The core never does NLP. Extraction, embedding generation, and
//! disambiguation judgement are external services behind these traits.
//! Their loosely-typed JSON responses are decoded into the closed types
//! here before any store mutation happens.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::entity_store::ResolvedCandidate;
use crate::errors::{Error, Result};
use crate::model::{EntityType, MemoryType, RelationType};

/// Entity reference extracted from free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub context: Option<String>,
}

/// Relationship extracted from free text, by entity name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    #[serde(default)]
    pub context: Option<String>,
}

/// Property updates the extractor attributed to a named entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyUpdate {
    #[serde(rename = "entityName")]
    pub entity_name: String,
    pub updates: HashMap<String, String>,
}

/// Temporal phrases found in the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemporalCues {
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, rename = "timeOfDay")]
    pub time_of_day: Option<String>,
}

/// Situational metadata the extractor inferred.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

/// Full extraction result for one observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub summary: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(default, rename = "propertyUpdates")]
    pub property_updates: Vec<PropertyUpdate>,
    #[serde(default)]
    pub temporal: TemporalCues,
    #[serde(default)]
    pub metadata: ExtractionMetadata,
    #[serde(default, rename = "hypotheticalQuestions")]
    pub hypothetical_questions: Vec<String>,
}

impl Extraction {
    /// Decode an extractor's raw JSON response. Unknown fields are ignored;
    /// missing optional sections default to empty.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Upstream(format!("extractor returned undecodable JSON: {e}")))
    }
}

/// Disambiguator confidence levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Raw disambiguator verdict. `selected_index` is 1-based into the
/// candidate list; 0 means "brand-new entity"; -1 means "cannot decide".
/// Auto-resolution requires `selected_index > 0` AND high confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisambiguatorVerdict {
    #[serde(rename = "selectedIndex")]
    pub selected_index: i32,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: String,
}

impl DisambiguatorVerdict {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Upstream(format!("disambiguator returned undecodable JSON: {e}")))
    }
}

/// Natural-language extraction oracle.
pub trait Extractor: Send + Sync {
    fn extract(&self, text: &str) -> Result<Extraction>;
}

/// Embedding oracle. Vectors follow the cosine-similarity convention.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dim(&self) -> usize {
        crate::constants::EMBEDDING_DIM
    }
}

/// Disambiguation oracle: judges which ranked candidate (if any) a mention
/// refers to, given its surrounding text.
pub trait Disambiguator: Send + Sync {
    fn judge(
        &self,
        name: &str,
        entity_type: EntityType,
        surrounding_text: &str,
        candidates: &[ResolvedCandidate],
    ) -> Result<DisambiguatorVerdict>;
}

/// Run an oracle or substrate call, retrying exactly once with fixed
/// backoff on a transient upstream failure. Every other error propagates
/// immediately.
pub(crate) fn retry_transient<T, F>(op: &str, backoff_ms: u64, f: F) -> Result<T>
where
    F: Fn() -> Result<T>,
{
    match f() {
        Err(Error::Upstream(msg)) => {
            warn!("{op} failed transiently ({msg}), retrying after {backoff_ms}ms");
            thread::sleep(Duration::from_millis(backoff_ms));
            f()
        }
        other => other,
    }
}
