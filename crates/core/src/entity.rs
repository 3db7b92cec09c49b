//! Entity types - people, organizations, concepts, etc.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an entity, derived from its normalized name
pub type EntityId = String;

/// Type assigned when neither the schema nor heuristics say otherwise
pub const DEFAULT_ENTITY_TYPE: &str = "concept";

/// Separator used when descriptions from several mentions are merged
const DESCRIPTION_SEPARATOR: &str = "; ";

/// How an entity came into existence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    /// Returned by the extraction call
    Extracted,
    /// Synthesized because a relationship referenced an unknown name
    Dynamic,
}

/// Where a mention came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    pub chunk_id: String,
}

impl Provenance {
    pub fn new(document_id: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_id: chunk_id.into(),
        }
    }
}

/// An entity in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Content-addressed identifier (see [`Entity::id_for`])
    pub id: EntityId,

    /// Display name, as first seen
    pub name: String,

    /// Normalized name used for matching
    pub canonical_name: String,

    /// Schema node type or inferred type
    pub entity_type: String,

    #[serde(default)]
    pub description: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    pub origin: EntityOrigin,

    #[serde(default)]
    pub provenance: Vec<Provenance>,
}

impl Entity {
    /// Create a new entity; the id is derived from the normalized name.
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>, origin: EntityOrigin) -> Self {
        let name = name.into().trim().to_string();
        let canonical_name = Self::normalize(&name);
        Self {
            id: Self::id_for_normalized(&canonical_name),
            name,
            canonical_name,
            entity_type: entity_type.into(),
            description: String::new(),
            confidence: 0.0,
            origin,
            provenance: Vec::new(),
        }
    }

    /// Normalize a name for matching: lowercase, strip punctuation and
    /// symbols, collapse whitespace. Idempotent.
    pub fn normalize(name: &str) -> String {
        name.to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Stable id for any spelling of a name
    pub fn id_for(name: &str) -> EntityId {
        Self::id_for_normalized(&Self::normalize(name))
    }

    fn id_for_normalized(normalized: &str) -> EntityId {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, normalized.as_bytes()).to_string()
    }

    /// Builder: set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into().trim().to_string();
        self
    }

    /// Builder: set confidence
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Builder: add provenance
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.add_provenance(provenance);
        self
    }

    pub fn add_provenance(&mut self, provenance: Provenance) {
        if !self.provenance.contains(&provenance) {
            self.provenance.push(provenance);
        }
    }

    /// Fold another record of the same entity into this one: descriptions
    /// are merged, the higher confidence is kept and provenance is unioned.
    /// Name, id and type of `self` win.
    pub fn absorb(&mut self, other: &Entity) {
        self.merge_description(&other.description);
        if other.confidence > self.confidence {
            self.confidence = other.confidence;
        }
        if other.origin == EntityOrigin::Extracted {
            self.origin = EntityOrigin::Extracted;
        }
        for provenance in &other.provenance {
            self.add_provenance(provenance.clone());
        }
    }

    /// Append a description fragment unless it is already present
    pub fn merge_description(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        if self.description.is_empty() {
            self.description = fragment.to_string();
        } else if !self
            .description
            .split(DESCRIPTION_SEPARATOR)
            .any(|existing| existing == fragment)
        {
            self.description.push_str(DESCRIPTION_SEPARATOR);
            self.description.push_str(fragment);
        }
    }

    /// Text used for embedding and for graph-channel results
    pub fn summary_text(&self) -> String {
        if self.description.is_empty() {
            format!("{} ({})", self.name, self.entity_type)
        } else {
            format!("{} ({}): {}", self.name, self.entity_type, self.description)
        }
    }
}
