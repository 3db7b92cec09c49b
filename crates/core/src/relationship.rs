//! Relationship types - labelled edges between entities

use crate::entity::{EntityId, Provenance};
use serde::{Deserialize, Serialize};

/// A subject-predicate-object triple over resolved entity ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Subject entity id (the "from" node)
    pub source_id: EntityId,

    /// Relation label, drawn from the schema relation types
    pub label: String,

    /// Object entity id (the "to" node)
    pub target_id: EntityId,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    #[serde(default)]
    pub provenance: Vec<Provenance>,
}

impl Relationship {
    /// Create a new relationship; the label is normalized to snake_case.
    pub fn new(
        source_id: impl Into<EntityId>,
        label: impl AsRef<str>,
        target_id: impl Into<EntityId>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            label: Self::normalize_label(label.as_ref()),
            target_id: target_id.into(),
            confidence: 1.0,
            provenance: Vec::new(),
        }
    }

    /// Lowercase and join words with underscores: "Works For" -> "works_for"
    pub fn normalize_label(label: &str) -> String {
        label
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Builder: set confidence
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Builder: add provenance
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        if !self.provenance.contains(&provenance) {
            self.provenance.push(provenance);
        }
        self
    }

    /// Identity of the triple; duplicates share a key.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.source_id, self.label, self.target_id)
    }
}

/// A connected region of the graph returned by a traversal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    /// Entities paired with their hop distance from the seed
    pub entities: Vec<(crate::Entity, usize)>,
    pub relationships: Vec<Relationship>,
}

impl Subgraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
