//! Graph assembly: deduplicate, check referential integrity, persist and
//! hand the result to community detection.

use kgfusion_core::{Community, CommunityDetector, Entity, GraphStore, Relationship};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Completeness signals recorded while assembling
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssemblyMetrics {
    pub entities_in: usize,
    /// Input entities folded into another record with the same id
    pub entities_merged: usize,
    pub relationships_in: usize,
    pub duplicate_relationships: usize,
    /// Relationships dropped because an endpoint is not in the entity set
    pub dangling_relationships: usize,
    /// Graph store failure, if persisting the delta failed
    pub store_error: Option<String>,
}

/// The finalized result of one assembly
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphDelta {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub communities: Vec<Community>,
    pub metrics: AssemblyMetrics,
}

impl GraphDelta {
    /// Whether every relationship's endpoints exist in the entity set
    pub fn is_consistent(&self) -> bool {
        let ids: HashSet<&str> = self.entities.iter().map(|e| e.id.as_str()).collect();
        self.relationships
            .iter()
            .all(|r| ids.contains(r.source_id.as_str()) && ids.contains(r.target_id.as_str()))
    }
}

pub struct GraphAssembler {
    store: Arc<dyn GraphStore>,
    detector: Arc<dyn CommunityDetector>,
}

impl GraphAssembler {
    pub fn new(store: Arc<dyn GraphStore>, detector: Arc<dyn CommunityDetector>) -> Self {
        Self { store, detector }
    }

    /// Build the delta, persist it and detect communities. Store failures
    /// are recorded in the metrics, never raised.
    #[instrument(skip_all, fields(entities = entities.len(), relationships = relationships.len()))]
    pub async fn assemble(
        &self,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
    ) -> GraphDelta {
        let mut delta = build_delta(entities, relationships);

        if let Err(e) = self.store.upsert(&delta.entities, &delta.relationships).await {
            warn!(error = %e, "Failed to persist graph delta");
            delta.metrics.store_error = Some(e.to_string());
        }
        delta.communities = self.detector.detect(&delta.entities, &delta.relationships);

        info!(
            entities = delta.entities.len(),
            relationships = delta.relationships.len(),
            communities = delta.communities.len(),
            dangling = delta.metrics.dangling_relationships,
            "Assembled graph delta"
        );
        delta
    }
}

/// Deduplicate entities by id and relationships by triple, and drop
/// relationships with a missing endpoint. Keeps first-seen order.
pub fn build_delta(entities: Vec<Entity>, relationships: Vec<Relationship>) -> GraphDelta {
    let mut metrics = AssemblyMetrics {
        entities_in: entities.len(),
        relationships_in: relationships.len(),
        ..Default::default()
    };

    let mut merged: Vec<Entity> = Vec::with_capacity(entities.len());
    let mut entity_index: HashMap<String, usize> = HashMap::new();
    for entity in entities {
        match entity_index.get(&entity.id) {
            Some(&idx) => {
                merged[idx].absorb(&entity);
                metrics.entities_merged += 1;
            }
            None => {
                entity_index.insert(entity.id.clone(), merged.len());
                merged.push(entity);
            }
        }
    }

    let mut kept: Vec<Relationship> = Vec::with_capacity(relationships.len());
    let mut relationship_index: HashMap<String, usize> = HashMap::new();
    for rel in relationships {
        if !entity_index.contains_key(&rel.source_id) || !entity_index.contains_key(&rel.target_id)
        {
            metrics.dangling_relationships += 1;
            continue;
        }
        match relationship_index.get(&rel.key()) {
            Some(&idx) => {
                let existing = &mut kept[idx];
                existing.confidence = existing.confidence.max(rel.confidence);
                for provenance in rel.provenance {
                    if !existing.provenance.contains(&provenance) {
                        existing.provenance.push(provenance);
                    }
                }
                metrics.duplicate_relationships += 1;
            }
            None => {
                relationship_index.insert(rel.key(), kept.len());
                kept.push(rel);
            }
        }
    }

    if metrics.dangling_relationships > 0 {
        warn!(
            dropped = metrics.dangling_relationships,
            "Dropped relationships with missing endpoints"
        );
    }

    GraphDelta {
        entities: merged,
        relationships: kept,
        communities: Vec::new(),
        metrics,
    }
}
