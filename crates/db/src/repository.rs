//! Repository pattern for database operations

use crate::{DbConnection, DbError, Result};
use async_trait::async_trait;
use kgfusion_core::{
    CoreError, Entity, EntityId, EntityOrigin, GraphStore, IndexedText, KeywordIndex, Provenance,
    Relationship, ScoredText, Subgraph, VectorRecord, VectorStore,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use surrealdb::RecordId;
use tracing::{debug, instrument};

/// Keyword queries are split into at most this many terms
const MAX_QUERY_TERMS: usize = 8;

const ENTITY_FIELDS: &str =
    "meta::id(id) AS id, name, canonical_name, entity_type, description, confidence, origin, provenance";

const RELATIONSHIP_FIELDS: &str = "source_id, label, target_id, confidence, provenance";

/// Repository for all database operations
#[derive(Clone)]
pub struct Repository {
    db: DbConnection,
}

impl Repository {
    /// Create a new repository
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    // ==========================================
    // GRAPH OPERATIONS
    // ==========================================

    /// Upsert entities and relationships, folding each into any stored copy.
    ///
    /// Records are keyed by their content-addressed ids, so writing the same
    /// delta twice leaves the store unchanged.
    #[instrument(skip(self, entities, relationships), fields(entities = entities.len(), relationships = relationships.len()))]
    pub async fn upsert_graph(&self, entities: &[Entity], relationships: &[Relationship]) -> Result<()> {
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        let stored: HashMap<EntityId, Entity> = self
            .get_entities(&ids)
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        for entity in entities {
            let mut merged = entity.clone();
            if let Some(existing) = stored.get(&entity.id) {
                merged.absorb(existing);
            }
            self.db
                .query("UPSERT type::thing('entity', $id) CONTENT $row")
                .bind(("id", merged.id.clone()))
                .bind(("row", EntityRow::from(merged)))
                .await?
                .check()?;
        }

        let keys: Vec<String> = relationships.iter().map(Relationship::key).collect();
        let stored: HashMap<String, Relationship> = self
            .get_relationships(&keys)
            .await?
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();

        for relationship in relationships {
            let key = relationship.key();
            let mut merged = relationship.clone();
            if let Some(existing) = stored.get(&key) {
                merged.confidence = merged.confidence.max(existing.confidence);
                for provenance in &existing.provenance {
                    if !merged.provenance.contains(provenance) {
                        merged.provenance.push(provenance.clone());
                    }
                }
            }
            self.db
                .query("UPSERT type::thing('relationship', $key) CONTENT $row")
                .bind(("key", key))
                .bind(("row", merged))
                .await?
                .check()?;
        }

        debug!("Graph upsert complete");
        Ok(())
    }

    /// Entities with the given ids; unknown ids are skipped
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<RecordId> = ids
            .iter()
            .map(|id| RecordId::from_table_key("entity", id.clone()))
            .collect();

        let rows: Vec<Entity> = self
            .db
            .query(format!("SELECT {ENTITY_FIELDS} FROM entity WHERE id IN $records"))
            .bind(("records", records))
            .await?
            .take(0)?;
        Ok(rows)
    }

    /// Every stored entity, used to seed resolution in a new process
    #[instrument(skip(self))]
    pub async fn load_entities(&self) -> Result<Vec<Entity>> {
        let rows: Vec<Entity> = self
            .db
            .query(format!("SELECT {ENTITY_FIELDS} FROM entity ORDER BY canonical_name"))
            .await?
            .take(0)?;
        Ok(rows)
    }

    async fn get_relationships(&self, keys: &[String]) -> Result<Vec<Relationship>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let records: Vec<RecordId> = keys
            .iter()
            .map(|key| RecordId::from_table_key("relationship", key.clone()))
            .collect();

        let rows: Vec<Relationship> = self
            .db
            .query(format!("SELECT {RELATIONSHIP_FIELDS} FROM relationship WHERE id IN $records"))
            .bind(("records", records))
            .await?
            .take(0)?;
        Ok(rows)
    }

    /// Relationships touching any of the given entities, in either direction
    async fn incident_relationships(&self, ids: &[EntityId]) -> Result<Vec<Relationship>> {
        let mut rows: Vec<Relationship> = self
            .db
            .query(format!(
                "SELECT {RELATIONSHIP_FIELDS} FROM relationship WHERE source_id IN $ids OR target_id IN $ids"
            ))
            .bind(("ids", ids.to_vec()))
            .await?
            .take(0)?;
        rows.sort_by_key(Relationship::key);
        Ok(rows)
    }

    /// Breadth-first neighbourhood of `seed`, edges followed both ways
    #[instrument(skip(self))]
    pub async fn traverse_graph(&self, seed: &EntityId, depth: usize) -> Result<Subgraph> {
        let Some(start) = self.get_entities(std::slice::from_ref(seed)).await?.pop() else {
            return Ok(Subgraph::default());
        };

        let mut subgraph = Subgraph::default();
        let mut seen: HashSet<EntityId> = HashSet::from([start.id.clone()]);
        let mut edges: HashSet<String> = HashSet::new();
        let mut frontier = vec![start.id.clone()];
        subgraph.entities.push((start, 0));

        for hops in 1..=depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for rel in self.incident_relationships(&frontier).await? {
                for endpoint in [&rel.source_id, &rel.target_id] {
                    if seen.insert(endpoint.clone()) {
                        next.push(endpoint.clone());
                    }
                }
                if edges.insert(rel.key()) {
                    subgraph.relationships.push(rel);
                }
            }

            let mut found: HashMap<EntityId, Entity> = self
                .get_entities(&next)
                .await?
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();
            for id in &next {
                if let Some(entity) = found.remove(id) {
                    subgraph.entities.push((entity, hops));
                }
            }
            frontier = next;
        }

        debug!(
            entities = subgraph.entities.len(),
            relationships = subgraph.relationships.len(),
            "Traversal complete"
        );
        Ok(subgraph)
    }

    // ==========================================
    // VECTOR OPERATIONS
    // ==========================================

    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn upsert_vectors(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            let key = format!("{collection}/{}", record.id);
            let row = VectorRow {
                collection: collection.to_string(),
                record_key: record.id,
                content: record.content,
                embedding: record.vector,
                metadata: record.metadata,
            };
            self.db
                .query("UPSERT type::thing('vector_record', $key) CONTENT $row")
                .bind(("key", key))
                .bind(("row", row))
                .await?
                .check()?;
        }
        Ok(())
    }

    /// Cosine similarity search within one collection
    #[instrument(skip(self, embedding))]
    pub async fn vector_search(
        &self,
        collection: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredText>> {
        if embedding.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let results: Vec<ScoredText> = self
            .db
            .query(
                r#"
                SELECT
                    record_key AS id,
                    content,
                    metadata,
                    vector::similarity::cosine(embedding, $embedding) AS score
                FROM vector_record
                WHERE collection = $collection
                ORDER BY score DESC
                LIMIT $limit
            "#,
            )
            .bind(("collection", collection.to_string()))
            .bind(("embedding", embedding.to_vec()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        Ok(results)
    }

    // ==========================================
    // KEYWORD OPERATIONS
    // ==========================================

    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn add_keyword_docs(&self, documents: Vec<IndexedText>) -> Result<()> {
        for document in documents {
            let row = KeywordRow {
                doc_key: document.id.clone(),
                content: document.content,
                metadata: document.metadata,
            };
            self.db
                .query("UPSERT type::thing('keyword_doc', $key) CONTENT $row")
                .bind(("key", document.id))
                .bind(("row", row))
                .await?
                .check()?;
        }
        Ok(())
    }

    /// BM25 search; a document's score is summed over the query terms it matches
    #[instrument(skip(self))]
    pub async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ScoredText>> {
        let mut merged: Vec<ScoredText> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for term in query_terms(query) {
            let hits: Vec<ScoredText> = self
                .db
                .query(
                    r#"
                    SELECT
                        doc_key AS id,
                        content,
                        metadata,
                        search::score(0) AS score
                    FROM keyword_doc
                    WHERE content @0@ $term
                    ORDER BY score DESC
                    LIMIT $limit
                "#,
                )
                .bind(("term", term))
                .bind(("limit", limit))
                .await?
                .take(0)?;

            for hit in hits {
                match positions.get(&hit.id) {
                    Some(&i) => merged[i].score += hit.score,
                    None => {
                        positions.insert(hit.id.clone(), merged.len());
                        merged.push(hit);
                    }
                }
            }
        }

        merged.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.truncate(limit);
        Ok(merged)
    }

    // ==========================================
    // STATS
    // ==========================================

    /// Get database statistics
    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<DbStats> {
        let stats: Vec<DbStats> = self
            .db
            .query(
                r#"
                RETURN {
                    entity_count: (SELECT count() FROM entity GROUP ALL)[0].count ?? 0,
                    relationship_count: (SELECT count() FROM relationship GROUP ALL)[0].count ?? 0,
                    vector_count: (SELECT count() FROM vector_record GROUP ALL)[0].count ?? 0,
                    keyword_count: (SELECT count() FROM keyword_doc GROUP ALL)[0].count ?? 0
                }
            "#,
            )
            .await?
            .take(0)?;

        stats.into_iter().next().ok_or_else(|| DbError::QueryFailed("stats".into()))
    }
}

/// Distinct lowercase terms carrying at least one alphanumeric character
fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation()) {
        let term = raw.to_lowercase();
        if term.chars().any(char::is_alphanumeric) && !terms.contains(&term) {
            terms.push(term);
        }
        if terms.len() == MAX_QUERY_TERMS {
            break;
        }
    }
    terms
}

// ==========================================
// STORE TRAITS
// ==========================================

#[async_trait]
impl GraphStore for Repository {
    async fn upsert(&self, entities: &[Entity], relationships: &[Relationship]) -> kgfusion_core::Result<()> {
        self.upsert_graph(entities, relationships).await.map_err(CoreError::from)
    }

    async fn traverse(&self, seed: &EntityId, depth: usize) -> kgfusion_core::Result<Subgraph> {
        self.traverse_graph(seed, depth).await.map_err(CoreError::from)
    }
}

#[async_trait]
impl VectorStore for Repository {
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> kgfusion_core::Result<()> {
        self.upsert_vectors(collection, records).await.map_err(CoreError::from)
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> kgfusion_core::Result<Vec<ScoredText>> {
        self.vector_search(collection, query_vector, top_k)
            .await
            .map_err(CoreError::from)
    }
}

#[async_trait]
impl KeywordIndex for Repository {
    async fn add(&self, documents: Vec<IndexedText>) -> kgfusion_core::Result<()> {
        self.add_keyword_docs(documents).await.map_err(CoreError::from)
    }

    async fn search(&self, query: &str, top_k: usize) -> kgfusion_core::Result<Vec<ScoredText>> {
        self.keyword_search(query, top_k).await.map_err(CoreError::from)
    }
}

// ==========================================
// ROW TYPES
// ==========================================

/// Stored entity body; the id lives in the record key
#[derive(Debug, Clone, Serialize)]
struct EntityRow {
    name: String,
    canonical_name: String,
    entity_type: String,
    description: String,
    confidence: f32,
    origin: EntityOrigin,
    provenance: Vec<Provenance>,
}

impl From<Entity> for EntityRow {
    fn from(entity: Entity) -> Self {
        Self {
            name: entity.name,
            canonical_name: entity.canonical_name,
            entity_type: entity.entity_type,
            description: entity.description,
            confidence: entity.confidence,
            origin: entity.origin,
            provenance: entity.provenance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct VectorRow {
    collection: String,
    record_key: String,
    content: String,
    embedding: Vec<f32>,
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct KeywordRow {
    doc_key: String,
    content: String,
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    #[serde(default)]
    pub entity_count: u64,
    #[serde(default)]
    pub relationship_count: u64,
    #[serde(default)]
    pub vector_count: u64,
    #[serde(default)]
    pub keyword_count: u64,
}
