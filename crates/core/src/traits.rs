//! Interfaces of the external collaborators the pipeline talks to.
//!
//! Implementations live elsewhere: HTTP inference clients in the agents
//! crate, SurrealDB-backed stores in the db crate.

use crate::{Document, DocumentProfile, Entity, EntityId, Relationship, Result, Subgraph};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Vector collection holding document chunks
pub const DOCUMENT_COLLECTION: &str = "documents";

/// Vector collection holding graph-derived (entity) vectors
pub const GRAPH_COLLECTION: &str = "graph_entities";

/// Text completion, treated as an opaque text-in/text-out service
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Dense embeddings for queries and passages
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Best-effort document analysis feeding schema synthesis
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    async fn analyze(&self, document: &Document) -> Result<DocumentProfile>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert(&self, entities: &[Entity], relationships: &[Relationship]) -> Result<()>;

    /// Breadth-first neighbourhood of `seed` up to `depth` hops.
    /// An unknown seed yields an empty subgraph.
    async fn traverse(&self, seed: &EntityId, depth: usize) -> Result<Subgraph>;
}

/// A text record with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A text record to add to the keyword index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedText {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A search hit from a vector store or keyword index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredText {
    pub id: String,
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Vector store scoped by named collections
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()>;

    /// Most similar records first
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredText>>;
}

/// Inverted keyword index
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn add(&self, documents: Vec<IndexedText>) -> Result<()>;

    /// Best matches first
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredText>>;
}

/// A group of entities assigned to the same community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: usize,
    pub members: Vec<EntityId>,
}

/// Community detection as a pure function over an assembled graph
pub trait CommunityDetector: Send + Sync {
    fn detect(&self, entities: &[Entity], relationships: &[Relationship]) -> Vec<Community>;
}
