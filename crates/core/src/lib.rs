//! Core domain types for kgfusion
//!
//! This crate defines the fundamental data structures used throughout
//! the workspace: documents and chunks, extraction schemas, entities,
//! relationships and retrieval results, plus the interfaces of the
//! external services the pipeline depends on.

pub mod document;
pub mod schema;
pub mod entity;
pub mod relationship;
pub mod retrieval;
pub mod traits;
pub mod error;

pub use document::{Channel, Chunk, Document};
pub use schema::{DocumentProfile, DomainInfo, Schema, SchemaExtension};
pub use entity::{Entity, EntityId, EntityOrigin, Provenance, DEFAULT_ENTITY_TYPE};
pub use relationship::{Relationship, Subgraph};
pub use retrieval::{ChannelScores, ResultMetadata, RetrievalResult};
pub use traits::{
    Community, CommunityDetector, CompletionService, DocumentAnalyzer, Embedder, GraphStore,
    IndexedText, KeywordIndex, ScoredText, VectorRecord, VectorStore, DOCUMENT_COLLECTION,
    GRAPH_COLLECTION,
};
pub use error::{CoreError, Result};
