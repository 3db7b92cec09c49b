//! Extraction and retrieval agents for kgfusion
//!
//! The write path turns documents into a knowledge graph:
//! - Chunking: channel-specific chunk profiles
//! - Schema: document analysis and schema synthesis
//! - Extraction: single-pass SPO extraction with resilient parsing
//! - Resolution: canonical entities and dynamic entity creation
//! - Assembly: deduplication, persistence and community detection
//!
//! The read path fuses graph, vector and keyword retrieval into one
//! ranked list.

pub mod analyzer;
pub mod assembler;
pub mod channels;
pub mod chunking;
pub mod community;
pub mod config;
pub mod extraction;
pub mod fusion;
pub mod heuristics;
pub mod inference;
pub mod parsing;
pub mod pipeline;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod similarity;
pub mod templates;
pub mod error;

pub use analyzer::LlmDocumentAnalyzer;
pub use assembler::{AssemblyMetrics, GraphAssembler, GraphDelta};
pub use channels::{GraphChannel, KeywordChannel, RetrievalChannel, VectorChannel};
pub use chunking::{ChunkStrategy, ChunkingPolicy};
pub use community::ConnectedComponents;
pub use config::{
    ChunkProfile, ChunkingConfig, ExtractionConfig, FusionConfig, FusionWeights, PipelineConfig,
    ResolverConfig,
};
pub use extraction::{ExtractionReport, SpoExtractor};
pub use fusion::{ChannelFailure, FailedChannel, FusionOutcome, RetrievalFusionEngine};
pub use inference::{CompletionClient, EmbeddingClient, Provider};
pub use parsing::{SpoExtraction, Triple};
pub use pipeline::{BuildReport, ChunkCounts, KnowledgePipeline, PipelineServices, QueryOutcome};
pub use query::{ProcessedQuery, QueryProcessor, QueryType};
pub use resolver::{EntityResolver, MatchKind, Mention, Rejection, Resolution, ResolutionOutcome};
pub use schema::SchemaSynthesizer;
pub use templates::{select_template, TemplateKind};
pub use error::{AgentError, Result};
