//! The two operations offered upward: building knowledge from documents
//! and answering queries.

use crate::analyzer::LlmDocumentAnalyzer;
use crate::assembler::{GraphAssembler, GraphDelta};
use crate::channels::{GraphChannel, KeywordChannel, VectorChannel};
use crate::chunking::ChunkingPolicy;
use crate::config::PipelineConfig;
use crate::extraction::SpoExtractor;
use crate::fusion::{FailedChannel, RetrievalFusionEngine};
use crate::query::ProcessedQuery;
use crate::resolver::EntityResolver;
use crate::schema::SchemaSynthesizer;
use crate::Result;
use chrono::{DateTime, Utc};
use kgfusion_core::{
    Channel, Chunk, CommunityDetector, CompletionService, Document, DocumentAnalyzer, Embedder,
    Entity, GraphStore, IndexedText, KeywordIndex, RetrievalResult, Schema, VectorRecord,
    VectorStore, DOCUMENT_COLLECTION, GRAPH_COLLECTION,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// External collaborators the pipeline is wired to
#[derive(Clone)]
pub struct PipelineServices {
    pub completion: Arc<dyn CompletionService>,
    pub embedder: Arc<dyn Embedder>,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub keywords: Arc<dyn KeywordIndex>,
    pub communities: Arc<dyn CommunityDetector>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub graph: usize,
    pub vector: usize,
    pub keyword: usize,
}

/// Outcome of one `build_knowledge` run with its quality signals
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub documents: usize,
    pub chunks: ChunkCounts,
    pub batches: usize,
    pub failed_batches: usize,
    pub parse_failures: usize,
    /// Graph chunks whose extraction was skipped
    pub skipped_chunks: Vec<String>,
    pub dynamic_entities: usize,
    /// Triples dropped in resolution plus relationships dropped as dangling
    pub dropped_relationships: usize,
    pub off_schema_relationships: usize,
    pub vectors_indexed: usize,
    pub keyword_docs_indexed: usize,
    /// Indexing and persistence failures, recorded instead of raised
    pub index_errors: Vec<String>,
    pub delta: GraphDelta,
}

impl BuildReport {
    fn started() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            documents: 0,
            chunks: ChunkCounts::default(),
            batches: 0,
            failed_batches: 0,
            parse_failures: 0,
            skipped_chunks: Vec::new(),
            dynamic_entities: 0,
            dropped_relationships: 0,
            off_schema_relationships: 0,
            vectors_indexed: 0,
            keyword_docs_indexed: 0,
            index_errors: Vec::new(),
            delta: GraphDelta::default(),
        }
    }

    /// Whether anything was skipped, dropped or failed
    pub fn is_degraded(&self) -> bool {
        self.failed_batches > 0
            || self.parse_failures > 0
            || self.dropped_relationships > 0
            || !self.index_errors.is_empty()
            || self.delta.metrics.store_error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query: ProcessedQuery,
    pub results: Vec<RetrievalResult>,
    pub failed_channels: Vec<FailedChannel>,
}

pub struct KnowledgePipeline {
    config: PipelineConfig,
    base_schema: Schema,
    chunker: ChunkingPolicy,
    synthesizer: SchemaSynthesizer,
    analyzer: Arc<dyn DocumentAnalyzer>,
    extractor: SpoExtractor,
    /// Shared known-entity set; resolution is single-writer
    resolver: Arc<Mutex<EntityResolver>>,
    assembler: GraphAssembler,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<dyn KeywordIndex>,
    fusion: RetrievalFusionEngine,
}

impl KnowledgePipeline {
    pub fn new(config: PipelineConfig, services: PipelineServices) -> Result<Self> {
        config.validate()?;

        let graph_channel = GraphChannel::new(Arc::clone(&services.graph), config.fusion.graph_depth)
            .with_entity_vectors(Arc::clone(&services.embedder), Arc::clone(&services.vectors));
        let fusion = RetrievalFusionEngine::new(config.fusion.clone())
            .with_channel(Arc::new(graph_channel))
            .with_channel(Arc::new(VectorChannel::new(
                Arc::clone(&services.embedder),
                Arc::clone(&services.vectors),
            )))
            .with_channel(Arc::new(KeywordChannel::new(Arc::clone(&services.keywords))));

        Ok(Self {
            base_schema: Schema::base(),
            chunker: ChunkingPolicy::new(config.chunking.clone())?,
            synthesizer: SchemaSynthesizer::new(),
            analyzer: Arc::new(LlmDocumentAnalyzer::new(Arc::clone(&services.completion))),
            extractor: SpoExtractor::new(services.completion, config.extraction.clone()),
            resolver: Arc::new(Mutex::new(EntityResolver::new(config.resolver.clone()))),
            assembler: GraphAssembler::new(services.graph, services.communities),
            embedder: services.embedder,
            vectors: services.vectors,
            keywords: services.keywords,
            fusion,
            config,
        })
    }

    /// Builder: replace the generic schema documents start from
    pub fn with_base_schema(mut self, schema: Schema) -> Self {
        self.base_schema = schema;
        self
    }

    /// Builder: seed resolution with entities persisted by earlier builds
    pub fn with_known_entities(mut self, entities: impl IntoIterator<Item = Entity>) -> Self {
        let resolver = EntityResolver::new(self.config.resolver.clone()).with_known(entities);
        self.resolver = Arc::new(Mutex::new(resolver));
        self
    }

    /// Builder: replace the completion-backed document analyzer
    pub fn with_analyzer(mut self, analyzer: Arc<dyn DocumentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Entities known to the resolver, in creation order
    pub async fn known_entities(&self) -> Vec<Entity> {
        self.resolver.lock().await.entities().to_vec()
    }

    /// Extract, resolve and assemble a graph from `documents`, then index
    /// their vector and keyword chunks. Never fails: every degradation is
    /// recorded in the report.
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub async fn build_knowledge(&self, documents: &[Document]) -> BuildReport {
        let mut report = BuildReport::started();
        let mut touched: Vec<String> = Vec::new();
        let mut relationships = Vec::new();

        for document in documents {
            report.documents += 1;
            if document.is_blank() {
                warn!(document = %document.id, "Skipping blank document");
                continue;
            }

            let schema = self
                .synthesizer
                .synthesize_for(self.analyzer.as_ref(), document, &self.base_schema)
                .await;
            let chunks = self.chunker.chunk(document, Channel::Graph);
            report.chunks.graph += chunks.len();

            let extraction = self.extractor.extract(&chunks, &schema).await;
            report.batches += extraction.batches;
            report.failed_batches += extraction.failed_batches;
            report.parse_failures += extraction.parse_failures;
            report.skipped_chunks.extend(extraction.skipped_chunks);

            // Serialized: one writer extends the known-entity set
            let mut resolver = self.resolver.lock().await;
            for (pos, spo) in &extraction.extractions {
                let outcome = resolver.resolve_extraction(
                    spo,
                    &chunks[*pos],
                    &schema,
                    self.config.extraction.enforce_relation_types,
                );
                report.dynamic_entities += outcome.dynamic_created;
                report.dropped_relationships += outcome.dropped_relationships;
                report.off_schema_relationships += outcome.off_schema_relationships;
                for id in outcome.entity_ids {
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                }
                relationships.extend(outcome.relationships);
            }
        }

        let entities: Vec<Entity> = {
            let resolver = self.resolver.lock().await;
            touched.iter().filter_map(|id| resolver.get(id).cloned()).collect()
        };
        let delta = self.assembler.assemble(entities, relationships).await;
        report.dropped_relationships += delta.metrics.dangling_relationships;
        if let Some(e) = &delta.metrics.store_error {
            report.index_errors.push(format!("graph store: {e}"));
        }

        self.index_entities(&delta.entities, &mut report).await;
        for document in documents.iter().filter(|d| !d.is_blank()) {
            self.index_document(document, &mut report).await;
        }

        report.delta = delta;
        report.finished_at = Utc::now();
        info!(
            documents = report.documents,
            entities = report.delta.entities.len(),
            relationships = report.delta.relationships.len(),
            dynamic = report.dynamic_entities,
            dropped = report.dropped_relationships,
            vectors = report.vectors_indexed,
            keyword_docs = report.keyword_docs_indexed,
            "Knowledge build finished"
        );
        report
    }

    /// Rank results for `text` across all channels
    #[instrument(skip(self))]
    pub async fn query(&self, text: &str) -> QueryOutcome {
        let query = crate::query::QueryProcessor::new().process(text);
        let outcome = self.fusion.retrieve_processed(&query).await;
        QueryOutcome {
            query,
            results: outcome.results,
            failed_channels: outcome.failed_channels,
        }
    }

    /// Embed entity summaries into the graph-derived collection
    async fn index_entities(&self, entities: &[Entity], report: &mut BuildReport) {
        if entities.is_empty() {
            return;
        }
        let texts: Vec<String> = entities.iter().map(Entity::summary_text).collect();
        let records = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => entities
                .iter()
                .zip(texts)
                .zip(vectors)
                .map(|((entity, content), vector)| VectorRecord {
                    id: entity.id.clone(),
                    content,
                    vector,
                    metadata: json!({ "name": entity.name, "type": entity.entity_type }),
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(error = %e, "Failed to embed entities");
                report.index_errors.push(format!("entity embeddings: {e}"));
                return;
            }
        };
        let count = records.len();
        match self.vectors.upsert(GRAPH_COLLECTION, records).await {
            Ok(()) => report.vectors_indexed += count,
            Err(e) => {
                warn!(error = %e, "Failed to store entity vectors");
                report.index_errors.push(format!("entity vectors: {e}"));
            }
        }
    }

    async fn index_document(&self, document: &Document, report: &mut BuildReport) {
        let vector_chunks = self.chunker.chunk(document, Channel::Vector);
        report.chunks.vector += vector_chunks.len();
        if !vector_chunks.is_empty() {
            let texts: Vec<String> = vector_chunks.iter().map(|c| c.content.clone()).collect();
            let stored = match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    let records: Vec<VectorRecord> = vector_chunks
                        .iter()
                        .zip(vectors)
                        .map(|(chunk, vector)| VectorRecord {
                            id: chunk.id.clone(),
                            content: chunk.content.clone(),
                            vector,
                            metadata: chunk_metadata(document, chunk),
                        })
                        .collect();
                    let count = records.len();
                    self.vectors
                        .upsert(DOCUMENT_COLLECTION, records)
                        .await
                        .map(|()| count)
                }
                Err(e) => Err(e),
            };
            match stored {
                Ok(count) => report.vectors_indexed += count,
                Err(e) => {
                    warn!(document = %document.id, error = %e, "Failed to index vector chunks");
                    report.index_errors.push(format!("{} vectors: {e}", document.id));
                }
            }
        }

        let keyword_chunks = self.chunker.chunk(document, Channel::Keyword);
        report.chunks.keyword += keyword_chunks.len();
        if keyword_chunks.is_empty() {
            return;
        }
        let texts: Vec<IndexedText> = keyword_chunks
            .iter()
            .map(|chunk| IndexedText {
                id: chunk.id.clone(),
                content: chunk.content.clone(),
                metadata: chunk_metadata(document, chunk),
            })
            .collect();
        let count = texts.len();
        match self.keywords.add(texts).await {
            Ok(()) => report.keyword_docs_indexed += count,
            Err(e) => {
                warn!(document = %document.id, error = %e, "Failed to index keyword chunks");
                report.index_errors.push(format!("{} keywords: {e}", document.id));
            }
        }
    }
}

fn chunk_metadata(document: &Document, chunk: &Chunk) -> serde_json::Value {
    json!({
        "document_id": chunk.document_id,
        "title": document.title,
        "channel": chunk.channel,
        "index": chunk.index,
        "offset": chunk.offset,
    })
}
