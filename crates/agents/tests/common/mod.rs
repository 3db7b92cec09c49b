//! Common test utilities: scripted and in-memory collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use kgfusion_agents::{ConnectedComponents, PipelineServices, ProcessedQuery, RetrievalChannel};
use kgfusion_core::{
    Channel, CompletionService, CoreError, Embedder, Entity, EntityId, GraphStore, IndexedText,
    KeywordIndex, Relationship, Result, RetrievalResult, ScoredText, Subgraph, VectorRecord,
    VectorStore,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ==========================================
// Completion
// ==========================================

/// Replies with the first rule whose needle occurs in the prompt
#[derive(Default)]
pub struct ScriptedCompletion {
    rules: Vec<(String, String)>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            fallback: "{}".to_string(),
            ..Default::default()
        }
    }

    pub fn on(mut self, needle: &str, reply: &str) -> Self {
        self.rules.push((needle.to_string(), reply.to_string()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone());
        Ok(reply)
    }
}

// ==========================================
// Embeddings
// ==========================================

/// Deterministic bag-of-words embedding, L2-normalized
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokens(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % self.dimension as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

/// An embedder whose service is down
pub struct UnavailableEmbedder;

#[async_trait]
impl Embedder for UnavailableEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(CoreError::Service("connection refused".into()))
    }
}

pub fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ==========================================
// Stores
// ==========================================

#[derive(Default)]
pub struct MemoryGraphStore {
    entities: Mutex<HashMap<EntityId, Entity>>,
    relationships: Mutex<Vec<Relationship>>,
}

impl MemoryGraphStore {
    pub fn entity_count(&self) -> usize {
        self.entities.lock().unwrap().len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.lock().unwrap().len()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert(&self, entities: &[Entity], relationships: &[Relationship]) -> Result<()> {
        let mut stored = self.entities.lock().unwrap();
        for entity in entities {
            stored.insert(entity.id.clone(), entity.clone());
        }
        let mut rels = self.relationships.lock().unwrap();
        for rel in relationships {
            match rels.iter_mut().find(|r| r.key() == rel.key()) {
                Some(existing) => *existing = rel.clone(),
                None => rels.push(rel.clone()),
            }
        }
        Ok(())
    }

    async fn traverse(&self, seed: &EntityId, depth: usize) -> Result<Subgraph> {
        let entities = self.entities.lock().unwrap();
        let rels = self.relationships.lock().unwrap();
        let Some(start) = entities.get(seed) else {
            return Ok(Subgraph::default());
        };

        let mut subgraph = Subgraph::default();
        let mut seen: HashSet<EntityId> = HashSet::from([seed.clone()]);
        let mut queue = VecDeque::from([(start.id.clone(), 0usize)]);
        subgraph.entities.push((start.clone(), 0));
        let mut edges: HashSet<String> = HashSet::new();

        while let Some((id, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for rel in rels.iter() {
                let next = if rel.source_id == id {
                    &rel.target_id
                } else if rel.target_id == id {
                    &rel.source_id
                } else {
                    continue;
                };
                if edges.insert(rel.key()) {
                    subgraph.relationships.push(rel.clone());
                }
                if seen.insert(next.clone()) {
                    if let Some(entity) = entities.get(next) {
                        subgraph.entities.push((entity.clone(), hops + 1));
                        queue.push_back((next.clone(), hops + 1));
                    }
                }
            }
        }
        Ok(subgraph)
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, Vec<VectorRecord>>>,
}

impl MemoryVectorStore {
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map_or(0, Vec::len)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let stored = collections.entry(collection.to_string()).or_default();
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record);
        }
        Ok(())
    }

    async fn search(&self, collection: &str, query: &[f32], top_k: usize) -> Result<Vec<ScoredText>> {
        let collections = self.collections.lock().unwrap();
        let mut hits: Vec<ScoredText> = collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|r| ScoredText {
                        id: r.id.clone(),
                        content: r.content.clone(),
                        score: cosine(query, &r.vector),
                        metadata: r.metadata.clone(),
                    })
                    .filter(|hit| hit.score > 0.0)
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Scores by the number of query terms a document contains
#[derive(Default)]
pub struct MemoryKeywordIndex {
    documents: Mutex<Vec<IndexedText>>,
}

impl MemoryKeywordIndex {
    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }
}

#[async_trait]
impl KeywordIndex for MemoryKeywordIndex {
    async fn add(&self, documents: Vec<IndexedText>) -> Result<()> {
        self.documents.lock().unwrap().extend(documents);
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredText>> {
        let terms = tokens(query);
        let documents = self.documents.lock().unwrap();
        let mut hits: Vec<ScoredText> = documents
            .iter()
            .filter_map(|doc| {
                let content = doc.content.to_lowercase();
                let score = terms.iter().filter(|t| content.contains(t.as_str())).count();
                (score > 0).then(|| ScoredText {
                    id: doc.id.clone(),
                    content: doc.content.clone(),
                    score: score as f32,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ==========================================
// Channels
// ==========================================

/// A channel returning fixed results
pub struct StaticChannel {
    pub channel: Channel,
    pub results: Vec<(String, f32)>,
}

impl StaticChannel {
    pub fn new(channel: Channel, results: &[(&str, f32)]) -> Arc<Self> {
        Arc::new(Self {
            channel,
            results: results.iter().map(|(c, s)| (c.to_string(), *s)).collect(),
        })
    }
}

#[async_trait]
impl RetrievalChannel for StaticChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn retrieve(&self, _query: &ProcessedQuery, top_k: usize) -> Result<Vec<RetrievalResult>> {
        Ok(self
            .results
            .iter()
            .take(top_k)
            .map(|(content, score)| RetrievalResult::from_channel(self.channel, content.clone(), *score))
            .collect())
    }
}

pub struct FailingChannel(pub Channel);

#[async_trait]
impl RetrievalChannel for FailingChannel {
    fn channel(&self) -> Channel {
        self.0
    }

    async fn retrieve(&self, _query: &ProcessedQuery, _top_k: usize) -> Result<Vec<RetrievalResult>> {
        Err(CoreError::Store("index offline".into()))
    }
}

/// Never answers within any reasonable deadline
pub struct StalledChannel(pub Channel);

#[async_trait]
impl RetrievalChannel for StalledChannel {
    fn channel(&self) -> Channel {
        self.0
    }

    async fn retrieve(&self, _query: &ProcessedQuery, _top_k: usize) -> Result<Vec<RetrievalResult>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

// ==========================================
// Wiring
// ==========================================

pub struct TestStores {
    pub graph: Arc<MemoryGraphStore>,
    pub vectors: Arc<MemoryVectorStore>,
    pub keywords: Arc<MemoryKeywordIndex>,
}

/// Services backed by in-memory stores and the given completion script
pub fn test_services(completion: Arc<ScriptedCompletion>) -> (PipelineServices, TestStores) {
    let stores = TestStores {
        graph: Arc::new(MemoryGraphStore::default()),
        vectors: Arc::new(MemoryVectorStore::default()),
        keywords: Arc::new(MemoryKeywordIndex::default()),
    };
    let services = PipelineServices {
        completion,
        embedder: Arc::new(HashingEmbedder::default()),
        graph: stores.graph.clone(),
        vectors: stores.vectors.clone(),
        keywords: stores.keywords.clone(),
        communities: Arc::new(ConnectedComponents),
    };
    (services, stores)
}
