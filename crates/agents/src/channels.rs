//! Retrieval channels: graph traversal, dense vectors and keywords.
//!
//! Each channel returns its own ranked list with a channel-local score;
//! fusion combines them.

use crate::query::ProcessedQuery;
use async_trait::async_trait;
use kgfusion_core::{
    Channel, CoreError, Embedder, Entity, EntityId, GraphStore, KeywordIndex, Result,
    RetrievalResult, VectorStore, DOCUMENT_COLLECTION, GRAPH_COLLECTION,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Seed score for entities named in the query
const MENTION_SEED_SCORE: f32 = 1.0;
/// Seed score for plain query keywords
const KEYWORD_SEED_SCORE: f32 = 0.8;

#[async_trait]
pub trait RetrievalChannel: Send + Sync {
    fn channel(&self) -> Channel;

    async fn retrieve(&self, query: &ProcessedQuery, top_k: usize) -> Result<Vec<RetrievalResult>>;
}

/// Keep the best score per content, highest first, at most `top_k`
fn rank(results: Vec<RetrievalResult>, top_k: usize) -> Vec<RetrievalResult> {
    let mut best: Vec<RetrievalResult> = Vec::with_capacity(results.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for result in results {
        match index.get(&result.content_key()) {
            Some(&idx) if best[idx].score >= result.score => {}
            Some(&idx) => best[idx] = result,
            None => {
                index.insert(result.content_key(), best.len());
                best.push(result);
            }
        }
    }
    best.sort_by(|a, b| b.score.total_cmp(&a.score));
    best.truncate(top_k);
    best
}

// ==========================================
// Graph channel
// ==========================================

pub struct GraphChannel {
    store: Arc<dyn GraphStore>,
    /// Vector search over graph-derived entity embeddings, for extra seeds
    entity_vectors: Option<(Arc<dyn Embedder>, Arc<dyn VectorStore>)>,
    depth: usize,
}

impl GraphChannel {
    pub fn new(store: Arc<dyn GraphStore>, depth: usize) -> Self {
        Self {
            store,
            entity_vectors: None,
            depth,
        }
    }

    pub fn with_entity_vectors(
        mut self,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        self.entity_vectors = Some((embedder, vectors));
        self
    }

    /// Content-addressed ids of query mentions, keywords and search
    /// phrasings, plus vector hits over entity embeddings; best score per
    /// id, in discovery order
    async fn seeds(&self, query: &ProcessedQuery, top_k: usize) -> Vec<(EntityId, f32)> {
        let mut seeds: Vec<(EntityId, f32)> = Vec::new();
        let mut add = |id: EntityId, score: f32| match seeds.iter_mut().find(|(s, _)| *s == id) {
            Some(existing) => existing.1 = existing.1.max(score),
            None => seeds.push((id, score)),
        };

        for mention in &query.entities {
            add(Entity::id_for(mention), MENTION_SEED_SCORE);
        }
        for keyword in &query.keywords {
            add(Entity::id_for(keyword), KEYWORD_SEED_SCORE);
        }
        // Multi-word names typed without capitals only match as a phrase
        for phrase in &query.search_queries {
            add(Entity::id_for(phrase), KEYWORD_SEED_SCORE);
        }

        if let Some((embedder, vectors)) = &self.entity_vectors {
            for phrase in &query.search_queries {
                let hits = match embedder.embed(phrase).await {
                    Ok(vector) => vectors.search(GRAPH_COLLECTION, &vector, top_k).await,
                    Err(e) => Err(e),
                };
                match hits {
                    Ok(hits) => {
                        for hit in hits {
                            add(hit.id, hit.score.clamp(0.0, 1.0));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, phrase = %phrase, "Entity vector seeding failed");
                        break;
                    }
                }
            }
        }
        seeds
    }
}

#[async_trait]
impl RetrievalChannel for GraphChannel {
    fn channel(&self) -> Channel {
        Channel::Graph
    }

    #[instrument(skip(self, query), fields(query = %query.normalized))]
    async fn retrieve(&self, query: &ProcessedQuery, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let seeds = self.seeds(query, top_k).await;
        let mut results = Vec::new();
        let mut failures = 0usize;
        let mut last_error = None;

        for (seed, seed_score) in &seeds {
            let subgraph = match self.store.traverse(seed, self.depth).await {
                Ok(subgraph) => subgraph,
                Err(e) => {
                    failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            let hops: HashMap<&str, usize> = subgraph
                .entities
                .iter()
                .map(|(entity, hops)| (entity.id.as_str(), *hops))
                .collect();
            let names: HashMap<&str, &str> = subgraph
                .entities
                .iter()
                .map(|(entity, _)| (entity.id.as_str(), entity.name.as_str()))
                .collect();

            for (entity, distance) in &subgraph.entities {
                results.push(
                    RetrievalResult::from_channel(
                        Channel::Graph,
                        entity.summary_text(),
                        seed_score / (1.0 + *distance as f32),
                    )
                    .with_source_id(entity.id.clone())
                    .with_extra(json!({ "seed": seed, "hops": distance })),
                );
            }

            for rel in &subgraph.relationships {
                let distance = hops
                    .get(rel.source_id.as_str())
                    .max(hops.get(rel.target_id.as_str()))
                    .copied()
                    .unwrap_or(self.depth);
                let source = names.get(rel.source_id.as_str()).copied().unwrap_or(rel.source_id.as_str());
                let target = names.get(rel.target_id.as_str()).copied().unwrap_or(rel.target_id.as_str());
                results.push(
                    RetrievalResult::from_channel(
                        Channel::Graph,
                        format!("{source} {} {target}", rel.label.replace('_', " ")),
                        seed_score / (1.0 + distance as f32),
                    )
                    .with_source_id(rel.key())
                    .with_extra(json!({ "seed": seed, "hops": distance, "label": rel.label })),
                );
            }
        }

        // Only fail the channel when no seed could be traversed at all
        if let Some(e) = last_error {
            if failures == seeds.len() {
                return Err(e);
            }
            warn!(failures, seeds = seeds.len(), error = %e, "Some graph traversals failed");
        }

        debug!(seeds = seeds.len(), results = results.len(), "Graph channel retrieved");
        Ok(rank(results, top_k))
    }
}

// ==========================================
// Vector channel
// ==========================================

pub struct VectorChannel {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl VectorChannel {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }
}

#[async_trait]
impl RetrievalChannel for VectorChannel {
    fn channel(&self) -> Channel {
        Channel::Vector
    }

    #[instrument(skip(self, query), fields(query = %query.normalized))]
    async fn retrieve(&self, query: &ProcessedQuery, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let vector = self.embedder.embed(&query.normalized).await?;
        let hits = self.store.search(DOCUMENT_COLLECTION, &vector, top_k).await?;
        debug!(hits = hits.len(), "Vector channel retrieved");

        let results = hits
            .into_iter()
            .map(|hit| {
                RetrievalResult::from_channel(Channel::Vector, hit.content, hit.score)
                    .with_source_id(hit.id)
                    .with_extra(hit.metadata)
            })
            .collect();
        Ok(rank(results, top_k))
    }
}

// ==========================================
// Keyword channel
// ==========================================

pub struct KeywordChannel {
    index: Arc<dyn KeywordIndex>,
}

impl KeywordChannel {
    pub fn new(index: Arc<dyn KeywordIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl RetrievalChannel for KeywordChannel {
    fn channel(&self) -> Channel {
        Channel::Keyword
    }

    #[instrument(skip(self, query), fields(query = %query.normalized))]
    async fn retrieve(&self, query: &ProcessedQuery, top_k: usize) -> Result<Vec<RetrievalResult>> {
        let mut hits = Vec::new();
        let mut failures = 0usize;
        let mut last_error = None;
        for phrase in &query.search_queries {
            match self.index.search(phrase, top_k).await {
                Ok(found) => hits.extend(found),
                Err(e) => {
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            if failures == query.search_queries.len() {
                return Err(e);
            }
            warn!(failures, phrasings = query.search_queries.len(), error = %e, "Some keyword searches failed");
        }

        if hits.iter().any(|hit| !hit.score.is_finite()) {
            return Err(CoreError::Validation("keyword index returned a non-finite score".into()));
        }
        let max = hits.iter().map(|hit| hit.score).fold(0.0f32, f32::max);
        debug!(hits = hits.len(), max_score = max, "Keyword channel retrieved");

        let results = hits
            .into_iter()
            .map(|hit| {
                let score = if max > 0.0 { hit.score / max } else { 0.0 };
                RetrievalResult::from_channel(Channel::Keyword, hit.content, score)
                    .with_source_id(hit.id)
                    .with_extra(hit.metadata)
            })
            .collect();
        Ok(rank(results, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryProcessor;
    use kgfusion_core::{EntityOrigin, IndexedText, Relationship, ScoredText, Subgraph};
    use std::collections::{HashSet, VecDeque};

    /// Undirected BFS over a fixed edge list; traversals of `failing` seeds error
    struct FixedGraph {
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
        failing: HashSet<EntityId>,
    }

    impl FixedGraph {
        /// alpha - beta - gamma
        fn chain() -> Self {
            let names = ["Alpha", "Beta", "Gamma"];
            let entities: Vec<Entity> = names
                .iter()
                .map(|name| Entity::new(*name, "concept", EntityOrigin::Extracted))
                .collect();
            let relationships = vec![
                Relationship::new(entities[0].id.clone(), "uses", entities[1].id.clone()),
                Relationship::new(entities[1].id.clone(), "uses", entities[2].id.clone()),
            ];
            Self {
                entities,
                relationships,
                failing: HashSet::new(),
            }
        }

        fn failing_on(mut self, names: &[&str]) -> Self {
            self.failing = names.iter().map(|name| Entity::id_for(name)).collect();
            self
        }
    }

    #[async_trait]
    impl GraphStore for FixedGraph {
        async fn upsert(&self, _: &[Entity], _: &[Relationship]) -> Result<()> {
            Ok(())
        }

        async fn traverse(&self, seed: &EntityId, depth: usize) -> Result<Subgraph> {
            if self.failing.contains(seed) {
                return Err(CoreError::Store(format!("cannot traverse {seed}")));
            }
            let mut hops: HashMap<EntityId, usize> = HashMap::new();
            let mut queue = VecDeque::new();
            if self.entities.iter().any(|e| &e.id == seed) {
                hops.insert(seed.clone(), 0);
                queue.push_back(seed.clone());
            }
            while let Some(current) = queue.pop_front() {
                let distance = hops[&current];
                if distance == depth {
                    continue;
                }
                for rel in &self.relationships {
                    let next = if rel.source_id == current {
                        &rel.target_id
                    } else if rel.target_id == current {
                        &rel.source_id
                    } else {
                        continue;
                    };
                    if !hops.contains_key(next) {
                        hops.insert(next.clone(), distance + 1);
                        queue.push_back(next.clone());
                    }
                }
            }
            Ok(Subgraph {
                entities: self
                    .entities
                    .iter()
                    .filter_map(|e| hops.get(&e.id).map(|h| (e.clone(), *h)))
                    .collect(),
                relationships: self
                    .relationships
                    .iter()
                    .filter(|r| hops.contains_key(&r.source_id) && hops.contains_key(&r.target_id))
                    .cloned()
                    .collect(),
            })
        }
    }

    /// Returns the same hits for every query
    struct FixedHits(Vec<(&'static str, f32)>);

    #[async_trait]
    impl KeywordIndex for FixedHits {
        async fn add(&self, _: Vec<IndexedText>) -> Result<()> {
            Ok(())
        }

        async fn search(&self, _: &str, _: usize) -> Result<Vec<ScoredText>> {
            Ok(self
                .0
                .iter()
                .map(|(content, score)| ScoredText {
                    id: content.to_string(),
                    content: content.to_string(),
                    score: *score,
                    metadata: serde_json::Value::Null,
                })
                .collect())
        }
    }

    fn score_of(results: &[RetrievalResult], content: &str) -> f32 {
        results
            .iter()
            .find(|r| r.content == content)
            .map(|r| r.score)
            .unwrap_or_else(|| panic!("missing result {content:?}"))
    }

    #[test]
    fn test_rank_keeps_best_duplicate() {
        let results = vec![
            RetrievalResult::from_channel(Channel::Vector, "Alpha", 0.3),
            RetrievalResult::from_channel(Channel::Vector, "beta", 0.9),
            RetrievalResult::from_channel(Channel::Vector, " alpha ", 0.6),
            RetrievalResult::from_channel(Channel::Vector, "gamma", 0.1),
        ];
        let ranked = rank(results, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].content, "beta");
        assert_eq!(ranked[1].content, " alpha ");
        assert_eq!(ranked[1].score, 0.6);
    }

    #[tokio::test]
    async fn test_graph_scores_decay_with_hops() {
        let channel = GraphChannel::new(Arc::new(FixedGraph::chain()), 2);
        let query = QueryProcessor::new().process("Alpha");
        let results = channel.retrieve(&query, 10).await.unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(score_of(&results, "Alpha (concept)"), 1.0);
        assert_eq!(score_of(&results, "Beta (concept)"), 0.5);
        assert!((score_of(&results, "Gamma (concept)") - 1.0 / 3.0).abs() < 1e-6);
        // A relationship sits as far out as its farther endpoint
        assert_eq!(score_of(&results, "Alpha uses Beta"), 0.5);
        assert!((score_of(&results, "Beta uses Gamma") - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(results[0].content, "Alpha (concept)");
    }

    #[tokio::test]
    async fn test_graph_depth_limits_traversal() {
        let channel = GraphChannel::new(Arc::new(FixedGraph::chain()), 1);
        let query = QueryProcessor::new().process("Alpha");
        let results = channel.retrieve(&query, 10).await.unwrap();

        let contents: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["Alpha (concept)", "Beta (concept)", "Alpha uses Beta"]);
    }

    #[tokio::test]
    async fn test_graph_survives_partial_seed_failure() {
        let store = FixedGraph::chain().failing_on(&["Beta"]);
        let channel = GraphChannel::new(Arc::new(store), 1);
        let query = QueryProcessor::new().process("Alpha and Beta");
        let results = channel.retrieve(&query, 10).await.unwrap();

        assert_eq!(score_of(&results, "Alpha (concept)"), 1.0);
        assert_eq!(score_of(&results, "Beta (concept)"), 0.5);
    }

    #[tokio::test]
    async fn test_graph_fails_when_every_seed_fails() {
        let query = QueryProcessor::new().process("Alpha and Beta");
        let every_seed: Vec<String> = query
            .entities
            .iter()
            .chain(&query.keywords)
            .chain(&query.search_queries)
            .cloned()
            .collect();
        let names: Vec<&str> = every_seed.iter().map(String::as_str).collect();
        let store = FixedGraph::chain().failing_on(&names);
        let channel = GraphChannel::new(Arc::new(store), 1);

        let err = channel.retrieve(&query, 10).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[tokio::test]
    async fn test_graph_matches_lowercase_phrase() {
        let mut store = FixedGraph::chain();
        store
            .entities
            .push(Entity::new("Deep Learning", "concept", EntityOrigin::Extracted));
        let channel = GraphChannel::new(Arc::new(store), 0);

        let query = QueryProcessor::new().process("deep learning");
        assert!(query.entities.is_empty());
        let results = channel.retrieve(&query, 10).await.unwrap();
        assert_eq!(score_of(&results, "Deep Learning (concept)"), KEYWORD_SEED_SCORE);
    }

    #[tokio::test]
    async fn test_keyword_scores_divided_by_list_max() {
        let channel = KeywordChannel::new(Arc::new(FixedHits(vec![("first", 4.0), ("second", 2.0)])));
        let query = QueryProcessor::new().process("PyTorch training");
        let results = channel.retrieve(&query, 10).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(score_of(&results, "first"), 1.0);
        assert_eq!(score_of(&results, "second"), 0.5);
    }

    #[tokio::test]
    async fn test_keyword_zero_scores_stay_zero() {
        let channel = KeywordChannel::new(Arc::new(FixedHits(vec![("first", 0.0), ("second", 0.0)])));
        let query = QueryProcessor::new().process("PyTorch");
        let results = channel.retrieve(&query, 10).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[tokio::test]
    async fn test_keyword_rejects_non_finite_scores() {
        let channel =
            KeywordChannel::new(Arc::new(FixedHits(vec![("first", 4.0), ("second", f32::NAN)])));
        let query = QueryProcessor::new().process("PyTorch");
        let err = channel.retrieve(&query, 10).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
