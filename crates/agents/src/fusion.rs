//! Multi-channel retrieval fusion.
//!
//! The query is fanned out to the configured channels concurrently under
//! one deadline. Results are deduplicated by normalized content, each
//! content keeps its best clamped score per channel, and the combined
//! score is the weighted sum. Weights of channels that failed, timed out
//! or are not configured are redistributed proportionally.

use crate::channels::RetrievalChannel;
use crate::config::{FusionConfig, FusionWeights};
use crate::query::{ProcessedQuery, QueryProcessor};
use kgfusion_core::{Channel, RetrievalResult};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Why a channel contributed nothing to a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ChannelFailure {
    Error(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedChannel {
    pub channel: Channel,
    pub failure: ChannelFailure,
}

/// Ranked results plus the quality signals of one query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusionOutcome {
    pub results: Vec<RetrievalResult>,
    pub failed_channels: Vec<FailedChannel>,
    /// Weights actually applied after renormalization
    pub weights: FusionWeights,
}

pub struct RetrievalFusionEngine {
    graph: Option<Arc<dyn RetrievalChannel>>,
    vector: Option<Arc<dyn RetrievalChannel>>,
    keyword: Option<Arc<dyn RetrievalChannel>>,
    processor: QueryProcessor,
    config: FusionConfig,
}

impl RetrievalFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            graph: None,
            vector: None,
            keyword: None,
            processor: QueryProcessor::new(),
            config,
        }
    }

    /// Register a channel in the slot matching its [`Channel`]
    pub fn with_channel(mut self, channel: Arc<dyn RetrievalChannel>) -> Self {
        let slot = match channel.channel() {
            Channel::Graph => &mut self.graph,
            Channel::Vector => &mut self.vector,
            Channel::Keyword => &mut self.keyword,
        };
        *slot = Some(channel);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str) -> FusionOutcome {
        let processed = self.processor.process(query);
        debug!(
            query_type = %processed.query_type,
            keywords = ?processed.keywords,
            entities = ?processed.entities,
            "Processed query"
        );
        self.retrieve_processed(&processed).await
    }

    pub async fn retrieve_processed(&self, query: &ProcessedQuery) -> FusionOutcome {
        let deadline = Instant::now() + self.config.timeout;
        let top_k = self.config.channel_top_k;

        let (graph, vector, keyword) = tokio::join!(
            run_channel(self.graph.as_deref(), query, top_k, deadline),
            run_channel(self.vector.as_deref(), query, top_k, deadline),
            run_channel(self.keyword.as_deref(), query, top_k, deadline),
        );

        let mut available = Vec::new();
        let mut lists = Vec::new();
        let mut failed_channels = Vec::new();
        for (channel, run) in Channel::ALL.into_iter().zip([graph, vector, keyword]) {
            match run {
                ChannelRun::Absent => {}
                ChannelRun::Failed(failure) => {
                    warn!(%channel, ?failure, "Retrieval channel failed");
                    failed_channels.push(FailedChannel { channel, failure });
                }
                ChannelRun::Completed(results) => {
                    available.push(channel);
                    lists.push((channel, results));
                }
            }
        }

        let weights = renormalize(&self.config.weights, &available);
        let results = fuse(lists, &weights, self.config.top_k);
        info!(
            results = results.len(),
            failed = failed_channels.len(),
            "Fused retrieval results"
        );
        FusionOutcome {
            results,
            failed_channels,
            weights,
        }
    }
}

enum ChannelRun {
    Absent,
    Failed(ChannelFailure),
    Completed(Vec<RetrievalResult>),
}

async fn run_channel(
    channel: Option<&dyn RetrievalChannel>,
    query: &ProcessedQuery,
    top_k: usize,
    deadline: Instant,
) -> ChannelRun {
    let Some(channel) = channel else {
        return ChannelRun::Absent;
    };
    match timeout_at(deadline, channel.retrieve(query, top_k)).await {
        Ok(Ok(results)) => ChannelRun::Completed(results),
        Ok(Err(e)) => ChannelRun::Failed(ChannelFailure::Error(e.to_string())),
        Err(_) => ChannelRun::Failed(ChannelFailure::TimedOut),
    }
}

/// Scale the weights of `available` channels so they sum to 1.0; every
/// other channel gets 0. If the available weights sum to zero they share
/// equally.
pub fn renormalize(weights: &FusionWeights, available: &[Channel]) -> FusionWeights {
    let mut out = FusionWeights {
        graph: 0.0,
        vector: 0.0,
        keyword: 0.0,
    };
    if available.is_empty() {
        return out;
    }

    let total: f32 = available.iter().map(|&c| weights.get(c)).sum();
    for &channel in available {
        let weight = if total > 0.0 {
            weights.get(channel) / total
        } else {
            1.0 / available.len() as f32
        };
        match channel {
            Channel::Graph => out.graph = weight,
            Channel::Vector => out.vector = weight,
            Channel::Keyword => out.keyword = weight,
        }
    }
    out
}

/// Clamp to [0, 1]; non-finite scores count as 0
pub fn clamp_score(score: f32) -> f32 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Weighted combination of clamped per-channel scores, in [0, 1]
pub fn combined_score(scores: &kgfusion_core::ChannelScores, weights: &FusionWeights) -> f32 {
    let sum: f32 = Channel::ALL
        .iter()
        .map(|&c| clamp_score(scores.get(c)) * weights.get(c))
        .sum();
    sum.clamp(0.0, 1.0)
}

/// Merge channel lists (in graph, vector, keyword order), deduplicate by
/// normalized content, score and rank. Ties keep merge order.
pub fn fuse(
    mut lists: Vec<(Channel, Vec<RetrievalResult>)>,
    weights: &FusionWeights,
    top_k: usize,
) -> Vec<RetrievalResult> {
    lists.sort_by_key(|(channel, _)| channel.index());

    let mut merged: Vec<RetrievalResult> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (channel, results) in lists {
        for result in results {
            let key = result.content_key();
            if key.is_empty() {
                continue;
            }
            let score = clamp_score(result.score);
            match index.get(&key) {
                Some(&idx) => {
                    let existing = &mut merged[idx];
                    existing.scores.raise(channel, score);
                    for id in result.metadata.source_ids {
                        if !existing.metadata.source_ids.contains(&id) {
                            existing.metadata.source_ids.push(id);
                        }
                    }
                }
                None => {
                    let mut fused = result;
                    fused.metadata.channel = channel;
                    fused.scores.raise(channel, score);
                    index.insert(key, merged.len());
                    merged.push(fused);
                }
            }
        }
    }

    for result in &mut merged {
        result.combined_score = combined_score(&result.scores, weights);
    }
    merged.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
    });
    merged.truncate(top_k);
    merged
}
