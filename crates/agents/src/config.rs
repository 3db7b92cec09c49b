//! Pipeline configuration.
//!
//! One immutable [`PipelineConfig`] is built at startup (defaults overlaid
//! with `KGF_*` environment variables) and passed to every component.

use crate::{AgentError, Result};
use kgfusion_core::Channel;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

/// Size profile of one chunking channel, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProfile {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Chunks longer than this are split again at a sentence boundary
    pub max_chunk_size: usize,
}

impl ChunkProfile {
    pub const fn new(chunk_size: usize, chunk_overlap: usize, max_chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            max_chunk_size,
        }
    }

    fn validate(&self, channel: Channel) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AgentError::Config(format!("{channel} chunk_size must be > 0")));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AgentError::Config(format!(
                "{channel} chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.max_chunk_size < self.chunk_size {
            return Err(AgentError::Config(format!(
                "{channel} max_chunk_size ({}) must be >= chunk_size ({})",
                self.max_chunk_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub graph: ChunkProfile,
    pub vector: ChunkProfile,
    pub keyword: ChunkProfile,
}

impl ChunkingConfig {
    pub fn profile(&self, channel: Channel) -> ChunkProfile {
        match channel {
            Channel::Graph => self.graph,
            Channel::Vector => self.vector,
            Channel::Keyword => self.keyword,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for channel in Channel::ALL {
            self.profile(channel).validate(channel)?;
        }
        Ok(())
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            graph: ChunkProfile::new(3000, 300, 5000),
            vector: ChunkProfile::new(1500, 150, 2000),
            keyword: ChunkProfile::new(600, 100, 1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Chunks sent per extraction call
    pub batch_size: usize,
    /// Extraction calls in flight at once
    pub max_concurrency: usize,
    /// Retries after the first attempt, for transient failures only
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub call_timeout: Duration,
    /// Drop triples whose label is not a schema relation type
    pub enforce_relation_types: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_concurrency: 4,
            max_retries: 3,
            backoff_base_ms: 500,
            call_timeout: Duration::from_secs(120),
            enforce_relation_types: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    /// Minimum similarity (0-1) for a fuzzy match to be accepted
    pub fuzzy_threshold: f32,
    /// Characters of context captured on each side of a mention
    pub context_window: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.8,
            context_window: 60,
        }
    }
}

/// Channel weights for fusion; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    pub graph: f32,
    pub vector: f32,
    pub keyword: f32,
}

impl FusionWeights {
    pub fn get(&self, channel: Channel) -> f32 {
        match channel {
            Channel::Graph => self.graph,
            Channel::Vector => self.vector,
            Channel::Keyword => self.keyword,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let weights = [self.graph, self.vector, self.keyword];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AgentError::Config(format!(
                "fusion weights must be finite and non-negative: {:?}",
                self
            )));
        }
        let sum: f32 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(AgentError::Config(format!(
                "fusion weights must sum to 1.0, got {sum:.4}"
            )));
        }
        Ok(())
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            graph: 0.4,
            vector: 0.4,
            keyword: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub weights: FusionWeights,
    /// Results returned after fusion
    pub top_k: usize,
    /// Results requested from each channel
    pub channel_top_k: usize,
    /// Deadline for the whole fan-out
    pub timeout: Duration,
    /// Hops explored by the graph channel
    pub graph_depth: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            top_k: 10,
            channel_top_k: 20,
            timeout: Duration::from_millis(10_000),
            graph_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub extraction: ExtractionConfig,
    pub resolver: ResolverConfig,
    pub fusion: FusionConfig,
}

impl PipelineConfig {
    /// Defaults overlaid with `KGF_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        for (channel, prefix) in [
            (Channel::Graph, "KGF_GRAPH"),
            (Channel::Vector, "KGF_VECTOR"),
            (Channel::Keyword, "KGF_KEYWORD"),
        ] {
            let profile = match channel {
                Channel::Graph => &mut config.chunking.graph,
                Channel::Vector => &mut config.chunking.vector,
                Channel::Keyword => &mut config.chunking.keyword,
            };
            profile.chunk_size = env_parse(&format!("{prefix}_CHUNK_SIZE"), profile.chunk_size);
            profile.chunk_overlap =
                env_parse(&format!("{prefix}_CHUNK_OVERLAP"), profile.chunk_overlap);
            profile.max_chunk_size =
                env_parse(&format!("{prefix}_MAX_CHUNK_SIZE"), profile.max_chunk_size);
        }

        let extraction = &mut config.extraction;
        extraction.batch_size = env_parse("KGF_BATCH_SIZE", extraction.batch_size);
        extraction.max_concurrency = env_parse("KGF_MAX_CONCURRENCY", extraction.max_concurrency);
        extraction.max_retries = env_parse("KGF_MAX_RETRIES", extraction.max_retries);
        extraction.backoff_base_ms = env_parse("KGF_BACKOFF_BASE_MS", extraction.backoff_base_ms);
        extraction.call_timeout = Duration::from_secs(env_parse(
            "KGF_CALL_TIMEOUT_SECS",
            extraction.call_timeout.as_secs(),
        ));
        extraction.enforce_relation_types =
            env_flag("KGF_ENFORCE_RELATION_TYPES", extraction.enforce_relation_types);

        config.resolver.fuzzy_threshold =
            env_parse("KGF_FUZZY_THRESHOLD", config.resolver.fuzzy_threshold);
        config.resolver.context_window =
            env_parse("KGF_CONTEXT_WINDOW", config.resolver.context_window);

        let fusion = &mut config.fusion;
        fusion.weights.graph = env_parse("KGF_WEIGHT_GRAPH", fusion.weights.graph);
        fusion.weights.vector = env_parse("KGF_WEIGHT_VECTOR", fusion.weights.vector);
        fusion.weights.keyword = env_parse("KGF_WEIGHT_KEYWORD", fusion.weights.keyword);
        fusion.top_k = env_parse("KGF_TOP_K", fusion.top_k);
        fusion.channel_top_k = env_parse("KGF_CHANNEL_TOP_K", fusion.channel_top_k);
        fusion.timeout = Duration::from_millis(env_parse(
            "KGF_QUERY_TIMEOUT_MS",
            fusion.timeout.as_millis() as u64,
        ));
        fusion.graph_depth = env_parse("KGF_GRAPH_DEPTH", fusion.graph_depth);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.extraction.batch_size == 0 || self.extraction.max_concurrency == 0 {
            return Err(AgentError::Config(
                "batch_size and max_concurrency must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resolver.fuzzy_threshold) {
            return Err(AgentError::Config(format!(
                "fuzzy_threshold must be within [0, 1], got {}",
                self.resolver.fuzzy_threshold
            )));
        }
        if self.fusion.top_k == 0 || self.fusion.channel_top_k == 0 {
            return Err(AgentError::Config("top_k values must be > 0".to_string()));
        }
        self.fusion.weights.validate()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            matches!(value.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.chunking.graph.chunk_size, 3000);
        assert_eq!(config.chunking.keyword.max_chunk_size, 1000);
        assert_eq!(config.fusion.weights, FusionWeights::default());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let weights = FusionWeights {
            graph: 0.5,
            vector: 0.5,
            keyword: 0.2,
        };
        assert!(weights.validate().is_err());

        let weights = FusionWeights {
            graph: 1.2,
            vector: -0.4,
            keyword: 0.2,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut config = PipelineConfig::default();
        config.chunking.vector = ChunkProfile::new(100, 100, 200);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let mut config = PipelineConfig::default();
        config.chunking.graph = ChunkProfile::new(1000, 100, 500);
        assert!(config.validate().is_err());
    }
}
