//! Retrieval results as produced by channels and by fusion

use crate::document::Channel;
use serde::{Deserialize, Serialize};

/// Per-channel score breakdown, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelScores {
    pub graph: f32,
    pub vector: f32,
    pub keyword: f32,
}

impl ChannelScores {
    pub fn get(&self, channel: Channel) -> f32 {
        match channel {
            Channel::Graph => self.graph,
            Channel::Vector => self.vector,
            Channel::Keyword => self.keyword,
        }
    }

    /// Raise the score for `channel` to `score` if it is higher
    pub fn raise(&mut self, channel: Channel, score: f32) {
        let slot = match channel {
            Channel::Graph => &mut self.graph,
            Channel::Vector => &mut self.vector,
            Channel::Keyword => &mut self.keyword,
        };
        if score > *slot {
            *slot = score;
        }
    }
}

/// Where a result came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Channel that first surfaced this content
    pub channel: Channel,

    /// Ids of the records behind the result (chunk ids, entity ids, ...)
    #[serde(default)]
    pub source_ids: Vec<String>,

    /// Free-form channel specific data
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// A single retrieval hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub content: String,

    /// Channel-local score as reported by the channel
    pub score: f32,

    /// Per-channel scores; filled in by fusion
    #[serde(default)]
    pub scores: ChannelScores,

    /// Weighted combination; filled in by fusion
    #[serde(default)]
    pub combined_score: f32,

    pub metadata: ResultMetadata,
}

impl RetrievalResult {
    /// A raw channel hit
    pub fn from_channel(channel: Channel, content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            scores: ChannelScores::default(),
            combined_score: 0.0,
            metadata: ResultMetadata {
                channel,
                source_ids: Vec::new(),
                extra: serde_json::Value::Null,
            },
        }
    }

    /// Builder: add a source id
    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.source_ids.push(id.into());
        self
    }

    /// Builder: set channel specific metadata
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.metadata.extra = extra;
        self
    }

    /// Key under which fusion deduplicates results
    pub fn content_key(&self) -> String {
        self.content.trim().to_lowercase()
    }
}
