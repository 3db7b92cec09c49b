//! Documents and the channel-specific chunks cut from them

use serde::{Deserialize, Serialize};

/// A parsed source document, ready for chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier of the document
    pub id: String,

    /// Human-readable title
    pub title: Option<String>,

    /// Full text content
    pub content: String,
}

impl Document {
    /// Create a new document
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
        }
    }

    /// Builder: set title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Whether the document has no meaningful content
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// The retrieval channel a chunk (or a result) belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Graph,
    Vector,
    Keyword,
}

impl Channel {
    /// All channels in merge order
    pub const ALL: [Channel; 3] = [Channel::Graph, Channel::Vector, Channel::Keyword];

    /// Position of the channel in merge order
    pub fn index(self) -> usize {
        match self {
            Channel::Graph => 0,
            Channel::Vector => 1,
            Channel::Keyword => 2,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Graph => write!(f, "graph"),
            Channel::Vector => write!(f, "vector"),
            Channel::Keyword => write!(f, "keyword"),
        }
    }
}

/// A slice of a document prepared for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}:{channel}:{index}`
    pub id: String,

    /// Originating document
    pub document_id: String,

    /// Channel this chunk was cut for
    pub channel: Channel,

    /// Position among the document's chunks for this channel
    pub index: usize,

    /// Byte offset of the chunk start within the document content
    pub offset: usize,

    /// Chunk text
    pub content: String,
}

impl Chunk {
    /// Create a new chunk
    pub fn new(
        document_id: impl Into<String>,
        channel: Channel,
        index: usize,
        offset: usize,
        content: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            id: format!("{}:{}:{}", document_id, channel, index),
            document_id,
            channel,
            index,
            offset,
            content: content.into(),
        }
    }

    /// Length of the chunk in characters
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}
