//! Channel-specific chunking.
//!
//! Each channel has its own size profile. Graph and keyword chunks are packed
//! from whole sentences; vector chunks use a fixed stride with overlap.
//! Anything longer than the profile's cap is split again at the last
//! sentence boundary at or before the cap.

use crate::config::{ChunkProfile, ChunkingConfig};
use crate::Result;
use kgfusion_core::{Channel, Chunk, Document};
use tracing::debug;

/// Characters that end a sentence unconditionally
const HARD_TERMINATORS: &[char] = &['。', '！', '？', '\n'];

/// Characters that end a sentence when followed by whitespace or end of text
const SOFT_TERMINATORS: &[char] = &['.', '!', '?'];

/// How a channel's chunks are cut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Pack whole sentences up to the chunk size, carrying trailing
    /// sentences that fit in the overlap into the next chunk
    SentencePacked,
    /// Fixed character windows advancing by `chunk_size - chunk_overlap`
    FixedWindow,
}

/// Strategy used for a channel
pub fn strategy_for(channel: Channel) -> ChunkStrategy {
    match channel {
        Channel::Graph | Channel::Keyword => ChunkStrategy::SentencePacked,
        Channel::Vector => ChunkStrategy::FixedWindow,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkingPolicy {
    config: ChunkingConfig,
}

impl ChunkingPolicy {
    /// Rejects profiles whose windows could not advance
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Split `document` for `channel`. Deterministic; an empty document
    /// yields no chunks.
    pub fn chunk(&self, document: &Document, channel: Channel) -> Vec<Chunk> {
        if document.is_blank() {
            return Vec::new();
        }

        let text = TextIndex::new(&document.content);
        let profile = self.config.profile(channel);
        let spans = match strategy_for(channel) {
            ChunkStrategy::SentencePacked => pack_sentences(&text, profile),
            ChunkStrategy::FixedWindow => fixed_windows(&text, profile),
        };

        let mut chunks = Vec::new();
        for (start, end) in spans {
            for (start, end) in split_capped(&text, start, end, profile.max_chunk_size) {
                let Some((start, end)) = text.trim(start, end) else {
                    continue;
                };
                chunks.push(Chunk::new(
                    document.id.clone(),
                    channel,
                    chunks.len(),
                    text.byte_offset(start),
                    text.slice(start, end),
                ));
            }
        }

        debug!(
            document = %document.id,
            %channel,
            chunks = chunks.len(),
            "Chunked document"
        );
        chunks
    }
}

/// Char-indexed view over a string with precomputed sentence boundaries
struct TextIndex<'a> {
    text: &'a str,
    chars: Vec<char>,
    /// Byte offset of every char position, plus the total length
    byte_offsets: Vec<usize>,
    /// Char positions where a new sentence may start, ascending, ending
    /// with `chars.len()`
    boundaries: Vec<usize>,
}

impl<'a> TextIndex<'a> {
    fn new(text: &'a str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let byte_offsets = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let boundaries = sentence_boundaries(&chars);
        Self {
            text,
            chars,
            byte_offsets,
            boundaries,
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn byte_offset(&self, char_pos: usize) -> usize {
        self.byte_offsets[char_pos]
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.byte_offsets[start]..self.byte_offsets[end]]
    }

    /// Shrink a span to exclude surrounding whitespace
    fn trim(&self, mut start: usize, mut end: usize) -> Option<(usize, usize)> {
        while start < end && self.chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        (start < end).then_some((start, end))
    }

    /// Last sentence boundary in `(after, upto]`
    fn last_boundary_within(&self, after: usize, upto: usize) -> Option<usize> {
        let idx = self.boundaries.partition_point(|&b| b <= upto);
        self.boundaries[..idx].last().copied().filter(|&b| b > after)
    }
}

fn sentence_boundaries(chars: &[char]) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let ends_sentence = HARD_TERMINATORS.contains(&c)
            || (SOFT_TERMINATORS.contains(&c)
                && chars.get(i + 1).map_or(true, |next| next.is_whitespace()));
        i += 1;
        if ends_sentence {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if i < chars.len() {
                boundaries.push(i);
            }
        }
    }
    boundaries.push(chars.len());
    boundaries
}

fn pack_sentences(text: &TextIndex<'_>, profile: ChunkProfile) -> Vec<(usize, usize)> {
    let mut sentence_starts = vec![0];
    sentence_starts.extend(text.boundaries.iter().copied().filter(|&b| b < text.len()));
    let sentence_end = |i: usize| {
        sentence_starts
            .get(i + 1)
            .copied()
            .unwrap_or_else(|| text.len())
    };

    let mut spans = Vec::new();
    let mut first = 0;
    while first < sentence_starts.len() {
        let start = sentence_starts[first];
        let mut last = first;
        while last + 1 < sentence_starts.len()
            && sentence_end(last + 1) - start <= profile.chunk_size
        {
            last += 1;
        }
        let end = sentence_end(last);
        spans.push((start, end));

        if last + 1 >= sentence_starts.len() {
            break;
        }

        // Carry trailing sentences that fit inside the overlap, but always
        // make progress.
        let mut next = last + 1;
        while next > first + 1 && end - sentence_starts[next - 1] <= profile.chunk_overlap {
            next -= 1;
        }
        first = next;
    }
    spans
}

fn fixed_windows(text: &TextIndex<'_>, profile: ChunkProfile) -> Vec<(usize, usize)> {
    let stride = profile.chunk_size - profile.chunk_overlap;
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + profile.chunk_size).min(text.len());
        spans.push((start, end));
        if end == text.len() {
            break;
        }
        start += stride;
    }
    spans
}

fn split_capped(text: &TextIndex<'_>, start: usize, end: usize, cap: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut start = start;
    while end - start > cap {
        let cut = text
            .last_boundary_within(start, start + cap)
            .unwrap_or(start + cap);
        pieces.push((start, cut));
        start = cut;
    }
    pieces.push((start, end));
    pieces
}
