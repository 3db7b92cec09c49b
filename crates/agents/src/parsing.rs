//! Resilient decoding of completion output.
//!
//! Completion services promise nothing beyond "text", so decoding is
//! layered: direct decode, then with code fences stripped, then the first
//! brace-balanced object found in the text (with trailing commas removed).
//! Field access is lenient and accepts the common aliases models produce.

use kgfusion_core::{CoreError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// One (subject, predicate, object) statement as returned by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl Triple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }
}

/// Typed intermediate form of one extraction response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpoExtraction {
    /// Entity name to descriptive attribute strings
    pub attributes: BTreeMap<String, Vec<String>>,
    pub triples: Vec<Triple>,
    /// Entity name to inferred type
    pub entity_types: BTreeMap<String, String>,
}

impl SpoExtraction {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.triples.is_empty() && self.entity_types.is_empty()
    }

    /// Every entity name mentioned anywhere in the extraction, first
    /// mention first
    pub fn entity_names(&self) -> Vec<&str> {
        let mentions = self
            .attributes
            .keys()
            .chain(self.entity_types.keys())
            .map(String::as_str)
            .chain(
                self.triples
                    .iter()
                    .flat_map(|t| [t.subject.as_str(), t.object.as_str()]),
            );

        let mut names: Vec<&str> = Vec::new();
        for name in mentions {
            let name = name.trim();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn merge(&mut self, other: SpoExtraction) {
        for (name, values) in other.attributes {
            let slot = self.attributes.entry(name).or_default();
            for value in values {
                if !slot.contains(&value) {
                    slot.push(value);
                }
            }
        }
        for (name, entity_type) in other.entity_types {
            self.entity_types.entry(name).or_insert(entity_type);
        }
        self.triples.extend(other.triples);
    }
}

/// An extraction attributed to a chunk within a batch, when the response
/// said which one
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkExtraction {
    pub chunk: Option<usize>,
    pub extraction: SpoExtraction,
}

/// Decode completion output into JSON, trying each repair layer in turn
pub fn decode_json(payload: &str) -> Result<Value> {
    let trimmed = payload.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let unfenced = strip_code_fence(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        debug!("Decoded completion output after stripping code fence");
        return Ok(value);
    }

    for candidate in balanced_objects(unfenced) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            debug!("Recovered JSON object from surrounding text");
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&remove_trailing_commas(candidate)) {
            debug!("Recovered JSON object after removing trailing commas");
            return Ok(value);
        }
    }

    Err(CoreError::Parse(preview(trimmed)))
}

/// Parse a response that may cover several chunks.
///
/// Accepts `{"results": [{"chunk": i, ...}, ...]}`, a bare array of such
/// objects, or a single extraction object (attributed to no chunk).
pub fn parse_batch_response(value: &Value) -> Vec<ChunkExtraction> {
    let items = match value {
        Value::Array(items) => Some(items),
        Value::Object(obj) => ["results", "chunks", "batch"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    match items {
        Some(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|obj| ChunkExtraction {
                chunk: ["chunk", "chunk_index", "index", "chunk_id"]
                    .iter()
                    .find_map(|key| obj.get(*key))
                    .and_then(value_to_index),
                extraction: parse_extraction_object(obj),
            })
            .collect(),
        None => match value.as_object() {
            Some(obj) => vec![ChunkExtraction {
                chunk: None,
                extraction: parse_extraction_object(obj),
            }],
            None => Vec::new(),
        },
    }
}

/// Parse one extraction object leniently
pub fn parse_extraction(value: &Value) -> SpoExtraction {
    value
        .as_object()
        .map(parse_extraction_object)
        .unwrap_or_default()
}

fn parse_extraction_object(obj: &Map<String, Value>) -> SpoExtraction {
    let mut extraction = SpoExtraction::default();

    match field(obj, &["attributes", "entity_attributes", "entities"]) {
        Some(Value::Object(map)) => {
            for (name, values) in map {
                let name = name.trim();
                if !name.is_empty() {
                    extraction
                        .attributes
                        .insert(name.to_string(), string_list(values));
                }
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                collect_entity_item(item, &mut extraction);
            }
        }
        _ => {}
    }

    if let Some(Value::Object(map)) = field(obj, &["entity_types", "types"]) {
        for (name, entity_type) in map {
            if let Some(entity_type) = value_to_string(entity_type) {
                let (name, entity_type) = (name.trim(), entity_type.trim());
                if !name.is_empty() && !entity_type.is_empty() {
                    extraction
                        .entity_types
                        .insert(name.to_string(), entity_type.to_string());
                }
            }
        }
    }

    if let Some(Value::Array(items)) = field(obj, &["triples", "relations", "relationships"]) {
        extraction.triples = items.iter().filter_map(parse_triple).collect();
    }

    extraction
}

/// `{"name": .., "type": .., "description": ..}` or a bare name
fn collect_entity_item(item: &Value, extraction: &mut SpoExtraction) {
    let (name, entity_type, description) = match item {
        Value::String(name) => (name.trim().to_string(), None, Vec::new()),
        Value::Object(obj) => {
            let Some(name) = field(obj, &["name", "entity", "value"]).and_then(value_to_string)
            else {
                return;
            };
            let entity_type = field(obj, &["type", "entity_type", "label", "category"])
                .and_then(value_to_string);
            let description = field(obj, &["description", "attributes", "attribute"])
                .map(string_list)
                .unwrap_or_default();
            (name.trim().to_string(), entity_type, description)
        }
        _ => return,
    };
    if name.is_empty() {
        return;
    }
    if let Some(entity_type) = entity_type.filter(|t| !t.trim().is_empty()) {
        extraction
            .entity_types
            .entry(name.clone())
            .or_insert_with(|| entity_type.trim().to_string());
    }
    extraction.attributes.entry(name).or_default().extend(description);
}

fn parse_triple(item: &Value) -> Option<Triple> {
    let (subject, predicate, object) = match item {
        Value::Array(parts) if parts.len() >= 3 => (
            value_to_string(&parts[0])?,
            value_to_string(&parts[1])?,
            value_to_string(&parts[2])?,
        ),
        Value::Object(obj) => (
            field(obj, &["subject", "source", "head", "from", "entity1"]).and_then(value_to_string)?,
            field(
                obj,
                &["predicate", "relation", "relationship_type", "relation_type", "type", "label"],
            )
            .and_then(value_to_string)?,
            field(obj, &["object", "target", "tail", "to", "entity2"]).and_then(value_to_string)?,
        ),
        _ => return None,
    };
    let triple = Triple::new(subject.trim(), predicate.trim(), object.trim());
    let complete =
        !triple.subject.is_empty() && !triple.predicate.is_empty() && !triple.object.is_empty();
    complete.then_some(triple)
}

pub(crate) fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

pub(crate) fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        other => value_to_string(other)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .into_iter()
            .collect(),
    }
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(arr) => arr.first().and_then(value_to_string),
        Value::Object(obj) => obj
            .get("name")
            .or_else(|| obj.get("entity"))
            .or_else(|| obj.get("value"))
            .and_then(value_to_string),
        Value::Null => None,
    }
}

fn value_to_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strip_code_fence(payload: &str) -> &str {
    let Some(rest) = payload.strip_prefix("```") else {
        return payload;
    };
    // Drop the info string ("json") on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Every top-level brace-balanced `{...}` span, in order of appearance
fn balanced_objects(payload: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    let mut start_idx = None;

    for (offset, ch) in payload.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start_idx = Some(offset);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_idx.take() {
                        spans.push(&payload[start..=offset]);
                    }
                }
            }
            _ => {}
        }
    }

    spans
}

fn remove_trailing_commas(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut in_string = false;
    let mut escape = false;
    let chars: Vec<char> = payload.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn preview(payload: &str) -> String {
    const MAX: usize = 120;
    match payload.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &payload[..idx]),
        None => payload.to_string(),
    }
}
