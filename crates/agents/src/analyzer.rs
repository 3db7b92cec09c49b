//! Document analysis over a completion service.
//!
//! Produces the [`DocumentProfile`] that schema synthesis consumes. The
//! response is decoded with the same layered parser as extraction.

use crate::parsing::{decode_json, field, string_list, value_to_string};
use async_trait::async_trait;
use kgfusion_core::{
    CompletionService, CoreError, Document, DocumentAnalyzer, DocumentProfile, Result,
    SchemaExtension,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Characters of document content included in the analysis prompt
const DEFAULT_SAMPLE_CHARS: usize = 4000;

pub struct LlmDocumentAnalyzer {
    completion: Arc<dyn CompletionService>,
    sample_chars: usize,
}

impl LlmDocumentAnalyzer {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            sample_chars: DEFAULT_SAMPLE_CHARS,
        }
    }

    pub fn with_sample_chars(mut self, sample_chars: usize) -> Self {
        self.sample_chars = sample_chars.max(1);
        self
    }

    fn build_prompt(&self, document: &Document) -> String {
        let sample: String = document.content.chars().take(self.sample_chars).collect();
        let title = document.title.as_deref().unwrap_or("(untitled)");
        format!(
            r#"Analyze the document below and describe it for knowledge graph extraction.

Return ONLY a JSON object with these fields:
{{
  "summary": "one or two sentences",
  "category": "document category, e.g. tutorial, report, paper, news",
  "domain": "primary domain, e.g. technology, business, academic",
  "tags": ["short", "tags"],
  "key_concepts": ["the most important concepts"],
  "entity_types": ["entity types specific to this domain"],
  "relation_types": ["relation types in snake_case"],
  "attribute_types": ["attribute types worth capturing"]
}}

Title: {title}

Document:
{sample}"#
        )
    }
}

#[async_trait]
impl DocumentAnalyzer for LlmDocumentAnalyzer {
    #[instrument(skip(self, document), fields(document = %document.id))]
    async fn analyze(&self, document: &Document) -> Result<DocumentProfile> {
        if document.is_blank() {
            return Ok(DocumentProfile::default());
        }

        let output = self.completion.complete(&self.build_prompt(document)).await?;
        let value = decode_json(&output)?;
        let profile = value
            .as_object()
            .map(parse_profile)
            .ok_or_else(|| CoreError::Parse("analysis response is not an object".into()))?;

        debug!(
            domain = ?profile.domain,
            category = ?profile.category,
            suggested_types = profile.suggested.entity_types.len(),
            "Analyzed document"
        );
        Ok(profile)
    }
}

/// Lenient profile decoding; unknown or mistyped fields are ignored
fn parse_profile(obj: &Map<String, Value>) -> DocumentProfile {
    let text = |keys: &[&str]| {
        field(obj, keys)
            .and_then(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let list = |keys: &[&str]| field(obj, keys).map(string_list).unwrap_or_default();

    DocumentProfile {
        summary: text(&["summary", "abstract"]),
        category: text(&["category", "type"]),
        domain: text(&["domain", "primary_domain"]),
        tags: list(&["tags", "keywords"]),
        key_concepts: list(&["key_concepts", "concepts"]),
        suggested: SchemaExtension {
            entity_types: list(&["entity_types", "node_types"]),
            relation_types: list(&["relation_types", "relationship_types"]),
            attribute_types: list(&["attribute_types", "attributes"]),
        },
    }
}
