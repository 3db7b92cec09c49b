//! Extraction schema and the document profile it is synthesized from

use serde::{Deserialize, Serialize};

/// Domain metadata attached to a schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Primary domain, e.g. "technology"
    #[serde(default)]
    pub primary_domain: Option<String>,

    /// Key concepts the document revolves around
    #[serde(default)]
    pub key_concepts: Vec<String>,
}

/// The permitted entity, relation and attribute types for extraction.
///
/// A schema is never mutated after construction; synthesis builds a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    node_types: Vec<String>,
    relation_types: Vec<String>,
    attribute_types: Vec<String>,
    domain: DomainInfo,
}

impl Schema {
    /// Build a schema, deduplicating each type list case-insensitively
    /// while keeping first occurrences in order.
    pub fn new(
        node_types: impl IntoIterator<Item = impl Into<String>>,
        relation_types: impl IntoIterator<Item = impl Into<String>>,
        attribute_types: impl IntoIterator<Item = impl Into<String>>,
        domain: DomainInfo,
    ) -> Self {
        Self {
            node_types: dedup_case_insensitive(node_types),
            relation_types: dedup_case_insensitive(relation_types),
            attribute_types: dedup_case_insensitive(attribute_types),
            domain,
        }
    }

    /// The generic schema every document starts from
    pub fn base() -> Self {
        Self::new(
            ["person", "organization", "location", "event", "concept", "technology", "product"],
            [
                "related_to",
                "part_of",
                "located_in",
                "works_for",
                "created_by",
                "uses",
                "belongs_to",
            ],
            ["description", "date", "role", "status"],
            DomainInfo::default(),
        )
    }

    pub fn node_types(&self) -> &[String] {
        &self.node_types
    }

    pub fn relation_types(&self) -> &[String] {
        &self.relation_types
    }

    pub fn attribute_types(&self) -> &[String] {
        &self.attribute_types
    }

    pub fn domain(&self) -> &DomainInfo {
        &self.domain
    }

    /// Case-insensitive membership test for node types
    pub fn has_node_type(&self, name: &str) -> bool {
        contains_case_insensitive(&self.node_types, name)
    }

    /// Case-insensitive membership test for relation types
    pub fn has_relation_type(&self, name: &str) -> bool {
        contains_case_insensitive(&self.relation_types, name)
    }

    /// Return a new schema with `extension` appended after this one's types.
    pub fn extended_with(&self, extension: &SchemaExtension, domain: DomainInfo) -> Self {
        Self::new(
            self.node_types.iter().chain(&extension.entity_types).cloned(),
            self.relation_types.iter().chain(&extension.relation_types).cloned(),
            self.attribute_types.iter().chain(&extension.attribute_types).cloned(),
            domain,
        )
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::base()
    }
}

/// Additional types suggested for a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaExtension {
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub relation_types: Vec<String>,
    #[serde(default)]
    pub attribute_types: Vec<String>,
}

impl SchemaExtension {
    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty()
            && self.relation_types.is_empty()
            && self.attribute_types.is_empty()
    }
}

/// Result of the external document-analysis call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentProfile {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_concepts: Vec<String>,
    /// Types the analyzer proposes beyond the generic schema
    #[serde(default)]
    pub suggested: SchemaExtension,
}

fn dedup_case_insensitive(items: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item: String = item.into();
        let trimmed = item.trim();
        if trimmed.is_empty() || contains_case_insensitive(&out, trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn contains_case_insensitive(items: &[String], name: &str) -> bool {
    let name = name.trim().to_lowercase();
    items.iter().any(|item| item.to_lowercase() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_spelling() {
        let schema = Schema::new(
            ["Person", "person", " PERSON ", "Concept"],
            ["uses"],
            Vec::<String>::new(),
            DomainInfo::default(),
        );
        assert_eq!(schema.node_types(), &["Person".to_string(), "Concept".to_string()]);
        assert!(schema.has_node_type("concept"));
        assert!(schema.has_relation_type("USES"));
    }

    #[test]
    fn test_extension_never_removes_base_types() {
        let base = Schema::base();
        let extension = SchemaExtension {
            entity_types: vec!["Framework".into(), "Technology".into()],
            relation_types: vec!["supports".into()],
            attribute_types: vec![],
        };
        let extended = base.extended_with(&extension, DomainInfo::default());

        for node_type in base.node_types() {
            assert!(extended.has_node_type(node_type));
        }
        assert!(extended.has_node_type("framework"));
        assert!(extended.has_relation_type("supports"));
        // "Technology" is already present in the base schema
        assert_eq!(extended.node_types().len(), base.node_types().len() + 1);
        // base unchanged
        assert!(!base.has_node_type("framework"));
    }
}
