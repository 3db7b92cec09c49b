//! Schema synthesis: generic schema + domain extensions + analyzer suggestions

use kgfusion_core::{
    Document, DocumentAnalyzer, DocumentProfile, DomainInfo, Schema, SchemaExtension,
};
use tracing::{debug, instrument, warn};

/// Built-in extension for a family of domains
#[derive(Debug)]
pub struct DomainExtension {
    /// Substrings of a detected domain name that select this extension
    pub domains: &'static [&'static str],
    pub entity_types: &'static [&'static str],
    pub relation_types: &'static [&'static str],
    pub attribute_types: &'static [&'static str],
}

impl DomainExtension {
    fn to_extension(&self) -> SchemaExtension {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        SchemaExtension {
            entity_types: owned(self.entity_types),
            relation_types: owned(self.relation_types),
            attribute_types: owned(self.attribute_types),
        }
    }
}

pub static DOMAIN_EXTENSIONS: &[DomainExtension] = &[
    DomainExtension {
        domains: &["tech", "software", "computer", "engineering", "技术", "计算机"],
        entity_types: &["framework", "library", "algorithm", "model", "dataset", "programming_language"],
        relation_types: &["supports", "develops", "implements", "depends_on", "extends", "integrates_with"],
        attribute_types: &["version", "license", "language"],
    },
    DomainExtension {
        domains: &["business", "finance", "market", "commerce", "商业", "金融"],
        entity_types: &["company", "executive", "market", "deal", "brand"],
        relation_types: &["acquires", "invests_in", "competes_with", "partners_with", "owns", "sells"],
        attribute_types: &["revenue", "valuation", "industry"],
    },
    DomainExtension {
        domains: &["academic", "research", "science", "education", "学术", "科研"],
        entity_types: &["researcher", "institution", "publication", "method", "theory"],
        relation_types: &["authored", "cites", "affiliated_with", "proposes", "evaluates"],
        attribute_types: &["year", "venue", "field"],
    },
];

/// Merges the generic schema with domain-specific types.
///
/// Base entries are always retained; additions are appended and
/// deduplicated case-insensitively. Never fails: without a usable profile
/// the base schema is returned unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaSynthesizer;

impl SchemaSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Build a new schema from `base` and a document profile
    pub fn synthesize(&self, profile: &DocumentProfile, base: &Schema) -> Schema {
        let domain = profile
            .domain
            .as_deref()
            .or(profile.category.as_deref())
            .map(str::trim)
            .filter(|d| !d.is_empty());

        let mut extension = SchemaExtension::default();
        if let Some(builtin) = domain.and_then(builtin_extension) {
            append(&mut extension, builtin.to_extension());
        }
        append(&mut extension, profile.suggested.clone());

        let mut key_concepts = base.domain().key_concepts.clone();
        for concept in &profile.key_concepts {
            if !key_concepts.iter().any(|c| c.eq_ignore_ascii_case(concept)) {
                key_concepts.push(concept.clone());
            }
        }
        let domain_info = DomainInfo {
            primary_domain: domain
                .map(str::to_string)
                .or_else(|| base.domain().primary_domain.clone()),
            key_concepts,
        };

        let schema = base.extended_with(&extension, domain_info);
        debug!(
            domain = ?schema.domain().primary_domain,
            node_types = schema.node_types().len(),
            relation_types = schema.relation_types().len(),
            "Synthesized schema"
        );
        schema
    }

    /// Analyze `document` and synthesize its schema, falling back to `base`
    /// when analysis fails
    #[instrument(skip(self, analyzer, document, base), fields(document = %document.id))]
    pub async fn synthesize_for(
        &self,
        analyzer: &dyn DocumentAnalyzer,
        document: &Document,
        base: &Schema,
    ) -> Schema {
        match analyzer.analyze(document).await {
            Ok(profile) => self.synthesize(&profile, base),
            Err(e) => {
                warn!(error = %e, "Document analysis failed, using base schema");
                base.clone()
            }
        }
    }
}

fn builtin_extension(domain: &str) -> Option<&'static DomainExtension> {
    let domain = domain.to_lowercase();
    DOMAIN_EXTENSIONS
        .iter()
        .find(|ext| ext.domains.iter().any(|alias| domain.contains(alias)))
}

fn append(target: &mut SchemaExtension, source: SchemaExtension) {
    target.entity_types.extend(source.entity_types);
    target.relation_types.extend(source.relation_types);
    target.attribute_types.extend(source.attribute_types);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kgfusion_core::{CoreError, Result};

    struct FailingAnalyzer;

    #[async_trait]
    impl DocumentAnalyzer for FailingAnalyzer {
        async fn analyze(&self, _document: &Document) -> Result<DocumentProfile> {
            Err(CoreError::Parse("not json".into()))
        }
    }

    #[test]
    fn test_base_types_always_retained() {
        let base = Schema::base();
        let profile = DocumentProfile {
            domain: Some("Technology".into()),
            suggested: SchemaExtension {
                entity_types: vec!["Framework".into(), "GPU".into(), "PERSON".into()],
                relation_types: vec!["trains_on".into()],
                attribute_types: vec![],
            },
            ..Default::default()
        };
        let schema = SchemaSynthesizer::new().synthesize(&profile, &base);

        assert!(schema.node_types().starts_with(base.node_types()));
        assert!(schema.relation_types().starts_with(base.relation_types()));
        assert!(schema.has_node_type("framework"));
        assert!(schema.has_node_type("gpu"));
        assert!(schema.has_relation_type("supports"));
        assert!(schema.has_relation_type("trains_on"));
        // "Framework" and "PERSON" are duplicates of existing entries
        let frameworks = schema
            .node_types()
            .iter()
            .filter(|t| t.eq_ignore_ascii_case("framework"))
            .count();
        assert_eq!(frameworks, 1);
        assert_eq!(schema.node_types().iter().filter(|t| t.eq_ignore_ascii_case("person")).count(), 1);
        assert_eq!(schema.domain().primary_domain.as_deref(), Some("Technology"));
    }

    #[test]
    fn test_empty_profile_yields_base() {
        let base = Schema::base();
        let schema = SchemaSynthesizer::new().synthesize(&DocumentProfile::default(), &base);
        assert_eq!(schema, base);
    }

    #[test]
    fn test_base_is_not_mutated() {
        let base = Schema::base();
        let profile = DocumentProfile {
            domain: Some("business".into()),
            ..Default::default()
        };
        let schema = SchemaSynthesizer::new().synthesize(&profile, &base);
        assert!(schema.has_relation_type("acquires"));
        assert!(!base.has_relation_type("acquires"));
    }

    #[tokio::test]
    async fn test_failed_analysis_falls_back_to_base() {
        let base = Schema::base();
        let doc = Document::new("d", "text");
        let schema = SchemaSynthesizer::new()
            .synthesize_for(&FailingAnalyzer, &doc, &base)
            .await;
        assert_eq!(schema, base);
    }
}
