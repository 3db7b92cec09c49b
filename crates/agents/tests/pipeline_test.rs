//! End-to-end tests for building knowledge and querying it

mod common;

use common::{test_services, ScriptedCompletion, UnavailableEmbedder};
use kgfusion_agents::{KnowledgePipeline, PipelineConfig};
use kgfusion_core::{Document, Entity, EntityOrigin, DOCUMENT_COLLECTION, GRAPH_COLLECTION};
use std::sync::Arc;

const ANALYSIS: &str = r#"{"summary": "PyTorch and Meta", "domain": "technology",
    "key_concepts": ["PyTorch"], "entity_types": ["framework"], "relation_types": ["supports", "develops"]}"#;

const EXTRACTION: &str = r#"```json
{
  "attributes": {"PyTorch": ["open source deep learning framework"], "Meta": ["technology company"]},
  "entity_types": {"PyTorch": "technology", "Meta": "organization"},
  "triples": [["PyTorch", "supports", "神经网络"], ["Meta", "develops", "PyTorch"]]
}
```"#;

fn scenario_completion() -> Arc<ScriptedCompletion> {
    Arc::new(
        ScriptedCompletion::new()
            .on("Analyze the document", ANALYSIS)
            .on("Extract a knowledge graph", EXTRACTION),
    )
}

fn scenario_document() -> Document {
    Document::new("intro", "PyTorch supports 神经网络. Meta develops PyTorch.").with_title("Intro")
}

fn entity<'a>(entities: &'a [Entity], name: &str) -> &'a Entity {
    entities
        .iter()
        .find(|e| e.name == name)
        .unwrap_or_else(|| panic!("missing entity {name}"))
}

#[tokio::test]
async fn test_build_knowledge_scenario() {
    let (services, stores) = test_services(scenario_completion());
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();

    let report = pipeline.build_knowledge(&[scenario_document()]).await;

    assert_eq!(report.documents, 1);
    assert_eq!(report.chunks.graph, 1);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(report.parse_failures, 0);
    assert_eq!(report.dynamic_entities, 1);
    assert_eq!(report.dropped_relationships, 0);
    assert!(report.index_errors.is_empty());

    let delta = &report.delta;
    assert_eq!(delta.entities.len(), 3);
    assert!(delta.is_consistent());

    let pytorch = entity(&delta.entities, "PyTorch");
    let meta = entity(&delta.entities, "Meta");
    let neural = entity(&delta.entities, "神经网络");
    assert_eq!(pytorch.entity_type, "technology");
    assert_eq!(meta.entity_type, "organization");
    assert_eq!(neural.entity_type, "concept");
    assert_eq!(neural.origin, EntityOrigin::Dynamic);
    assert!(neural.confidence < pytorch.confidence);

    let mut triples: Vec<(String, String, String)> = delta
        .relationships
        .iter()
        .map(|r| (r.source_id.clone(), r.label.clone(), r.target_id.clone()))
        .collect();
    triples.sort();
    let mut expected = vec![
        (pytorch.id.clone(), "supports".to_string(), neural.id.clone()),
        (meta.id.clone(), "develops".to_string(), pytorch.id.clone()),
    ];
    expected.sort();
    assert_eq!(triples, expected);

    // One connected component
    assert_eq!(delta.communities.len(), 1);

    assert_eq!(stores.graph.entity_count(), 3);
    assert_eq!(stores.graph.relationship_count(), 2);
    assert_eq!(stores.vectors.count(GRAPH_COLLECTION), 3);
    assert_eq!(stores.vectors.count(DOCUMENT_COLLECTION), report.chunks.vector);
    assert_eq!(stores.keywords.len(), report.keyword_docs_indexed);
}

#[tokio::test]
async fn test_query_fuses_all_channels() {
    let (services, _stores) = test_services(scenario_completion());
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();
    pipeline.build_knowledge(&[scenario_document()]).await;

    let outcome = pipeline.query("What is PyTorch?").await;

    assert!(outcome.failed_channels.is_empty());
    assert!(!outcome.results.is_empty());
    assert!(outcome.results.len() <= 10);
    assert_eq!(outcome.query.entities, vec!["PyTorch"]);
    for pair in outcome.results.windows(2) {
        assert!(pair[0].combined_score >= pair[1].combined_score);
    }
    for result in &outcome.results {
        assert!((0.0..=1.0).contains(&result.combined_score));
    }

    let top_entity = outcome
        .results
        .iter()
        .find(|r| r.content.starts_with("PyTorch (technology)"))
        .expect("graph channel should surface the PyTorch entity");
    assert_eq!(top_entity.scores.graph, 1.0);

    let passage = outcome
        .results
        .iter()
        .find(|r| r.content.contains("神经网络. Meta develops PyTorch"))
        .expect("document chunk should be retrieved");
    assert!(passage.scores.keyword > 0.0);
}

#[tokio::test]
async fn test_entities_persist_across_builds() {
    let (services, _stores) = test_services(scenario_completion());
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();
    pipeline.build_knowledge(&[scenario_document()]).await;
    let second = pipeline
        .build_knowledge(&[Document::new("again", "PyTorch supports 神经网络. Meta develops PyTorch.")])
        .await;

    // Known entities are reused, not recreated
    assert_eq!(second.dynamic_entities, 0);
    assert_eq!(pipeline.known_entities().await.len(), 3);
}

#[tokio::test]
async fn test_seeded_entities_are_reused() {
    let (services, _stores) = test_services(scenario_completion());
    let seeded: Vec<Entity> = ["PyTorch", "Meta", "神经网络"]
        .into_iter()
        .map(|name| Entity::new(name, "concept", EntityOrigin::Extracted).with_confidence(0.9))
        .collect();
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services)
        .unwrap()
        .with_known_entities(seeded);

    let report = pipeline.build_knowledge(&[scenario_document()]).await;

    assert_eq!(report.dynamic_entities, 0);
    assert_eq!(pipeline.known_entities().await.len(), 3);
}

#[tokio::test]
async fn test_unparsable_extraction_degrades() {
    let completion = Arc::new(
        ScriptedCompletion::new()
            .on("Analyze the document", "not json at all")
            .on("Extract a knowledge graph", "Sorry, I cannot do that."),
    );
    let (services, stores) = test_services(completion);
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();

    let report = pipeline.build_knowledge(&[scenario_document()]).await;

    assert_eq!(report.parse_failures, 1);
    assert_eq!(report.skipped_chunks, vec!["intro:graph:0".to_string()]);
    assert!(report.delta.entities.is_empty());
    assert!(report.is_degraded());
    // Indexing still happens
    assert_eq!(stores.keywords.len(), 1);
    assert_eq!(stores.vectors.count(DOCUMENT_COLLECTION), 1);
}

#[tokio::test]
async fn test_embedding_outage_is_recorded() {
    let (mut services, stores) = test_services(scenario_completion());
    services.embedder = Arc::new(UnavailableEmbedder);
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();

    let report = pipeline.build_knowledge(&[scenario_document()]).await;
    assert_eq!(report.delta.entities.len(), 3);
    assert_eq!(report.vectors_indexed, 0);
    assert_eq!(report.index_errors.len(), 2);
    assert_eq!(stores.keywords.len(), 1);

    // The vector channel fails but the query still answers
    let outcome = pipeline.query("What is PyTorch?").await;
    assert_eq!(outcome.failed_channels.len(), 1);
    assert!(!outcome.results.is_empty());
}

#[tokio::test]
async fn test_blank_documents_are_skipped() {
    let completion = scenario_completion();
    let (services, _stores) = test_services(completion.clone());
    let pipeline = KnowledgePipeline::new(PipelineConfig::default(), services).unwrap();

    let report = pipeline.build_knowledge(&[Document::new("empty", "   ")]).await;
    assert_eq!(report.documents, 1);
    assert_eq!(report.chunks.graph, 0);
    assert!(completion.prompts().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let (services, _stores) = test_services(scenario_completion());
    let mut config = PipelineConfig::default();
    config.fusion.weights.graph = 0.9;
    assert!(KnowledgePipeline::new(config, services).is_err());
}
