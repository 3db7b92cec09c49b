//! Single-pass SPO extraction.
//!
//! One completion call per batch of graph chunks yields entities, their
//! attributes and the triples between them together. Calls run with
//! bounded concurrency; each is retried on transient failure with
//! exponential backoff. A batch that still fails, or whose response cannot
//! be decoded, is recorded and skipped while the rest continue.

use crate::config::ExtractionConfig;
use crate::parsing::{decode_json, parse_batch_response, SpoExtraction};
use crate::templates::{select_template, ExtractionTemplate};
use kgfusion_core::{Chunk, CompletionService, CoreError, Result, Schema, DEFAULT_ENTITY_TYPE};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Extractions per input chunk plus the completeness signals of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    /// Position in the input slice to that chunk's extraction, ascending
    pub extractions: Vec<(usize, SpoExtraction)>,
    pub batches: usize,
    /// Batches whose completion call failed after all retries
    pub failed_batches: usize,
    /// Batches whose response could not be decoded
    pub parse_failures: usize,
    /// Chunks that contributed nothing because their batch failed
    pub skipped_chunks: Vec<String>,
}

impl ExtractionReport {
    pub fn triple_count(&self) -> usize {
        self.extractions.iter().map(|(_, e)| e.triples.len()).sum()
    }
}

pub struct SpoExtractor {
    completion: Arc<dyn CompletionService>,
    config: ExtractionConfig,
}

impl SpoExtractor {
    pub fn new(completion: Arc<dyn CompletionService>, config: ExtractionConfig) -> Self {
        Self { completion, config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract from `chunks` under `schema`. Never fails: failed batches
    /// are reported and skipped.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn extract(&self, chunks: &[Chunk], schema: &Schema) -> ExtractionReport {
        let positions: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| !chunk.content.trim().is_empty())
            .map(|(pos, _)| pos)
            .collect();
        let batches: Vec<Vec<usize>> = positions
            .chunks(self.config.batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect();

        let mut report = ExtractionReport {
            batches: batches.len(),
            ..Default::default()
        };
        if batches.is_empty() {
            return report;
        }

        let domain = schema.domain().primary_domain.as_deref();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let retry = RetryPolicy::from(&self.config);
        let mut tasks = JoinSet::new();

        for (batch_idx, batch) in batches.iter().enumerate() {
            let members: Vec<&Chunk> = batch.iter().map(|&pos| &chunks[pos]).collect();
            let text: String = members.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("\n");
            let template = select_template(domain, &text).template();
            let prompt = build_prompt(&members, schema, template);
            debug!(batch = batch_idx, template = %template.kind, "Dispatching extraction batch");

            let completion = Arc::clone(&self.completion);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => complete_with_retry(completion.as_ref(), &prompt, retry).await,
                    Err(_) => Err(CoreError::Service("extraction limiter closed".into())),
                };
                (batch_idx, result)
            });
        }

        let mut responses: Vec<Option<Result<String>>> = (0..batches.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((batch_idx, result)) => responses[batch_idx] = Some(result),
                Err(e) => warn!(error = %e, "Extraction task aborted"),
            }
        }

        let mut per_chunk: BTreeMap<usize, SpoExtraction> = BTreeMap::new();
        for (batch, response) in batches.iter().zip(responses) {
            let members: Vec<&Chunk> = batch.iter().map(|&pos| &chunks[pos]).collect();
            let skip = |report: &mut ExtractionReport| {
                report
                    .skipped_chunks
                    .extend(members.iter().map(|c| c.id.clone()));
            };

            let output = match response {
                Some(Ok(output)) => output,
                Some(Err(e)) => {
                    warn!(error = %e, chunks = members.len(), "Extraction batch failed");
                    report.failed_batches += 1;
                    skip(&mut report);
                    continue;
                }
                None => {
                    report.failed_batches += 1;
                    skip(&mut report);
                    continue;
                }
            };

            let value = match decode_json(&output) {
                Ok(value) if value.is_object() || value.is_array() => value,
                Ok(value) => {
                    warn!(
                        kind = json_kind(&value),
                        chunks = members.len(),
                        "Extraction response is not an object or array"
                    );
                    report.parse_failures += 1;
                    skip(&mut report);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, chunks = members.len(), "Unparsable extraction response");
                    report.parse_failures += 1;
                    skip(&mut report);
                    continue;
                }
            };

            for (member, extraction) in attribute(parse_batch_response(&value), &members) {
                per_chunk.entry(batch[member]).or_default().merge(extraction);
            }
        }

        report.extractions = per_chunk.into_iter().filter(|(_, e)| !e.is_empty()).collect();
        info!(
            batches = report.batches,
            failed = report.failed_batches,
            parse_failures = report.parse_failures,
            triples = report.triple_count(),
            "Extraction finished"
        );
        report
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ==========================================
// Retry
// ==========================================

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff_base_ms: u64,
    call_timeout: Duration,
}

impl From<&ExtractionConfig> for RetryPolicy {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            call_timeout: config.call_timeout,
        }
    }
}

async fn complete_with_retry(
    completion: &dyn CompletionService,
    prompt: &str,
    policy: RetryPolicy,
) -> Result<String> {
    let mut attempts = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, completion.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(format!(
                "completion call exceeded {}s",
                policy.call_timeout.as_secs_f32()
            ))),
        };

        match result {
            Ok(output) => return Ok(output),
            Err(e) if e.is_transient() && attempts < policy.max_retries => {
                attempts += 1;
                let backoff = calculate_backoff(policy.backoff_base_ms, attempts);
                warn!(
                    attempt = attempts,
                    wait_ms = backoff,
                    error = %e,
                    "Transient completion failure, retrying after backoff"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// base * 2^(attempt - 1) plus up to 10% jitter
fn calculate_backoff(base_ms: u64, attempt: u32) -> u64 {
    let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = delay / 10;
    delay + (rand_jitter() % jitter.max(1))
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 % 1000)
        .unwrap_or(0)
}

// ==========================================
// Prompt
// ==========================================

const SINGLE_FORMAT: &str = r#"{
  "attributes": {"Entity name": ["short description or attribute"]},
  "triples": [["subject", "relation_type", "object"]],
  "entity_types": {"Entity name": "entity_type"}
}"#;

const BATCH_FORMAT: &str = r#"{
  "results": [
    {
      "chunk": 0,
      "attributes": {"Entity name": ["short description or attribute"]},
      "triples": [["subject", "relation_type", "object"]],
      "entity_types": {"Entity name": "entity_type"}
    }
  ]
}"#;

fn build_prompt(chunks: &[&Chunk], schema: &Schema, template: &ExtractionTemplate) -> String {
    let mut prompt = String::from(
        "Extract a knowledge graph from the text in a single pass: entities, \
         their attributes and the relations between them.\n\n",
    );
    prompt.push_str(template.focus);
    prompt.push_str("\n\n");

    prompt.push_str(&format!("Entity types: {}\n", schema.node_types().join(", ")));
    prompt.push_str(&format!("Relation types: {}\n", schema.relation_types().join(", ")));
    prompt.push_str(&format!("Attribute types: {}\n", schema.attribute_types().join(", ")));
    let domain = schema.domain();
    if let Some(primary) = &domain.primary_domain {
        prompt.push_str(&format!("Domain: {primary}\n"));
    }
    if !domain.key_concepts.is_empty() {
        prompt.push_str(&format!("Key concepts: {}\n", domain.key_concepts.join(", ")));
    }

    prompt.push_str(&format!(
        "\nRules:\n\
         - Use only the entity types listed; use \"{DEFAULT_ENTITY_TYPE}\" when none fits.\n\
         - Use only the relation types listed, in snake_case.\n\
         - Subjects and objects are entity names exactly as written in the text.\n\
         - Return ONLY the JSON object, no commentary.\n"
    ));

    if let [chunk] = chunks {
        prompt.push_str(&format!("\nOutput format:\n{SINGLE_FORMAT}\n\nText:\n{}", chunk.content));
    } else {
        prompt.push_str(&format!(
            "\nThe text is split into {} chunks. Return one result per chunk with its chunk number.\n\
             \nOutput format:\n{BATCH_FORMAT}\n",
            chunks.len()
        ));
        for (i, chunk) in chunks.iter().enumerate() {
            prompt.push_str(&format!("\n[CHUNK {i}]\n{}\n", chunk.content));
        }
    }
    prompt
}

// ==========================================
// Attribution
// ==========================================

/// Assign each parsed result to a member of the batch. Results naming a
/// valid chunk go there; otherwise each triple goes to the first chunk
/// mentioning both endpoints, then the subject, then the first chunk.
fn attribute(
    results: Vec<crate::parsing::ChunkExtraction>,
    members: &[&Chunk],
) -> Vec<(usize, SpoExtraction)> {
    let texts: Vec<String> = members.iter().map(|c| c.content.to_lowercase()).collect();
    let mentions = |name: &str| {
        let name = name.to_lowercase();
        texts.iter().position(|text| text.contains(&name))
    };

    let mut out: Vec<(usize, SpoExtraction)> = Vec::new();
    let mut push = |member: usize, extraction: SpoExtraction| {
        match out.iter_mut().find(|(m, _)| *m == member) {
            Some((_, existing)) => existing.merge(extraction),
            None => out.push((member, extraction)),
        }
    };

    for result in results {
        if let Some(member) = result.chunk.filter(|&i| i < members.len()) {
            push(member, result.extraction);
            continue;
        }
        if members.len() == 1 {
            push(0, result.extraction);
            continue;
        }

        let extraction = result.extraction;
        for triple in extraction.triples {
            let subject = triple.subject.to_lowercase();
            let object = triple.object.to_lowercase();
            let member = texts
                .iter()
                .position(|text| text.contains(&subject) && text.contains(&object))
                .or_else(|| mentions(&triple.subject))
                .unwrap_or(0);
            let mut part = SpoExtraction::default();
            part.triples.push(triple);
            push(member, part);
        }
        for (name, values) in extraction.attributes {
            let mut part = SpoExtraction::default();
            let member = mentions(&name).unwrap_or(0);
            part.attributes.insert(name, values);
            push(member, part);
        }
        for (name, entity_type) in extraction.entity_types {
            let mut part = SpoExtraction::default();
            let member = mentions(&name).unwrap_or(0);
            part.entity_types.insert(name, entity_type);
            push(member, part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::Triple;
    use async_trait::async_trait;
    use kgfusion_core::Channel;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replies from a queue; each entry is one call's outcome
    struct QueuedCompletion {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl QueuedCompletion {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionService for QueuedCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CoreError::Service("no reply queued".into())))
        }
    }

    fn fast_config() -> ExtractionConfig {
        ExtractionConfig {
            max_retries: 2,
            backoff_base_ms: 1,
            max_concurrency: 1,
            ..Default::default()
        }
    }

    fn chunk(index: usize, content: &str) -> Chunk {
        Chunk::new("doc", Channel::Graph, index, 0, content)
    }

    #[tokio::test]
    async fn test_single_chunk_extraction() {
        let completion = QueuedCompletion::new(vec![Ok(
            r#"{"triples": [["Meta", "develops", "PyTorch"]], "entity_types": {"Meta": "organization"}}"#.into(),
        )]);
        let extractor = SpoExtractor::new(completion, fast_config());
        let report = extractor
            .extract(&[chunk(0, "Meta develops PyTorch.")], &Schema::base())
            .await;

        assert_eq!(report.batches, 1);
        assert_eq!(report.extractions.len(), 1);
        assert_eq!(report.extractions[0].0, 0);
        assert_eq!(
            report.extractions[0].1.triples,
            vec![Triple::new("Meta", "develops", "PyTorch")]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let completion = QueuedCompletion::new(vec![
            Err(CoreError::RateLimited("429".into())),
            Err(CoreError::Timeout("slow".into())),
            Ok(r#"{"triples": [["a", "uses", "b"]]}"#.into()),
        ]);
        let extractor = SpoExtractor::new(completion.clone(), fast_config());
        let report = extractor.extract(&[chunk(0, "a uses b")], &Schema::base()).await;

        assert_eq!(completion.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(report.triple_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_then_skip() {
        let completion = QueuedCompletion::new(vec![
            Err(CoreError::Timeout("1".into())),
            Err(CoreError::Timeout("2".into())),
            Err(CoreError::Timeout("3".into())),
            Ok(r#"{"triples": [["c", "uses", "d"]]}"#.into()),
        ]);
        let extractor = SpoExtractor::new(completion.clone(), fast_config());
        let chunks = [chunk(0, "a uses b"), chunk(1, "c uses d")];
        let report = extractor.extract(&chunks, &Schema::base()).await;

        // One initial attempt plus two retries for the first batch
        assert_eq!(completion.calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.skipped_chunks, vec!["doc:graph:0".to_string()]);
        assert_eq!(report.extractions.len(), 1);
        assert_eq!(report.extractions[0].0, 1);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let completion = QueuedCompletion::new(vec![Err(CoreError::Service("500".into()))]);
        let extractor = SpoExtractor::new(completion.clone(), fast_config());
        let report = extractor.extract(&[chunk(0, "text")], &Schema::base()).await;
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failed_batches, 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_reported() {
        let completion = QueuedCompletion::new(vec![Ok("I could not find anything.".into())]);
        let extractor = SpoExtractor::new(completion, fast_config());
        let report = extractor.extract(&[chunk(0, "text")], &Schema::base()).await;
        assert_eq!(report.parse_failures, 1);
        assert!(report.extractions.is_empty());
        assert_eq!(report.skipped_chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_scalar_reply_counts_as_parse_failure() {
        let completion = QueuedCompletion::new(vec![Ok("42".into()), Ok(r#""none""#.into())]);
        let extractor = SpoExtractor::new(completion, fast_config());
        let chunks = [chunk(0, "first"), chunk(1, "second")];
        let report = extractor.extract(&chunks, &Schema::base()).await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.parse_failures, 2);
        assert_eq!(report.failed_batches, 0);
        assert!(report.extractions.is_empty());
        assert_eq!(
            report.skipped_chunks,
            vec!["doc:graph:0".to_string(), "doc:graph:1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_batch_results_attributed_to_chunks() {
        let completion = QueuedCompletion::new(vec![Ok(r#"{"results": [
            {"chunk": 1, "triples": [["Meta", "develops", "PyTorch"]]},
            {"chunk": 0, "triples": [["PyTorch", "supports", "神经网络"]]}
        ]}"#
            .into())]);
        let config = ExtractionConfig {
            batch_size: 2,
            ..fast_config()
        };
        let extractor = SpoExtractor::new(completion.clone(), config);
        let chunks = [
            chunk(0, "PyTorch supports 神经网络."),
            chunk(1, "Meta develops PyTorch."),
        ];
        let report = extractor.extract(&chunks, &Schema::base()).await;

        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.extractions.len(), 2);
        assert_eq!(report.extractions[0].1.triples[0].predicate, "supports");
        assert_eq!(report.extractions[1].1.triples[0].predicate, "develops");
    }

    #[test]
    fn test_unlabelled_batch_attributed_by_mention() {
        let chunks = [chunk(0, "Meta develops PyTorch."), chunk(1, "PyTorch supports 神经网络.")];
        let members: Vec<&Chunk> = chunks.iter().collect();
        let mut extraction = SpoExtraction::default();
        extraction.triples.push(Triple::new("pytorch", "supports", "神经网络"));
        extraction.triples.push(Triple::new("Meta", "develops", "Llama"));
        extraction.triples.push(Triple::new("Google", "develops", "JAX"));
        extraction.attributes.insert("神经网络".into(), vec!["neural nets".into()]);

        let attributed = attribute(
            vec![crate::parsing::ChunkExtraction {
                chunk: None,
                extraction,
            }],
            &members,
        );
        let find = |member: usize| &attributed.iter().find(|(m, _)| *m == member).unwrap().1;
        assert_eq!(find(1).triples.len(), 1);
        assert!(find(1).attributes.contains_key("神经网络"));
        // Subject-only match and no match both land in the first chunk
        assert_eq!(find(0).triples.len(), 2);
    }

    #[test]
    fn test_prompt_lists_schema_and_chunks() {
        let chunks = [chunk(0, "first text"), chunk(1, "second text")];
        let members: Vec<&Chunk> = chunks.iter().collect();
        let schema = Schema::base();
        let prompt = build_prompt(&members, &schema, crate::templates::TemplateKind::Technology.template());
        assert!(prompt.contains("Relation types: related_to, part_of"));
        assert!(prompt.contains("[CHUNK 0]\nfirst text"));
        assert!(prompt.contains("[CHUNK 1]\nsecond text"));
        assert!(prompt.contains("\"results\""));
        assert!(prompt.contains("frameworks"));

        let single = build_prompt(&members[..1], &schema, crate::templates::TemplateKind::Generic.template());
        assert!(!single.contains("[CHUNK"));
        assert!(single.ends_with("first text"));
    }

    #[test]
    fn test_backoff_grows() {
        assert!(calculate_backoff(100, 1) >= 100);
        assert!(calculate_backoff(100, 3) >= 400);
        assert!(calculate_backoff(100, 3) < 440);
    }
}
