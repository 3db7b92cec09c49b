//! Entity resolution.
//!
//! Maps extracted mentions onto canonical entities (exact, then normalized,
//! then fuzzy match) and creates entities on demand for names that only
//! appear in relationships. The resolver owns the known-entity set for one
//! build; callers serialize access to it.

use crate::config::ResolverConfig;
use crate::heuristics;
use crate::parsing::SpoExtraction;
use crate::similarity::similarity;
use kgfusion_core::{
    Chunk, Entity, EntityId, EntityOrigin, Provenance, Relationship, Schema,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

const BASE_CONFIDENCE: f32 = 0.5;
const NAME_LENGTH_BONUS: f32 = 0.2;
const DESCRIPTION_BONUS: f32 = 0.2;
const OCCURRENCE_BONUS: f32 = 0.05;
const MAX_OCCURRENCE_BONUS: f32 = 0.2;
const CONTEXT_CUE_BONUS: f32 = 0.1;
/// Dynamic entities are trusted less than extracted ones
const DYNAMIC_DISCOUNT: f32 = 0.8;
const MIN_DESCRIPTIVE_LEN: usize = 30;

pub const DYNAMIC_DESCRIPTION: &str = "Dynamically created entity referenced by a relationship";

/// How a name was matched to a known entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Exact,
    Normalized,
    Fuzzy(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub id: EntityId,
    pub kind: MatchKind,
}

/// Why a dynamic entity was not created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    Noise,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooShort => f.write_str("name shorter than 2 characters"),
            Rejection::Noise => f.write_str("name is a stopword"),
        }
    }
}

/// A mention returned by extraction
#[derive(Debug, Clone)]
pub struct Mention<'a> {
    pub name: &'a str,
    pub entity_type: Option<&'a str>,
    pub attributes: &'a [String],
}

/// What resolving one chunk's extraction produced
#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    /// Entities created or updated, in first-touch order
    pub entity_ids: Vec<EntityId>,
    pub relationships: Vec<Relationship>,
    pub dynamic_created: usize,
    /// Triples dropped because an endpoint could not be resolved or created
    pub dropped_relationships: usize,
    /// Triples dropped because their label is not a schema relation type
    pub off_schema_relationships: usize,
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    config: ResolverConfig,
    /// Creation order; earlier entries win fuzzy ties
    entities: Vec<Entity>,
    by_id: HashMap<EntityId, usize>,
    by_name: HashMap<String, usize>,
    by_normalized: HashMap<String, usize>,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            entities: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_normalized: HashMap::new(),
        }
    }

    /// Seed with entities from earlier passes
    pub fn with_known(mut self, entities: impl IntoIterator<Item = Entity>) -> Self {
        for entity in entities {
            if self.by_id.contains_key(&entity.id) {
                continue;
            }
            self.insert(entity);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id).map(|&idx| &self.entities[idx])
    }

    /// Known entities in creation order
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Resolve a name against the known entities; first match wins:
    /// exact name, normalized name, then the best fuzzy candidate at or
    /// above the threshold.
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(&idx) = self.by_name.get(name) {
            return Some(self.resolution(idx, MatchKind::Exact));
        }

        let normalized = Entity::normalize(name);
        if normalized.is_empty() {
            return None;
        }
        if let Some(&idx) = self.by_normalized.get(&normalized) {
            return Some(self.resolution(idx, MatchKind::Normalized));
        }

        let mut best: Option<(usize, f32)> = None;
        for (idx, entity) in self.entities.iter().enumerate() {
            let score = similarity(&normalized, &entity.canonical_name);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((idx, score));
            }
        }
        best.filter(|(_, score)| *score >= self.config.fuzzy_threshold)
            .map(|(idx, score)| self.resolution(idx, MatchKind::Fuzzy(score)))
    }

    /// Register an entity returned by extraction, merging it into a
    /// matching known entity when there is one
    pub fn register_extracted(
        &mut self,
        mention: &Mention<'_>,
        source_text: &str,
        schema: &Schema,
        provenance: Provenance,
    ) -> Option<EntityId> {
        let name = mention.name.trim();
        if Entity::normalize(name).is_empty() {
            return None;
        }

        let context = self.context_window(name, source_text);
        let description = if mention.attributes.is_empty() {
            context.clone().unwrap_or_default()
        } else {
            mention.attributes.join("; ")
        };
        let confidence =
            score_confidence(name, &description, context.as_deref(), source_text, schema);
        let entity_type = mention
            .entity_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| heuristics::infer_type(name, schema));

        let candidate = Entity::new(name, entity_type, EntityOrigin::Extracted)
            .with_description(description)
            .with_confidence(confidence)
            .with_provenance(provenance);

        Some(self.merge_or_insert(name, candidate))
    }

    /// Resolve `name`, creating a dynamic entity when nothing matches.
    pub fn create_if_missing(
        &mut self,
        name: &str,
        source_text: &str,
        schema: &Schema,
        provenance: Provenance,
    ) -> std::result::Result<EntityId, Rejection> {
        let name = name.trim();
        if let Some(resolution) = self.resolve(name) {
            let idx = self.by_id[&resolution.id];
            self.entities[idx].add_provenance(provenance);
            self.remember_alias(name, idx);
            return Ok(resolution.id);
        }

        check_creatable(name)?;

        let context = self.context_window(name, source_text);
        let description = context.clone().unwrap_or_else(|| DYNAMIC_DESCRIPTION.to_string());
        let confidence = score_confidence(name, &description, context.as_deref(), source_text, schema)
            * DYNAMIC_DISCOUNT;
        let entity = Entity::new(name, heuristics::infer_type(name, schema), EntityOrigin::Dynamic)
            .with_description(description)
            .with_confidence(confidence)
            .with_provenance(provenance);

        debug!(
            name,
            entity_type = %entity.entity_type,
            confidence = entity.confidence,
            "Created dynamic entity"
        );
        let id = entity.id.clone();
        self.insert(entity);
        Ok(id)
    }

    /// Resolve one chunk's extraction: register extracted entities, then
    /// turn triples into relationships whose endpoints both exist.
    pub fn resolve_extraction(
        &mut self,
        extraction: &SpoExtraction,
        chunk: &Chunk,
        schema: &Schema,
        enforce_relation_types: bool,
    ) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        let mut touched = HashSet::new();
        let provenance = Provenance::new(&chunk.document_id, &chunk.id);
        let no_attributes: Vec<String> = Vec::new();

        let extracted_names = extraction
            .attributes
            .keys()
            .chain(extraction.entity_types.keys().filter(|name| {
                !extraction.attributes.contains_key(name.as_str())
            }));
        for name in extracted_names {
            let mention = Mention {
                name,
                entity_type: extraction.entity_types.get(name).map(String::as_str),
                attributes: extraction.attributes.get(name).unwrap_or(&no_attributes),
            };
            if let Some(id) =
                self.register_extracted(&mention, &chunk.content, schema, provenance.clone())
            {
                if touched.insert(id.clone()) {
                    outcome.entity_ids.push(id);
                }
            }
        }

        for triple in &extraction.triples {
            let label = Relationship::normalize_label(&triple.predicate);
            if label.is_empty() {
                outcome.dropped_relationships += 1;
                continue;
            }
            if enforce_relation_types && !schema.has_relation_type(&label) {
                outcome.off_schema_relationships += 1;
                continue;
            }

            // Check both endpoints first so a rejected object never leaves
            // an orphaned subject behind
            if let Err(reason) = self
                .admissible(&triple.subject)
                .and_then(|_| self.admissible(&triple.object))
            {
                debug!(
                    subject = %triple.subject,
                    object = %triple.object,
                    %reason,
                    "Dropping relationship with unresolvable endpoint"
                );
                outcome.dropped_relationships += 1;
                continue;
            }

            let before = self.len();
            let endpoints = self
                .create_if_missing(&triple.subject, &chunk.content, schema, provenance.clone())
                .and_then(|source| {
                    self.create_if_missing(&triple.object, &chunk.content, schema, provenance.clone())
                        .map(|target| (source, target))
                });
            outcome.dynamic_created += self.len() - before;
            let Ok((source, target)) = endpoints else {
                outcome.dropped_relationships += 1;
                continue;
            };

            let confidence = self.confidence_of(&source).min(self.confidence_of(&target));
            for id in [&source, &target] {
                if touched.insert(id.clone()) {
                    outcome.entity_ids.push(id.clone());
                }
            }
            outcome.relationships.push(
                Relationship::new(source, label, target)
                    .with_confidence(confidence)
                    .with_provenance(provenance.clone()),
            );
        }

        if outcome.dropped_relationships > 0 {
            warn!(
                chunk = %chunk.id,
                dropped = outcome.dropped_relationships,
                "Relationships dropped during resolution"
            );
        }
        outcome
    }

    /// Whether `name` resolves or could be created
    fn admissible(&self, name: &str) -> std::result::Result<(), Rejection> {
        if self.resolve(name).is_some() {
            return Ok(());
        }
        check_creatable(name.trim())
    }

    fn confidence_of(&self, id: &str) -> f32 {
        self.get(id).map_or(0.0, |entity| entity.confidence)
    }

    fn resolution(&self, idx: usize, kind: MatchKind) -> Resolution {
        Resolution {
            id: self.entities[idx].id.clone(),
            kind,
        }
    }

    fn merge_or_insert(&mut self, name: &str, candidate: Entity) -> EntityId {
        match self.resolve(name) {
            Some(resolution) => {
                let idx = self.by_id[&resolution.id];
                let entity = &mut self.entities[idx];
                if entity.origin == EntityOrigin::Dynamic {
                    // Extraction knows the type better than name heuristics
                    entity.entity_type = candidate.entity_type.clone();
                }
                entity.absorb(&candidate);
                self.remember_alias(name, idx);
                resolution.id
            }
            None => {
                let id = candidate.id.clone();
                self.insert(candidate);
                id
            }
        }
    }

    fn insert(&mut self, entity: Entity) {
        let idx = self.entities.len();
        self.by_id.insert(entity.id.clone(), idx);
        self.by_name.entry(entity.name.clone()).or_insert(idx);
        self.by_normalized
            .entry(entity.canonical_name.clone())
            .or_insert(idx);
        self.entities.push(entity);
    }

    fn remember_alias(&mut self, name: &str, idx: usize) {
        self.by_name.entry(name.to_string()).or_insert(idx);
        let normalized = Entity::normalize(name);
        if !normalized.is_empty() {
            self.by_normalized.entry(normalized).or_insert(idx);
        }
    }

    /// Text around the first occurrence of `name`, whitespace-collapsed
    fn context_window(&self, name: &str, source_text: &str) -> Option<String> {
        let (start, end) = find_case_insensitive(source_text, name)?;
        let window = self.config.context_window;
        let from = source_text[..start]
            .char_indices()
            .rev()
            .nth(window.saturating_sub(1))
            .map_or(0, |(i, _)| i);
        let to = source_text[end..]
            .char_indices()
            .nth(window)
            .map_or(source_text.len(), |(i, _)| end + i);
        let context = source_text[from..to]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        (!context.is_empty()).then_some(context)
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

fn check_creatable(name: &str) -> std::result::Result<(), Rejection> {
    if name.chars().count() < 2 {
        return Err(Rejection::TooShort);
    }
    if heuristics::is_noise(name) {
        return Err(Rejection::Noise);
    }
    Ok(())
}

/// Confidence before any origin discount, in [0, 1]
fn score_confidence(
    name: &str,
    description: &str,
    context: Option<&str>,
    source_text: &str,
    schema: &Schema,
) -> f32 {
    let mut confidence = BASE_CONFIDENCE;
    if name.chars().count() >= 4 {
        confidence += NAME_LENGTH_BONUS;
    }
    // The generic fallback description carries no information
    if description != DYNAMIC_DESCRIPTION && description.chars().count() > MIN_DESCRIPTIVE_LEN {
        confidence += DESCRIPTION_BONUS;
    }
    let occurrences = count_occurrences(source_text, name);
    confidence += (OCCURRENCE_BONUS * occurrences as f32).min(MAX_OCCURRENCE_BONUS);
    if context.is_some_and(|context| heuristics::has_schema_cue(context, schema)) {
        confidence += CONTEXT_CUE_BONUS;
    }
    confidence.clamp(0.0, 1.0)
}

/// Byte span of the first case-insensitive match of `needle`
fn find_case_insensitive(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    if let Some(start) = haystack.find(needle) {
        return Some((start, start + needle.len()));
    }
    let lower_haystack = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    // Offsets only carry over when lowercasing preserved byte lengths
    if lower_haystack.len() != haystack.len() || lower_needle.len() != needle.len() {
        return None;
    }
    let start = lower_haystack.find(&lower_needle)?;
    let end = start + needle.len();
    (haystack.is_char_boundary(start) && haystack.is_char_boundary(end)).then_some((start, end))
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let needle = needle.to_lowercase();
    if needle.is_empty() {
        return 0;
    }
    haystack.to_lowercase().matches(&needle).count()
}
