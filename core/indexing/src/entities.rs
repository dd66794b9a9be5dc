use learntrail_schemas::{slugify, Activity, ActivityType, Entity, EntityType, MetadataDetails};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ai_client::{ConceptService, ConceptSpan};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

const STRUCTURAL_CONFIDENCE: f32 = 1.0;
const METADATA_TOPIC_CONFIDENCE: f32 = 0.9;
const FALLBACK_CONFIDENCE: f32 = 0.7;

const TECH_KEYWORDS: &[&str] = &[
    "react",
    "vue",
    "angular",
    "svelte",
    "nextjs",
    "node",
    "nodejs",
    "typescript",
    "javascript",
    "python",
    "rust",
    "golang",
    "java",
    "kotlin",
    "swift",
    "django",
    "flask",
    "fastapi",
    "rails",
    "docker",
    "kubernetes",
    "terraform",
    "aws",
    "graphql",
    "postgres",
    "postgresql",
    "sqlite",
    "redis",
    "tokio",
    "pytorch",
    "tensorflow",
    "pandas",
    "numpy",
    "tailwind",
    "webassembly",
    "wasm",
    "git",
    "linux",
];

/// Map an NER label to an entity type
pub fn map_label(label: &str) -> Option<EntityType> {
    match label.to_uppercase().as_str() {
        "PERSON" | "PER" => Some(EntityType::Person),
        "ORG" | "ORGANIZATION" => Some(EntityType::Organization),
        "TECH" | "PRODUCT" | "OTHER" | "MISC" => Some(EntityType::Topic),
        "LOCATION" | "GPE" | "LOC" => Some(EntityType::Location),
        "MOVIE" | "VIDEO" | "WORK_OF_ART" => Some(EntityType::Video),
        "GAME" => Some(EntityType::Game),
        "BOOK" | "PDF" => Some(EntityType::Pdf),
        "PROJECT" => Some(EntityType::Project),
        _ => None,
    }
}

/// Entities the activity already carries structurally; no NLP needed.
pub fn metadata_entities(activity: &Activity) -> Vec<Entity> {
    let mut entities = Vec::new();

    if let Some(video_id) = &activity.video_id {
        let mut entity = Entity::new(EntityType::Video, &media_title(&activity.title), STRUCTURAL_CONFIDENCE);
        entity.metadata.insert("video_id".to_string(), video_id.clone());
        entities.push(entity);
    }

    if let Some(game) = &activity.game_name {
        entities.push(Entity::new(EntityType::Game, game, STRUCTURAL_CONFIDENCE));
    }

    if let Some(project) = &activity.project_name {
        entities.push(Entity::new(EntityType::Project, project, STRUCTURAL_CONFIDENCE));
    }

    if let MetadataDetails::Reading(reading) = &activity.metadata.details {
        if reading.document_type.as_deref() == Some("pdf") {
            let name = activity
                .file_path
                .as_deref()
                .and_then(|p| p.rsplit(['/', '\\']).next())
                .unwrap_or(&activity.title);
            let mut entity = Entity::new(EntityType::Pdf, name, STRUCTURAL_CONFIDENCE);
            if let Some(path) = &activity.file_path {
                entity.metadata.insert("path".to_string(), path.clone());
            }
            entities.push(entity);
        }
    }

    if activity.activity_type == ActivityType::Coding {
        for framework in activity.metadata.frameworks() {
            entities.push(Entity::new(EntityType::Topic, framework, METADATA_TOPIC_CONFIDENCE));
        }
        if let Some(language) = activity.metadata.language() {
            entities.push(Entity::new(EntityType::Topic, language, METADATA_TOPIC_CONFIDENCE));
        }
    }

    entities
}

/// Drop the trailing " - Platform" suffix from media titles
fn media_title(title: &str) -> String {
    match title.rsplit_once(" - ") {
        Some((head, _)) if !head.trim().is_empty() => head.trim().to_string(),
        _ => title.trim().to_string(),
    }
}

/// Keep the highest-confidence entity per (type, normalized name), first-seen order.
pub fn dedupe(entities: Vec<Entity>) -> Vec<Entity> {
    let mut index: HashMap<(EntityType, String), usize> = HashMap::new();
    let mut out: Vec<Entity> = Vec::new();

    for entity in entities {
        let key = (entity.entity_type, slugify(&entity.entity_name));
        if key.1.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                if entity.confidence > out[i].confidence {
                    out[i] = entity;
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(entity);
            }
        }
    }

    out
}

struct FallbackPatterns {
    specialised: Vec<(Regex, EntityType)>,
}

impl FallbackPatterns {
    fn new() -> Self {
        let pattern = |re: &str| Regex::new(re).expect("valid entity pattern");
        Self {
            specialised: vec![
                (pattern(r#"(?i)watch(?:ed|ing)\s+"([^"]+)""#), EntityType::Video),
                (pattern(r#"(?i)play(?:ed|ing)\s+"([^"]+)""#), EntityType::Game),
                (pattern(r#"(?i)read(?:ing)?\s+"([^"]+)""#), EntityType::Pdf),
                (pattern(r"(?i)project:\s*([\w.\-]+)"), EntityType::Project),
                (pattern(r"(?i)working on\s+([\w.\-]+)"), EntityType::Project),
            ],
        }
    }
}

/// Typed entity extraction: structural metadata first, then NLP spans or the keyword fallback.
pub struct EntityExtractor {
    concepts: Option<Arc<dyn ConceptService>>,
    min_confidence: f32,
    patterns: FallbackPatterns,
}

impl EntityExtractor {
    pub fn new(concepts: Option<Arc<dyn ConceptService>>) -> Self {
        Self {
            concepts,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            patterns: FallbackPatterns::new(),
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub async fn extract(&self, activity: &Activity) -> Vec<Entity> {
        let mut entities = metadata_entities(activity);
        let text = activity.semantic_text();

        let extracted = match &self.concepts {
            Some(service) => match service.extract_concepts(&text, self.min_confidence).await {
                Ok(spans) => self.from_spans(&spans),
                Err(e) => {
                    warn!("Concept extraction unavailable for {}, using keywords: {}", activity.id, e);
                    self.extract_fallback(&text)
                }
            },
            None => self.extract_fallback(&text),
        };
        entities.extend(extracted);

        let entities: Vec<Entity> = entities
            .into_iter()
            .filter(|e| e.confidence >= self.min_confidence)
            .collect();
        let entities = dedupe(entities);

        debug!("Extracted {} entities from {}", entities.len(), activity.id);
        entities
    }

    pub fn from_spans(&self, spans: &[ConceptSpan]) -> Vec<Entity> {
        spans
            .iter()
            .filter_map(|span| {
                let entity_type = map_label(&span.label)?;
                let name = span.text.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Entity::new(entity_type, name, span.confidence))
            })
            .collect()
    }

    /// Regex and keyword extraction used when the concept service cannot answer.
    pub fn extract_fallback(&self, text: &str) -> Vec<Entity> {
        let mut entities = Vec::new();

        for (pattern, entity_type) in &self.patterns.specialised {
            for captures in pattern.captures_iter(text) {
                if let Some(name) = captures.get(1) {
                    entities.push(Entity::new(*entity_type, name.as_str(), FALLBACK_CONFIDENCE));
                }
            }
        }

        let lowered = text.to_lowercase();
        let mut seen = Vec::new();
        for token in lowered.split(|c: char| !(c.is_alphanumeric() || c == '.' || c == '+' || c == '#')) {
            let token = token.trim_matches('.');
            let token = if token == "next.js" { "nextjs" } else { token.trim_end_matches(".js") };
            if TECH_KEYWORDS.contains(&token) && !seen.contains(&token) {
                seen.push(token);
                entities.push(Entity::new(EntityType::Topic, token, FALLBACK_CONFIDENCE));
            }
        }

        entities
    }
}
