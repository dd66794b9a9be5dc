use anyhow::Result;
use async_trait::async_trait;
use learntrail_schemas::{ActivityType, Classification, ClassificationResult, Observation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::enrich::{url_host, EDITOR_APPS};
use crate::whitelist::host_matches;

/// Minimum confidence for a result to count as learning, and for an ML answer to be accepted.
pub const LEARNING_THRESHOLD: f32 = 0.6;

const ENTERTAINMENT_CONFIDENCE: f32 = 0.8;

const ENTERTAINMENT_KEYWORDS: &[&str] = &[
    "netflix",
    "hulu",
    "disney+",
    "prime video",
    "tiktok",
    "instagram",
    "facebook",
    "spotify",
    "twitch",
    "gameplay",
    "let's play",
    "trailer",
    "meme",
    "funny",
];

const LEARNING_DOMAINS: &[&str] = &[
    "stackoverflow.com",
    "github.com",
    "developer.mozilla.org",
    "docs.rs",
    "doc.rust-lang.org",
    "readthedocs.io",
    "python.org",
    "coursera.org",
    "udemy.com",
    "edx.org",
    "khanacademy.org",
    "freecodecamp.org",
    "arxiv.org",
    "wikipedia.org",
    "dev.to",
    "leetcode.com",
    "w3schools.com",
];

const LEARNING_KEYWORDS: &[&str] = &[
    "tutorial",
    "course",
    "lecture",
    "documentation",
    "docs",
    "learn",
    "guide",
    "how to",
    "introduction",
    "explained",
    "lesson",
    "reference",
    "study",
    "programming",
    "algorithm",
];

const NOTES_APPS: &[&str] = &[
    "notion", "obsidian", "notes", "evernote", "onenote", "logseq", "word", "pages", "docs",
];

// ============================================================================
// ML seam
// ============================================================================

/// Answer of an ML activity classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlPrediction {
    pub activity_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait MlClassifier: Send + Sync {
    async fn classify_activity(&self, observation: &Observation) -> Result<MlPrediction>;
}

struct CachedPrediction {
    prediction: MlPrediction,
    stored_at: Instant,
}

// ============================================================================
// Classifier
// ============================================================================

/// Rule-based classifier with an optional ML front.
pub struct ActivityClassifier {
    ml: Option<Arc<dyn MlClassifier>>,
    ml_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedPrediction>>,
}

impl Default for ActivityClassifier {
    fn default() -> Self {
        Self::rule_based()
    }
}

impl ActivityClassifier {
    pub fn rule_based() -> Self {
        Self {
            ml: None,
            ml_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ml(ml: Arc<dyn MlClassifier>, ml_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            ml: Some(ml),
            ml_timeout,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// ML first when configured, rules otherwise or on any ML failure.
    pub async fn classify(&self, observation: &Observation) -> ClassificationResult {
        if let Some(ml) = &self.ml {
            if let Some(result) = self.classify_ml(ml.as_ref(), observation).await {
                return result;
            }
        }
        classify_rules(observation)
    }

    async fn classify_ml(
        &self,
        ml: &dyn MlClassifier,
        observation: &Observation,
    ) -> Option<ClassificationResult> {
        let key = cache_key(observation);

        let prediction = match self.cached(&key) {
            Some(hit) => hit,
            None => match tokio::time::timeout(self.ml_timeout, ml.classify_activity(observation)).await {
                Ok(Ok(prediction)) => {
                    self.store(key, prediction.clone());
                    prediction
                }
                Ok(Err(e)) => {
                    debug!("ML classifier unavailable, using rules: {}", e);
                    return None;
                }
                Err(_) => {
                    warn!("ML classifier timed out after {:?}, using rules", self.ml_timeout);
                    return None;
                }
            },
        };

        if !prediction.confidence.is_finite() || prediction.confidence < LEARNING_THRESHOLD {
            debug!(
                "ML confidence {:.2} below threshold, using rules",
                prediction.confidence
            );
            return None;
        }

        let activity_type = map_ml_activity_type(&prediction.activity_type);
        Some(ClassificationResult {
            classification: classification_for(activity_type),
            confidence: prediction.confidence.clamp(0.0, 1.0),
            reason: prediction
                .reason
                .unwrap_or_else(|| format!("ml: {}", activity_type)),
        })
    }

    fn cached(&self, key: &str) -> Option<MlPrediction> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.prediction.clone())
    }

    fn store(&self, key: String, prediction: MlPrediction) {
        if let Ok(mut cache) = self.cache.lock() {
            let ttl = self.cache_ttl;
            cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
            cache.insert(
                key,
                CachedPrediction {
                    prediction,
                    stored_at: Instant::now(),
                },
            );
        }
    }
}

fn cache_key(observation: &Observation) -> String {
    format!(
        "{}|{}|{}",
        observation.app_name,
        observation.window_title,
        observation.url.as_deref().unwrap_or_default()
    )
}

/// Deterministic keyword scoring.
pub fn classify_rules(observation: &Observation) -> ClassificationResult {
    let app = observation.app_name.to_lowercase();
    let text = format!(
        "{} {} {}",
        app,
        observation.window_title.to_lowercase(),
        observation.url.as_deref().unwrap_or_default().to_lowercase()
    );

    if let Some(keyword) = ENTERTAINMENT_KEYWORDS.iter().find(|k| text.contains(*k)) {
        return ClassificationResult {
            classification: Classification::Entertainment,
            confidence: ENTERTAINMENT_CONFIDENCE,
            reason: format!("entertainment keyword '{}'", keyword),
        };
    }

    let mut confidence: f32 = 0.5;
    let mut reasons = Vec::new();

    let host = observation.url.as_deref().and_then(url_host);
    if let Some(host) = &host {
        if LEARNING_DOMAINS.iter().any(|d| host_matches(host, d)) {
            confidence += 0.3;
            reasons.push(format!("learning domain {}", host));
        }
    }

    let keyword_hits = LEARNING_KEYWORDS.iter().filter(|k| text.contains(*k)).count();
    if keyword_hits > 0 {
        confidence += (keyword_hits as f32 * 0.1).min(0.3);
        reasons.push(format!("{} learning keywords", keyword_hits));
    }

    if EDITOR_APPS.iter().any(|e| app.contains(e)) {
        confidence += 0.2;
        reasons.push("editor app".to_string());
    } else if NOTES_APPS.iter().any(|n| app.contains(n)) {
        confidence += 0.1;
        reasons.push("notes app".to_string());
    }

    let confidence = confidence.min(1.0);
    let classification = if confidence >= LEARNING_THRESHOLD {
        Classification::Learning
    } else {
        Classification::Unknown
    };

    ClassificationResult {
        classification,
        confidence,
        reason: if reasons.is_empty() {
            "no learning signals".to_string()
        } else {
            reasons.join(", ")
        },
    }
}

/// Maps a free-form ML label onto an activity type.
pub fn map_ml_activity_type(label: &str) -> ActivityType {
    const TABLE: &[(&[&str], ActivityType)] = &[
        (&["code", "programming", "editor"], ActivityType::Coding),
        (&["read", "book", "pdf"], ActivityType::Reading),
        (&["video", "youtube", "stream"], ActivityType::Watching),
        (&["game", "play"], ActivityType::Gaming),
        (&["shop", "buy", "ecommerce"], ActivityType::Shopping),
        (&["social", "media"], ActivityType::Social),
        (&["learn", "study", "tutorial"], ActivityType::Learning),
        (&["entertain", "movie", "music"], ActivityType::Entertainment),
        (&["work", "office"], ActivityType::Work),
    ];

    let lower = label.trim().to_lowercase();
    if let Ok(exact) = lower.parse::<ActivityType>() {
        return exact;
    }
    TABLE
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ActivityType::Other)
}

pub fn classification_for(activity_type: ActivityType) -> Classification {
    match activity_type {
        ActivityType::Learning
        | ActivityType::Coding
        | ActivityType::Reading
        | ActivityType::Watching => Classification::Learning,
        ActivityType::Entertainment
        | ActivityType::Gaming
        | ActivityType::Social
        | ActivityType::Shopping => Classification::Entertainment,
        ActivityType::Browsing | ActivityType::Work | ActivityType::Other => {
            Classification::Unknown
        }
    }
}
