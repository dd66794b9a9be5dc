/// Client for the local AI service (embeddings, concept spans, ML activity classification).
/// Every failure is a typed `ServiceError` so callers can degrade instead of aborting.

use anyhow::{Context, Result};
use async_trait::async_trait;
use learntrail_ingestion::{MlClassifier, MlPrediction};
use learntrail_schemas::Observation;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("AI service unavailable: {0}")]
    Unavailable(String),

    #[error("AI service timed out after {0:?}")]
    Timeout(Duration),

    #[error("AI service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed AI service response: {0}")]
    Decode(String),
}

// ============================================================================
// Service seams
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Concept span as returned by the NLP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptSpan {
    pub text: String,
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn generate_embedding(&self, text: &str) -> Result<Embedding, ServiceError>;
}

#[async_trait]
pub trait ConceptService: Send + Sync {
    async fn extract_concepts(
        &self,
        text: &str,
        min_confidence: f32,
    ) -> Result<Vec<ConceptSpan>, ServiceError>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub embedding_model: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_secs: 5,
            embedding_model: None,
        }
    }
}

impl AiConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let timeout_secs = match std::env::var("LEARNTRAIL_AI_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid LEARNTRAIL_AI_TIMEOUT_SECS: {}", raw))?,
            Err(_) => defaults.timeout_secs,
        };

        Ok(Self {
            base_url: std::env::var("LEARNTRAIL_AI_URL").unwrap_or(defaults.base_url),
            timeout_secs,
            embedding_model: std::env::var("LEARNTRAIL_EMBEDDING_MODEL").ok(),
        })
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    text: &'a str,
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
    model: String,
    #[serde(default)]
    dimension: Option<usize>,
}

#[derive(Serialize)]
struct ConceptsRequest<'a> {
    text: &'a str,
    min_confidence: f32,
}

#[derive(Deserialize)]
struct ConceptsResponse {
    concepts: Vec<ConceptSpan>,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    app_name: &'a str,
    window_title: &'a str,
    url: Option<&'a str>,
    content_snippet: Option<&'a str>,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    activity_type: String,
    confidence: f32,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct AiServiceClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    embedding_model: Option<String>,
}

impl AiServiceClient {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build AI service HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            embedding_model: config.embedding_model.clone(),
        })
    }

    pub async fn health(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("AI service health check failed: {}", e);
                false
            }
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, ServiceError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/api/v1/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }

    fn map_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout(self.timeout)
        } else if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl EmbeddingService for AiServiceClient {
    async fn generate_embedding(&self, text: &str) -> Result<Embedding, ServiceError> {
        let response: EmbeddingResponse = self
            .post(
                "embedding",
                &EmbeddingRequest {
                    text,
                    model: self.embedding_model.as_deref(),
                },
            )
            .await?;

        if response.embedding.is_empty() {
            return Err(ServiceError::Decode("empty embedding".to_string()));
        }
        if let Some(dimension) = response.dimension {
            if dimension != response.embedding.len() {
                return Err(ServiceError::Decode(format!(
                    "dimension {} does not match vector length {}",
                    dimension,
                    response.embedding.len()
                )));
            }
        }

        Ok(Embedding {
            vector: response.embedding,
            model: response.model,
        })
    }
}

#[async_trait]
impl ConceptService for AiServiceClient {
    async fn extract_concepts(
        &self,
        text: &str,
        min_confidence: f32,
    ) -> Result<Vec<ConceptSpan>, ServiceError> {
        let response: ConceptsResponse = self
            .post(
                "concepts",
                &ConceptsRequest {
                    text,
                    min_confidence,
                },
            )
            .await?;
        Ok(response.concepts)
    }
}

#[async_trait]
impl MlClassifier for AiServiceClient {
    async fn classify_activity(&self, observation: &Observation) -> Result<MlPrediction> {
        let response: ClassifyResponse = self
            .post(
                "classify-activity",
                &ClassifyRequest {
                    app_name: &observation.app_name,
                    window_title: &observation.window_title,
                    url: observation.url.as_deref(),
                    content_snippet: None,
                },
            )
            .await?;

        Ok(MlPrediction {
            activity_type: response.activity_type,
            confidence: response.confidence.clamp(0.0, 1.0),
            reason: response.reason,
            metadata: response.metadata,
        })
    }
}
