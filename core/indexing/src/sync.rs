use learntrail_ingestion::database::format_ts;
use learntrail_schemas::Activity;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::ai_client::{EmbeddingService, ServiceError};
use crate::vector_store::{SharedVectorStore, VectorMetadata};

/// Embedding requests allowed in flight against the AI service
pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Metadata stored next to each activity vector; the graph builder filters on it.
pub fn activity_vector_metadata(activity: &Activity) -> VectorMetadata {
    let mut metadata = VectorMetadata::new();
    metadata.insert(
        "activity_type".to_string(),
        activity.activity_type.as_str().to_string(),
    );
    metadata.insert("timestamp".to_string(), format_ts(activity.timestamp));
    metadata.insert("title".to_string(), activity.title.clone());
    if let Some(session_id) = &activity.session_id {
        metadata.insert("session_id".to_string(), session_id.0.clone());
    }
    metadata
}

/// Bounded worker pool that embeds activities missing from the vector store.
pub struct EmbeddingSync {
    service: Arc<dyn EmbeddingService>,
    vectors: SharedVectorStore,
    concurrency: usize,
}

impl EmbeddingSync {
    pub fn new(service: Arc<dyn EmbeddingService>, vectors: SharedVectorStore) -> Self {
        Self {
            service,
            vectors,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn sync_activities(&self, activities: &[Activity]) -> SyncReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut report = SyncReport::default();

        {
            let vectors = self.vectors.read().await;
            for activity in activities {
                let text = activity.semantic_text();
                if vectors.contains(&activity.id.0) || text.trim().is_empty() {
                    report.skipped += 1;
                    continue;
                }

                let service = self.service.clone();
                let semaphore = semaphore.clone();
                let activity = activity.clone();
                tasks.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => service.generate_embedding(&text).await,
                        Err(_) => Err(ServiceError::Unavailable("embedding pool closed".to_string())),
                    };
                    (activity, text, result)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((activity, text, Ok(embedding))) => {
                    let metadata = activity_vector_metadata(&activity);
                    let mut vectors = self.vectors.write().await;
                    match vectors.upsert(&activity.id.0, embedding.vector, &text, metadata) {
                        Ok(()) => report.embedded += 1,
                        Err(e) => {
                            error!("Failed to store embedding for {}: {}", activity.id, e);
                            report.failed += 1;
                        }
                    }
                }
                Ok((activity, _, Err(e))) => {
                    warn!("Embedding failed for {}: {}", activity.id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Embedding task aborted: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Embedding sync: {} embedded, {} skipped, {} failed",
            report.embedded, report.skipped, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::Embedding;
    use crate::vector_store::{InMemoryVectorStore, VectorStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use learntrail_ingestion::ActivityFactory;
    use learntrail_schemas::{Classification, ClassificationResult, Observation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowEmbedder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingService for SlowEmbedder {
        async fn generate_embedding(&self, text: &str) -> Result<Embedding, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if text.contains("broken") {
                return Err(ServiceError::Status {
                    status: 500,
                    body: "model crashed".to_string(),
                });
            }
            Ok(Embedding {
                vector: vec![text.len() as f32, 1.0],
                model: "fake".to_string(),
            })
        }
    }

    fn activity(title: &str) -> Activity {
        let observation = Observation::new("Chrome", title, Utc::now()).with_url("https://example.com");
        ActivityFactory::from_observation(
            &observation,
            &ClassificationResult {
                classification: Classification::Unknown,
                confidence: 0.5,
                reason: "test".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_pool_is_bounded_and_counts_outcomes() {
        let vectors = InMemoryVectorStore::new().shared();
        let embedder = Arc::new(SlowEmbedder {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut batch: Vec<Activity> = (0..8).map(|i| activity(&format!("page {}", i))).collect();
        batch.push(activity("broken page"));

        let existing = activity("already embedded");
        vectors
            .write()
            .await
            .upsert(&existing.id.0, vec![1.0, 0.0], "x", VectorMetadata::new())
            .unwrap();
        batch.push(existing);

        let sync = EmbeddingSync::new(embedder.clone(), vectors.clone());
        let report = sync.sync_activities(&batch).await;

        assert_eq!(
            report,
            SyncReport {
                embedded: 8,
                skipped: 1,
                failed: 1
            }
        );
        assert!(embedder.peak.load(Ordering::SeqCst) <= DEFAULT_CONCURRENCY);
        assert_eq!(vectors.read().await.len(), 9);

        let stored = vectors.read().await;
        let first = &batch[0];
        assert!(stored.contains(&first.id.0));
    }
}
