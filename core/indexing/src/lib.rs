pub mod ai_client;
pub mod entities;
pub mod graph_builder;
pub mod graph_store;
pub mod sync;
pub mod vector_store;

pub use ai_client::{
    AiConfig, AiServiceClient, ConceptService, ConceptSpan, Embedding, EmbeddingService,
    ServiceError,
};
pub use entities::{dedupe, map_label, metadata_entities, EntityExtractor};
pub use graph_builder::{BuildReport, GraphBuilder, GraphBuilderConfig, GraphSessionHook};
pub use graph_store::{GraphError, GraphStats, KnowledgeGraph, LearningGap};
pub use sync::{activity_vector_metadata, EmbeddingSync, SyncReport};
pub use vector_store::{
    cosine_similarity, InMemoryVectorStore, SharedVectorStore, SqliteVectorStore, VectorFilter,
    VectorMatch, VectorMetadata, VectorStore,
};
