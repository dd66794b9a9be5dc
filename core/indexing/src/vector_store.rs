use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub type VectorMetadata = BTreeMap<String, String>;

/// Shared handle used by the graph builder, the sync pool and the daemon
pub type SharedVectorStore = Arc<RwLock<Box<dyn VectorStore>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    /// `1 - cosine similarity`
    pub distance: f32,
    pub document: String,
    pub metadata: VectorMetadata,
}

impl VectorMatch {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Metadata conditions applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    conditions: Vec<(String, Vec<String>)>,
    exclude_ids: HashSet<String>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.one_of(key, &[value])
    }

    pub fn one_of(mut self, key: &str, values: &[&str]) -> Self {
        self.conditions.push((
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        ));
        self
    }

    pub fn excluding(mut self, id: &str) -> Self {
        self.exclude_ids.insert(id.to_string());
        self
    }

    pub fn matches(&self, id: &str, metadata: &VectorMetadata) -> bool {
        if self.exclude_ids.contains(id) {
            return false;
        }
        self.conditions.iter().all(|(key, allowed)| {
            metadata
                .get(key)
                .map(|value| allowed.iter().any(|a| a == value))
                .unwrap_or(false)
        })
    }
}

pub trait VectorStore: Send + Sync {
    fn upsert(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        document: &str,
        metadata: VectorMetadata,
    ) -> Result<()>;
    fn query(&self, embedding: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>>;
    fn get(&self, id: &str) -> Option<Vec<f32>>;
    fn delete(&mut self, id: &str) -> Result<bool>;
    fn len(&self) -> usize;

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cosine similarity; zero when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

struct StoredVector {
    embedding: Vec<f32>,
    document: String,
    metadata: VectorMetadata,
}

/// Brute-force nearest-neighbour store
#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: HashMap<String, StoredVector>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedVectorStore {
        let store: Box<dyn VectorStore> = Box::new(self);
        Arc::new(RwLock::new(store))
    }
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        document: &str,
        metadata: VectorMetadata,
    ) -> Result<()> {
        self.vectors.insert(
            id.to_string(),
            StoredVector {
                embedding,
                document: document.to_string(),
                metadata,
            },
        );
        Ok(())
    }

    fn query(&self, embedding: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>> {
        let mut matches: Vec<VectorMatch> = self
            .vectors
            .iter()
            .filter(|(id, stored)| filter.matches(id, &stored.metadata))
            .map(|(id, stored)| VectorMatch {
                id: id.clone(),
                distance: 1.0 - cosine_similarity(embedding, &stored.embedding),
                document: stored.document.clone(),
                metadata: stored.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);

        Ok(matches)
    }

    fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.vectors.get(id).map(|v| v.embedding.clone())
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        Ok(self.vectors.remove(id).is_some())
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

// ============================================================================
// SQLite-backed store
// ============================================================================

/// Write-through store: the `embeddings` table is the durable copy, queries hit memory.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    inner: InMemoryVectorStore,
}

impl SqliteVectorStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS embeddings (
                id TEXT PRIMARY KEY,
                vector TEXT NOT NULL,
                document TEXT NOT NULL DEFAULT '',
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        let mut inner = InMemoryVectorStore::new();
        {
            let mut stmt = conn.prepare("SELECT id, vector, document, metadata FROM embeddings")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (id, vector, document, metadata) = row?;
                let vector: Vec<f32> = serde_json::from_str(&vector)?;
                let metadata: VectorMetadata = serde_json::from_str(&metadata).unwrap_or_default();
                inner.upsert(&id, vector, &document, metadata)?;
            }
        }

        info!("Loaded {} embeddings", inner.len());
        Ok(Self {
            conn: Mutex::new(conn),
            inner,
        })
    }

    pub fn shared(self) -> SharedVectorStore {
        let store: Box<dyn VectorStore> = Box::new(self);
        Arc::new(RwLock::new(store))
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("embedding store connection poisoned"))
    }
}

impl VectorStore for SqliteVectorStore {
    fn upsert(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        document: &str,
        metadata: VectorMetadata,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO embeddings (id, vector, document, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                vector = excluded.vector,
                document = excluded.document,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                id,
                serde_json::to_string(&embedding)?,
                document,
                serde_json::to_string(&metadata)?,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        self.inner.upsert(id, embedding, document, metadata)
    }

    fn query(&self, embedding: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>> {
        self.inner.query(embedding, k, filter)
    }

    fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.inner.get(id)
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        self.conn()?
            .execute("DELETE FROM embeddings WHERE id = ?1", params![id])?;
        self.inner.delete(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
