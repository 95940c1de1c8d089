//! Embedding-based retrieval.

use super::{matches_filters, Chunk, Filters, Metadata, RetrievalError, RetrievalResult, Retriever};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Turns texts into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed each text, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;
}

#[async_trait]
impl Embedder for llm::Client {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        llm::Client::embed(self, texts)
            .await
            .map_err(|e| RetrievalError::EmbeddingFailure(e.to_string()))
    }
}

/// A nearest-neighbour match from a [`VectorStore`].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub text: String,
    pub distance: f64,
    pub metadata: Metadata,
}

/// Named collections of chunk embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest neighbours of `query`, closest first.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<VectorHit>, RetrievalError>;

    async fn collection_exists(&self, collection: &str) -> bool;

    /// Number of items stored in a collection.
    async fn count(&self, collection: &str) -> Result<usize, RetrievalError>;
}

/// Distance function used by [`InMemoryVectorStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
}

impl DistanceMetric {
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = f64::from(*x) - f64::from(*y);
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Cosine => {
                let mut dot = 0.0;
                let mut norm_a = 0.0;
                let mut norm_b = 0.0;
                for (x, y) in a.iter().zip(b) {
                    let (x, y) = (f64::from(*x), f64::from(*y));
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredVector {
    chunk_id: String,
    text: String,
    embedding: Vec<f32>,
    metadata: Metadata,
}

/// Chunks per embedder request in [`InMemoryVectorStore::index_chunks`].
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// Process-local vector store.
pub struct InMemoryVectorStore {
    metric: DistanceMetric,
    batch_size: usize,
    collections: DashMap<String, Vec<StoredVector>>,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(DistanceMetric::default())
    }
}

impl InMemoryVectorStore {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
            collections: DashMap::new(),
        }
    }

    /// Limit how many chunks go to the embedder in one request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Create an empty collection. Existing collections are left untouched.
    pub fn create_collection(&self, name: impl Into<String>) {
        self.collections.entry(name.into()).or_default();
    }

    /// Insert or replace the embedding for a chunk.
    pub fn upsert(
        &self,
        collection: &str,
        chunk: &Chunk,
        embedding: Vec<f32>,
    ) -> Result<(), RetrievalError> {
        let mut items = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| RetrievalError::CollectionNotFound(collection.to_string()))?;

        if let Some(first) = items.first() {
            if first.embedding.len() != embedding.len() {
                return Err(RetrievalError::Configuration(format!(
                    "embedding dimension {} does not match collection dimension {}",
                    embedding.len(),
                    first.embedding.len()
                )));
            }
        }

        let stored = StoredVector {
            chunk_id: chunk.chunk_id.clone(),
            text: chunk.text.clone(),
            embedding,
            metadata: chunk.metadata(),
        };
        match items.iter_mut().find(|v| v.chunk_id == chunk.chunk_id) {
            Some(existing) => *existing = stored,
            None => items.push(stored),
        }
        Ok(())
    }

    /// Embed and insert chunks, creating the collection if needed.
    ///
    /// Chunks are embedded in batches of at most `batch_size` per request.
    pub async fn index_chunks(
        &self,
        collection: &str,
        chunks: &[Chunk],
        embedder: &dyn Embedder,
    ) -> Result<usize, RetrievalError> {
        self.create_collection(collection);
        for (n, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::EmbeddingFailure(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                self.upsert(collection, chunk, vector)?;
            }
            debug!(collection, batch = n, size = batch.len(), "embedded batch");
        }
        Ok(chunks.len())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<VectorHit>, RetrievalError> {
        let items = self
            .collections
            .get(collection)
            .ok_or_else(|| RetrievalError::CollectionNotFound(collection.to_string()))?;

        let mut hits: Vec<VectorHit> = items
            .iter()
            .filter(|item| matches_filters(&item.metadata, filters))
            .map(|item| VectorHit {
                chunk_id: item.chunk_id.clone(),
                text: item.text.clone(),
                distance: self.metric.distance(query, &item.embedding),
                metadata: item.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn collection_exists(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    async fn count(&self, collection: &str) -> Result<usize, RetrievalError> {
        self.collections
            .get(collection)
            .map(|items| items.len())
            .ok_or_else(|| RetrievalError::CollectionNotFound(collection.to_string()))
    }
}

/// Retriever that embeds the query and searches a vector collection.
#[derive(Clone)]
pub struct SemanticRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    collection: String,
}

impl SemanticRetriever {
    /// Bind to an existing collection. Fails if the collection is missing.
    pub async fn connect(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        collection: impl Into<String>,
    ) -> Result<Self, RetrievalError> {
        let collection = collection.into();
        if !store.collection_exists(&collection).await {
            return Err(RetrievalError::CollectionNotFound(collection));
        }
        Ok(Self {
            store,
            embedder,
            collection,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Number of vectors in the bound collection.
    pub async fn count(&self) -> Result<usize, RetrievalError> {
        self.store.count(&self.collection).await
    }
}

#[async_trait]
impl Retriever for SemanticRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        debug!(query = %query.chars().take(50).collect::<String>(), top_k, "vector retrieval");

        if !self.store.collection_exists(&self.collection).await {
            return Err(RetrievalError::CollectionNotFound(self.collection.clone()));
        }

        let vectors = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| match e {
                RetrievalError::EmbeddingFailure(_) => e,
                other => RetrievalError::EmbeddingFailure(other.to_string()),
            })?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::EmbeddingFailure("no query embedding returned".into()))?;

        let hits = self
            .store
            .search(&self.collection, &query_vector, top_k, filters)
            .await?;

        let mut results: Vec<RetrievalResult> = hits
            .into_iter()
            .map(|hit| {
                let mut result =
                    RetrievalResult::new(hit.chunk_id, hit.text, 1.0 / (1.0 + hit.distance));
                result.metadata = hit.metadata;
                result
                    .metadata
                    .insert("distance".into(), Value::from(hit.distance));
                result
                    .metadata
                    .insert("retriever".into(), Value::from("vector"));
                result
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);

        debug!(results = results.len(), "vector retrieval completed");
        Ok(results)
    }

    fn name(&self) -> &str {
        "vector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, HashEmbedder};
    use serde_json::json;

    async fn store_with_corpus() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new(DistanceMetric::Cosine));
        let chunks = vec![
            Chunk::new(0, "c0", "gandalf grey wizard").with_source("lotr"),
            Chunk::new(1, "c1", "shire hobbits garden").with_source("lotr"),
            Chunk::new(2, "c2", "earthsea wizard names").with_source("earthsea"),
        ];
        store
            .index_chunks("corpus", &chunks, &HashEmbedder::default())
            .await
            .unwrap();
        store
    }

    struct BatchRecorder {
        inner: HashEmbedder,
        batches: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Embedder for BatchRecorder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            self.batches.lock().unwrap().push(texts.len());
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn test_index_chunks_embeds_in_batches() {
        let chunks: Vec<Chunk> = (0..75)
            .map(|i| Chunk::new(i, format!("c{i}"), format!("passage number {i}")))
            .collect();
        let embedder = BatchRecorder {
            inner: HashEmbedder::default(),
            batches: std::sync::Mutex::new(Vec::new()),
        };
        let store = InMemoryVectorStore::new(DistanceMetric::Cosine);

        let indexed = store.index_chunks("corpus", &chunks, &embedder).await.unwrap();

        assert_eq!(indexed, 75);
        assert_eq!(*embedder.batches.lock().unwrap(), vec![32, 32, 11]);
        assert_eq!(store.count("corpus").await.unwrap(), 75);
    }

    #[tokio::test]
    async fn test_custom_batch_size() {
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| Chunk::new(i, format!("c{i}"), format!("passage {i}")))
            .collect();
        let embedder = BatchRecorder {
            inner: HashEmbedder::default(),
            batches: std::sync::Mutex::new(Vec::new()),
        };
        let store = InMemoryVectorStore::new(DistanceMetric::L2).with_batch_size(2);

        store.index_chunks("corpus", &chunks, &embedder).await.unwrap();

        assert_eq!(*embedder.batches.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn test_distance_metrics() {
        let l2 = DistanceMetric::L2.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((l2 - 5.0).abs() < 1e-9);

        let same = DistanceMetric::Cosine.distance(&[1.0, 2.0], &[2.0, 4.0]);
        assert!(same.abs() < 1e-9);

        let zero = DistanceMetric::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]);
        assert_eq!(zero, 1.0);
    }

    #[tokio::test]
    async fn test_connect_requires_collection() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::default());
        let result =
            SemanticRetriever::connect(store, Arc::new(HashEmbedder::default()), "missing").await;
        assert!(matches!(result, Err(RetrievalError::CollectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_exact_text_ranks_first() {
        let store = store_with_corpus().await;
        let retriever =
            SemanticRetriever::connect(store, Arc::new(HashEmbedder::default()), "corpus")
                .await
                .unwrap();

        let results = retriever.retrieve("shire hobbits garden", 3, None).await.unwrap();
        assert_eq!(results[0].chunk_id, "c1");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(results[0].metadata["retriever"], json!("vector"));
        assert_eq!(retriever.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_filters_reach_the_store() {
        let store = store_with_corpus().await;
        let retriever =
            SemanticRetriever::connect(store, Arc::new(HashEmbedder::default()), "corpus")
                .await
                .unwrap();

        let mut filters = Filters::new();
        filters.insert("source".into(), json!("earthsea"));
        let results = retriever.retrieve("wizard", 3, Some(&filters)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn test_embedding_failure_surfaces() {
        let store = store_with_corpus().await;
        let retriever = SemanticRetriever::connect(store, Arc::new(FailingEmbedder), "corpus")
            .await
            .unwrap();

        let err = retriever.retrieve("wizard", 3, None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::EmbeddingFailure(_)));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_checks_dimension() {
        let store = InMemoryVectorStore::new(DistanceMetric::L2);
        store.create_collection("c");
        let chunk = Chunk::new(0, "a", "text");
        store.upsert("c", &chunk, vec![1.0, 0.0]).unwrap();
        store.upsert("c", &chunk, vec![0.0, 1.0]).unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);

        let err = store.upsert("c", &Chunk::new(1, "b", "x"), vec![1.0]).unwrap_err();
        assert!(matches!(err, RetrievalError::Configuration(_)));
    }
}
