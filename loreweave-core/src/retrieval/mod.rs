//! Hybrid retrieval over a fixed text corpus.
//!
//! Two leaf retrievers rank chunks independently:
//! - [`LexicalRetriever`] scores by BM25 token overlap
//! - [`SemanticRetriever`] scores by embedding distance
//!
//! [`HybridRetriever`] runs both and merges them with a [`FusionStrategy`].
//! [`RetrievalManager`] sits on top and adds query rewriting, caching, and
//! graceful degradation for the turn machine.

pub mod fusion;
pub mod hybrid;
pub mod lexical;
pub mod manager;
pub mod rewrite;
pub mod semantic;

pub use fusion::{fuse, FusionStrategy};
pub use hybrid::HybridRetriever;
pub use lexical::{Bm25Index, LexicalRetriever};
pub use manager::{RetrievalManager, RetrieveOptions};
pub use rewrite::{LlmRewriter, QueryRewriter, SynonymRewriter};
pub use semantic::{DistanceMetric, Embedder, InMemoryVectorStore, SemanticRetriever, VectorStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Open metadata map attached to chunks and results.
pub type Metadata = Map<String, Value>;

/// Key/value constraints a result's metadata must satisfy.
pub type Filters = Map<String, Value>;

/// Errors from retrieval operations.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Index not loaded")]
    IndexNotLoaded,

    #[error("Embedding failed: {0}")]
    EmbeddingFailure(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A span of corpus text with a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub start_pos: usize,
    #[serde(default)]
    pub end_pos: usize,
    pub chunk_index: usize,
    #[serde(default)]
    pub additional_metadata: Metadata,
}

impl Chunk {
    /// Create a chunk with positions derived from the text length.
    pub fn new(chunk_index: usize, chunk_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            chunk_id: chunk_id.into(),
            end_pos: text.len(),
            text,
            source: String::new(),
            start_pos: 0,
            chunk_index,
            additional_metadata: Metadata::new(),
        }
    }

    /// Set the source document name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attach an extra metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_metadata.insert(key.into(), value.into());
        self
    }

    /// Flattened metadata used for filtering and result annotation.
    pub fn metadata(&self) -> Metadata {
        let mut map = self.additional_metadata.clone();
        map.insert("source".into(), Value::from(self.source.clone()));
        map.insert("chunk_index".into(), Value::from(self.chunk_index));
        map.insert("start_pos".into(), Value::from(self.start_pos));
        map.insert("end_pos".into(), Value::from(self.end_pos));
        map
    }
}

/// One ranked chunk returned from a retrieval call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub chunk_text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RetrievalResult {
    pub fn new(chunk_id: impl Into<String>, chunk_text: impl Into<String>, score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            chunk_text: chunk_text.into(),
            score,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A ranked retriever over the corpus.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `top_k` results sorted by descending score.
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError>;

    /// Short name used in logs and result metadata.
    fn name(&self) -> &str;
}

/// Whether `metadata` satisfies every constraint in `filters`.
pub(crate) fn matches_filters(metadata: &Metadata, filters: Option<&Filters>) -> bool {
    match filters {
        None => true,
        Some(filters) => filters
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected)),
    }
}

/// Lowercase and split on whitespace. Index building and querying share this.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// Min-max normalize scores in place. A flat range is treated as 1.0.
pub(crate) fn min_max_normalize(scores: &mut [f64]) {
    if scores.is_empty() {
        return;
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = if max > min { max - min } else { 1.0 };
    for score in scores.iter_mut() {
        *score = (*score - min) / range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("  The Grey  Wizard\n"), vec!["the", "grey", "wizard"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_min_max_flat_range_maps_to_zero() {
        let mut scores = vec![2.0, 2.0, 2.0];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_min_max_spans_unit_interval() {
        let mut scores = vec![1.0, 3.0, 2.0];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_filters_require_every_key() {
        let chunk = Chunk::new(0, "c0", "text")
            .with_source("lotr")
            .with_metadata("book", 1);
        let metadata = chunk.metadata();

        let mut filters = Filters::new();
        filters.insert("source".into(), json!("lotr"));
        assert!(matches_filters(&metadata, Some(&filters)));

        filters.insert("book".into(), json!(2));
        assert!(!matches_filters(&metadata, Some(&filters)));
        assert!(matches_filters(&metadata, None));
    }
}
