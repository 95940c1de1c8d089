//! BM25 lexical retrieval.
//!
//! The index artifact and the chunk metadata artifact are produced by the
//! ingestion pipeline and must be loaded together. Document `i` of the index is
//! the chunk whose `chunk_index` is `i`; the semantic collection relies on the
//! same ordering, so any disagreement is rejected at load time.

use super::{
    matches_filters, min_max_normalize, tokenize, Chunk, Filters, RetrievalError,
    RetrievalResult, Retriever,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

const DEFAULT_K1: f64 = 1.5;
const DEFAULT_B: f64 = 0.75;
const DEFAULT_EPSILON: f64 = 0.25;

/// Okapi BM25 statistics over a tokenized corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    pub k1: f64,
    pub b: f64,
    pub epsilon: f64,
    /// Chunk id of each document, in `chunk_index` order.
    pub chunk_ids: Vec<String>,
    doc_len: Vec<usize>,
    doc_freqs: Vec<HashMap<String, usize>>,
    idf: HashMap<String, f64>,
    avgdl: f64,
}

impl Bm25Index {
    /// Build an index over chunks sorted by `chunk_index`.
    pub fn build(chunks: &[Chunk]) -> Self {
        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.chunk_index);

        let mut doc_len = Vec::with_capacity(ordered.len());
        let mut doc_freqs = Vec::with_capacity(ordered.len());
        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for chunk in &ordered {
            let tokens = tokenize(&chunk.text);
            total_len += tokens.len();
            doc_len.push(tokens.len());

            let mut frequencies: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *frequencies.entry(token).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
            doc_freqs.push(frequencies);
        }

        let corpus_size = ordered.len();
        let avgdl = if corpus_size == 0 {
            0.0
        } else {
            total_len as f64 / corpus_size as f64
        };

        let idf = compute_idf(&document_frequency, corpus_size, DEFAULT_EPSILON);

        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
            epsilon: DEFAULT_EPSILON,
            chunk_ids: ordered.iter().map(|c| c.chunk_id.clone()).collect(),
            doc_len,
            doc_freqs,
            idf,
            avgdl,
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_len.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_len.is_empty()
    }

    /// BM25 score of every document for the tokenized query, in index order.
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }

        for token in query_tokens {
            let idf = self.idf.get(token).copied().unwrap_or(0.0);
            if idf == 0.0 {
                continue;
            }
            for (doc, score) in scores.iter_mut().enumerate() {
                let tf = self.doc_freqs[doc].get(token).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = 1.0 - self.b + self.b * self.doc_len[doc] as f64 / self.avgdl;
                *score += idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * norm);
            }
        }
        scores
    }

    fn token_count(&self, doc: usize) -> usize {
        self.doc_len[doc]
    }
}

/// Inverse document frequency with negative values floored at
/// `epsilon * average_idf`.
fn compute_idf(
    document_frequency: &HashMap<String, usize>,
    corpus_size: usize,
    epsilon: f64,
) -> HashMap<String, f64> {
    let n = corpus_size as f64;
    let mut idf = HashMap::with_capacity(document_frequency.len());
    let mut idf_sum = 0.0;
    let mut negative = Vec::new();

    for (term, &freq) in document_frequency {
        let freq = freq as f64;
        let value = (n - freq + 0.5).ln() - (freq + 0.5).ln();
        idf_sum += value;
        if value < 0.0 {
            negative.push(term.clone());
        }
        idf.insert(term.clone(), value);
    }

    if !idf.is_empty() {
        let floor = epsilon * (idf_sum / idf.len() as f64);
        for term in negative {
            idf.insert(term, floor);
        }
    }
    idf
}

struct LoadedCorpus {
    index: Bm25Index,
    /// Chunks in `chunk_index` order, aligned with the index documents.
    chunks: Vec<Chunk>,
}

/// Lexical retriever backed by a [`Bm25Index`].
#[derive(Default)]
pub struct LexicalRetriever {
    corpus: Option<LoadedCorpus>,
}

impl LexicalRetriever {
    /// Create a retriever with no index. Queries fail with `IndexNotLoaded`.
    pub fn new() -> Self {
        Self { corpus: None }
    }

    /// Build an in-memory index over the given chunks.
    pub fn from_chunks(mut chunks: Vec<Chunk>) -> Self {
        chunks.sort_by_key(|c| c.chunk_index);
        let index = Bm25Index::build(&chunks);
        Self {
            corpus: Some(LoadedCorpus { index, chunks }),
        }
    }

    /// Load the index artifact and the chunk metadata artifact together.
    ///
    /// Both files must exist and agree on document count and on the
    /// `chunk_index -> chunk_id` ordering.
    pub async fn load(
        index_path: impl AsRef<Path>,
        metadata_path: impl AsRef<Path>,
    ) -> Result<Self, RetrievalError> {
        let index_path = index_path.as_ref();
        let metadata_path = metadata_path.as_ref();
        info!(index = %index_path.display(), metadata = %metadata_path.display(), "loading lexical index");

        let index_json = tokio::fs::read_to_string(index_path).await.map_err(|e| {
            RetrievalError::Configuration(format!(
                "BM25 index file not readable: {}: {e}",
                index_path.display()
            ))
        })?;
        let metadata_json = tokio::fs::read_to_string(metadata_path).await.map_err(|e| {
            RetrievalError::Configuration(format!(
                "Chunk metadata file not readable: {}: {e}",
                metadata_path.display()
            ))
        })?;

        let index: Bm25Index = serde_json::from_str(&index_json)?;
        let metadata: BTreeMap<String, Chunk> = serde_json::from_str(&metadata_json)?;

        let chunks = align_chunks(&index, metadata)?;
        info!(chunks = chunks.len(), "lexical index loaded");

        Ok(Self {
            corpus: Some(LoadedCorpus { index, chunks }),
        })
    }

    /// Whether an index is available for queries.
    pub fn is_loaded(&self) -> bool {
        self.corpus.is_some()
    }

    /// Number of indexed chunks (zero when not loaded).
    pub fn chunk_count(&self) -> usize {
        self.corpus.as_ref().map_or(0, |c| c.chunks.len())
    }

    /// Indexed chunks in corpus order.
    pub fn chunks(&self) -> &[Chunk] {
        self.corpus.as_ref().map_or(&[], |c| c.chunks.as_slice())
    }

    /// Look up a chunk by id.
    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.corpus
            .as_ref()
            .and_then(|c| c.chunks.iter().find(|chunk| chunk.chunk_id == chunk_id))
    }

    /// Rank chunks for `query`, normalizing over the filtered set.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let corpus = self.corpus.as_ref().ok_or(RetrievalError::IndexNotLoaded)?;
        debug!(query = %truncate(query, 50), top_k, "bm25 retrieval");

        if corpus.chunks.is_empty() {
            warn!("no chunks available for bm25 retrieval");
            return Ok(Vec::new());
        }

        let tokens = tokenize(query);
        let scores = corpus.index.scores(&tokens);

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let considered: Vec<(usize, f64)> = ranked
            .into_iter()
            .filter(|(doc, _)| matches_filters(&corpus.chunks[*doc].metadata(), filters))
            .collect();

        let mut normalized: Vec<f64> = considered.iter().map(|(_, s)| *s).collect();
        min_max_normalize(&mut normalized);

        let results = considered
            .iter()
            .zip(normalized)
            .take(top_k)
            .map(|(&(doc, raw), score)| {
                let chunk = &corpus.chunks[doc];
                let mut result = RetrievalResult::new(&chunk.chunk_id, &chunk.text, score);
                result.metadata = chunk.metadata();
                result
                    .metadata
                    .insert("raw_score".into(), Value::from(raw));
                result
                    .metadata
                    .insert("retriever".into(), Value::from("bm25"));
                result
            })
            .collect();

        Ok(results)
    }
}

#[async_trait]
impl Retriever for LexicalRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        self.search(query, top_k, filters)
    }

    fn name(&self) -> &str {
        "bm25"
    }
}

/// Order metadata by `chunk_index` and check it against the index.
fn align_chunks(
    index: &Bm25Index,
    metadata: BTreeMap<String, Chunk>,
) -> Result<Vec<Chunk>, RetrievalError> {
    if metadata.len() != index.len() || index.chunk_ids.len() != index.len() {
        return Err(RetrievalError::Configuration(format!(
            "index has {} documents but metadata has {} chunks",
            index.len(),
            metadata.len()
        )));
    }

    let mut chunks: Vec<Chunk> = Vec::with_capacity(metadata.len());
    for (key, chunk) in metadata {
        if key != chunk.chunk_id {
            return Err(RetrievalError::Configuration(format!(
                "metadata key {key} does not match chunk id {}",
                chunk.chunk_id
            )));
        }
        chunks.push(chunk);
    }
    chunks.sort_by_key(|c| c.chunk_index);

    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_index != position {
            return Err(RetrievalError::Configuration(format!(
                "chunk_index values are not contiguous: expected {position}, found {}",
                chunk.chunk_index
            )));
        }
        if index.chunk_ids[position] != chunk.chunk_id {
            return Err(RetrievalError::Configuration(format!(
                "index document {position} is {} but metadata maps it to {}",
                index.chunk_ids[position], chunk.chunk_id
            )));
        }
        if index.token_count(position) != tokenize(&chunk.text).len() {
            return Err(RetrievalError::Configuration(format!(
                "chunk {} text does not match the indexed document",
                chunk.chunk_id
            )));
        }
    }

    Ok(chunks)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new(0, "c0", "Gandalf the grey wizard walks to Rivendell").with_source("lotr"),
            Chunk::new(1, "c1", "The Shire is green and the hobbits are merry").with_source("lotr"),
            Chunk::new(2, "c2", "A wizard of Earthsea studies true names").with_source("earthsea"),
            Chunk::new(3, "c3", "Rivendell lies in a hidden valley").with_source("lotr"),
        ]
    }

    #[test]
    fn test_unloaded_index_fails() {
        let retriever = LexicalRetriever::new();
        assert!(!retriever.is_loaded());
        let err = retriever.search("wizard", 5, None).unwrap_err();
        assert!(matches!(err, RetrievalError::IndexNotLoaded));
    }

    #[test]
    fn test_empty_corpus_returns_empty() {
        let retriever = LexicalRetriever::from_chunks(Vec::new());
        assert!(retriever.is_loaded());
        assert!(retriever.search("anything", 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_ranks_matching_chunks_first() {
        let retriever = LexicalRetriever::from_chunks(corpus());
        let results = retriever.search("Gandalf wizard", 4, None).unwrap();

        assert_eq!(results[0].chunk_id, "c0");
        assert_eq!(results[0].score, 1.0);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(results[0].metadata["retriever"], json!("bm25"));
    }

    #[test]
    fn test_top_k_bound() {
        let retriever = LexicalRetriever::from_chunks(corpus());
        assert_eq!(retriever.search("the", 2, None).unwrap().len(), 2);
    }

    #[test]
    fn test_filters_apply_before_truncation() {
        let retriever = LexicalRetriever::from_chunks(corpus());
        let mut filters = Filters::new();
        filters.insert("source".into(), json!("earthsea"));

        let results = retriever.search("wizard", 3, Some(&filters)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
        // A single considered chunk has a flat range.
        assert_eq!(results[0].score, 0.0);
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        let retriever = LexicalRetriever::from_chunks(corpus());
        let results = retriever.search("spaceship", 4, None).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[test]
    fn test_negative_idf_is_floored() {
        let chunks = vec![
            Chunk::new(0, "a", "common alpha"),
            Chunk::new(1, "b", "common beta"),
            Chunk::new(2, "c", "common gamma"),
            Chunk::new(3, "d", "common delta"),
        ];
        let index = Bm25Index::build(&chunks);
        let scores = index.scores(&tokenize("common"));
        assert!(scores.iter().all(|s| *s > 0.0));
    }

    #[tokio::test]
    async fn test_load_round_trip_from_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("bm25.json");
        let metadata_path = dir.path().join("chunks.json");

        let chunks = corpus();
        let index = Bm25Index::build(&chunks);
        let metadata: BTreeMap<String, Chunk> = chunks
            .iter()
            .map(|c| (c.chunk_id.clone(), c.clone()))
            .collect();
        std::fs::write(&index_path, serde_json::to_string(&index).unwrap()).unwrap();
        std::fs::write(&metadata_path, serde_json::to_string(&metadata).unwrap()).unwrap();

        let retriever = LexicalRetriever::load(&index_path, &metadata_path).await.unwrap();
        assert_eq!(retriever.chunk_count(), 4);
        assert_eq!(retriever.search("hobbits", 1, None).unwrap()[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn test_load_rejects_mismatched_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("bm25.json");
        let metadata_path = dir.path().join("chunks.json");

        let index = Bm25Index::build(&corpus());
        let mut swapped = corpus();
        swapped[0].chunk_index = 1;
        swapped[1].chunk_index = 0;
        let metadata: BTreeMap<String, Chunk> = swapped
            .into_iter()
            .map(|c| (c.chunk_id.clone(), c))
            .collect();
        std::fs::write(&index_path, serde_json::to_string(&index).unwrap()).unwrap();
        std::fs::write(&metadata_path, serde_json::to_string(&metadata).unwrap()).unwrap();

        let err = LexicalRetriever::load(&index_path, &metadata_path)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RetrievalError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_load_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("bm25.json");
        std::fs::write(
            &index_path,
            serde_json::to_string(&Bm25Index::build(&corpus())).unwrap(),
        )
        .unwrap();

        let result = LexicalRetriever::load(&index_path, dir.path().join("missing.json")).await;
        assert!(matches!(result, Err(RetrievalError::Configuration(_))));
    }
}
