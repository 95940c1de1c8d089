//! Merging of lexical and semantic rankings.
//!
//! Reciprocal Rank Fusion: score = Σ 1/(k + rank_i), ranks starting at 1.
//! Weighted fusion: bm25_weight * norm(lexical) + vector_weight * norm(semantic),
//! each list min-max normalized on its own.
//!
//! Exact ties keep first-appearance order, lexical list first. Nothing
//! downstream should rely on that.

use super::{min_max_normalize, RetrievalResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: u32 = 60;

/// How two ranked lists are combined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FusionStrategy {
    Rrf { k: u32 },
    Weighted { bm25_weight: f64, vector_weight: f64 },
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::Rrf { k: DEFAULT_RRF_K }
    }
}

impl FusionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FusionStrategy::Rrf { .. } => "rrf",
            FusionStrategy::Weighted { .. } => "weighted",
        }
    }
}

/// A chunk being accumulated across both lists.
struct Candidate {
    result: RetrievalResult,
    score: f64,
}

/// Accumulates scores while remembering first-appearance order.
#[derive(Default)]
struct Accumulator {
    order: Vec<Candidate>,
    positions: HashMap<String, usize>,
}

impl Accumulator {
    fn add(&mut self, result: &RetrievalResult, contribution: f64, annotation: (&str, Value)) {
        let position = match self.positions.get(&result.chunk_id) {
            Some(&position) => position,
            None => {
                let mut base = RetrievalResult::new(&result.chunk_id, &result.chunk_text, 0.0);
                base.metadata = result.metadata.clone();
                self.order.push(Candidate {
                    result: base,
                    score: 0.0,
                });
                self.positions
                    .insert(result.chunk_id.clone(), self.order.len() - 1);
                self.order.len() - 1
            }
        };

        let candidate = &mut self.order[position];
        candidate.score += contribution;
        for (key, value) in &result.metadata {
            candidate
                .result
                .metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        candidate
            .result
            .metadata
            .insert(annotation.0.to_string(), annotation.1);
    }

    fn finish(self, strategy: &FusionStrategy, top_k: usize) -> Vec<RetrievalResult> {
        let mut candidates = self.order;
        // `sort_by` is stable, so exact ties keep insertion order.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        candidates
            .into_iter()
            .take(top_k)
            .map(|candidate| {
                let mut result = candidate.result;
                result.score = candidate.score;
                result
                    .metadata
                    .insert("fusion".into(), Value::from(strategy.name()));
                result
            })
            .collect()
    }
}

/// Fuse two ranked lists into at most `top_k` results, best first.
pub fn fuse(
    lexical: &[RetrievalResult],
    semantic: &[RetrievalResult],
    strategy: &FusionStrategy,
    top_k: usize,
) -> Vec<RetrievalResult> {
    let mut accumulator = Accumulator::default();

    match *strategy {
        FusionStrategy::Rrf { k } => {
            let k = f64::from(k);
            for (rank, result) in (1usize..).zip(lexical) {
                accumulator.add(
                    result,
                    1.0 / (k + rank as f64),
                    ("bm25_rank", Value::from(rank)),
                );
            }
            for (rank, result) in (1usize..).zip(semantic) {
                accumulator.add(
                    result,
                    1.0 / (k + rank as f64),
                    ("vector_rank", Value::from(rank)),
                );
            }
        }
        FusionStrategy::Weighted {
            bm25_weight,
            vector_weight,
        } => {
            let lexical_norm = normalized(lexical);
            let semantic_norm = normalized(semantic);
            for (result, norm) in lexical.iter().zip(lexical_norm) {
                accumulator.add(result, bm25_weight * norm, ("bm25_score", Value::from(norm)));
            }
            for (result, norm) in semantic.iter().zip(semantic_norm) {
                accumulator.add(
                    result,
                    vector_weight * norm,
                    ("vector_score", Value::from(norm)),
                );
            }
        }
    }

    accumulator.finish(strategy, top_k)
}

fn normalized(results: &[RetrievalResult]) -> Vec<f64> {
    let mut scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    min_max_normalize(&mut scores);
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list(items: &[(&str, f64)]) -> Vec<RetrievalResult> {
        items
            .iter()
            .map(|(id, score)| RetrievalResult::new(*id, format!("text of {id}"), *score))
            .collect()
    }

    #[test]
    fn test_rrf_sums_contributions() {
        let lexical = list(&[("a", 9.0), ("b", 5.0)]);
        let semantic = list(&[("b", 0.9), ("c", 0.8)]);
        let fused = fuse(&lexical, &semantic, &FusionStrategy::Rrf { k: 60 }, 10);

        let b = fused.iter().find(|r| r.chunk_id == "b").unwrap();
        assert!((b.score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert_eq!(fused[0].chunk_id, "b");
        assert_eq!(b.metadata["bm25_rank"], json!(2));
        assert_eq!(b.metadata["vector_rank"], json!(1));
        assert_eq!(b.metadata["fusion"], json!("rrf"));
    }

    #[test]
    fn test_rrf_single_list_still_scores() {
        let fused = fuse(&list(&[("a", 1.0)]), &[], &FusionStrategy::default(), 5);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_ties_keep_lexical_first() {
        let fused = fuse(
            &list(&[("a", 1.0)]),
            &list(&[("b", 1.0)]),
            &FusionStrategy::default(),
            5,
        );
        assert_eq!(fused[0].score, fused[1].score);
        assert_eq!(fused[0].chunk_id, "a");
        assert_eq!(fused[1].chunk_id, "b");
    }

    #[test]
    fn test_weighted_normalizes_each_list() {
        let lexical = list(&[("a", 10.0), ("b", 0.0)]);
        let semantic = list(&[("b", 0.5), ("c", 0.25)]);
        let strategy = FusionStrategy::Weighted {
            bm25_weight: 0.7,
            vector_weight: 0.3,
        };
        let fused = fuse(&lexical, &semantic, &strategy, 10);

        let score = |id: &str| fused.iter().find(|r| r.chunk_id == id).unwrap().score;
        assert!((score("a") - 0.7).abs() < 1e-12);
        assert!((score("b") - 0.3).abs() < 1e-12);
        assert_eq!(score("c"), 0.0);
        assert_eq!(fused[0].chunk_id, "a");
    }

    #[test]
    fn test_truncates_to_top_k() {
        let lexical = list(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
        let semantic = list(&[("d", 0.9), ("e", 0.8)]);
        assert_eq!(fuse(&lexical, &semantic, &FusionStrategy::default(), 2).len(), 2);
        assert!(fuse(&lexical, &semantic, &FusionStrategy::default(), 0).is_empty());
    }

    #[test]
    fn test_metadata_prefers_lexical_values() {
        let lexical = vec![RetrievalResult::new("a", "t", 1.0).with_metadata("retriever", "bm25")];
        let semantic = vec![RetrievalResult::new("a", "t", 1.0)
            .with_metadata("retriever", "vector")
            .with_metadata("distance", 0.1)];
        let fused = fuse(&lexical, &semantic, &FusionStrategy::default(), 1);
        assert_eq!(fused[0].metadata["retriever"], json!("bm25"));
        assert_eq!(fused[0].metadata["distance"], json!(0.1));
    }
}
