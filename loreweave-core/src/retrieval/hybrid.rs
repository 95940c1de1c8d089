//! Lexical + semantic retrieval fused into one ranking.

use super::{fuse, Filters, FusionStrategy, RetrievalError, RetrievalResult, Retriever};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Each leaf is asked for this many times `top_k` before fusion.
const OVERFETCH_FACTOR: usize = 2;

/// Runs both leaf retrievers and fuses their rankings.
#[derive(Clone)]
pub struct HybridRetriever {
    lexical: Arc<dyn Retriever>,
    semantic: Arc<dyn Retriever>,
    strategy: FusionStrategy,
}

impl HybridRetriever {
    pub fn new(
        lexical: Arc<dyn Retriever>,
        semantic: Arc<dyn Retriever>,
        strategy: FusionStrategy,
    ) -> Self {
        Self {
            lexical,
            semantic,
            strategy,
        }
    }

    pub fn strategy(&self) -> &FusionStrategy {
        &self.strategy
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let fetch = top_k.saturating_mul(OVERFETCH_FACTOR);

        let (lexical, semantic) = futures::future::try_join(
            self.lexical.retrieve(query, fetch, filters),
            self.semantic.retrieve(query, fetch, filters),
        )
        .await?;

        debug!(
            lexical = lexical.len(),
            semantic = semantic.len(),
            strategy = self.strategy.name(),
            "fusing hybrid results"
        );

        Ok(fuse(&lexical, &semantic, &self.strategy, top_k))
    }

    fn name(&self) -> &str {
        "hybrid"
    }
}
