//! Retrieval orchestration: query rewriting, caching, and degradation.

use super::{QueryRewriter, RetrievalError, RetrievalResult, Retriever};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Per-call switches for [`RetrievalManager::retrieve`].
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Name of the calling agent; part of the cache key.
    pub agent_name: Option<String>,
    pub use_cache: bool,
    pub rewrite_query: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            agent_name: None,
            use_cache: true,
            rewrite_query: true,
        }
    }
}

impl RetrieveOptions {
    /// Options for a named agent with caching and rewriting on.
    pub fn for_agent(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            ..Self::default()
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn without_rewrite(mut self) -> Self {
        self.rewrite_query = false;
        self
    }
}

type CacheKey = (Option<String>, String, usize);

/// Front door to retrieval for the turn machine and the API layer.
///
/// Only `IndexNotLoaded` is returned as an error. Every other retriever or
/// fusion failure is logged and turned into an empty result list, which is
/// never cached.
pub struct RetrievalManager {
    retriever: Arc<dyn Retriever>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    cache: DashMap<CacheKey, Vec<RetrievalResult>>,
}

impl RetrievalManager {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            rewriter: None,
            cache: DashMap::new(),
        }
    }

    /// Install a query rewriter.
    pub fn with_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Retrieve at most `top_k` chunks for `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        options: RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let effective_query = if options.rewrite_query {
            self.rewrite_query(query).await
        } else {
            query.to_string()
        };

        let key: CacheKey = (options.agent_name.clone(), effective_query, top_k);

        if options.use_cache {
            if let Some(hit) = self.cache.get(&key) {
                info!(agent = ?options.agent_name, top_k, "retrieval cache hit");
                return Ok(hit.clone());
            }
        }

        debug!(
            agent = ?options.agent_name,
            query = %key.1.chars().take(100).collect::<String>(),
            top_k,
            retriever = self.retriever.name(),
            "retrieving"
        );

        match self.retriever.retrieve(&key.1, top_k, None).await {
            Ok(results) => {
                info!(agent = ?options.agent_name, count = results.len(), "retrieval completed");
                if options.use_cache {
                    self.cache.insert(key, results.clone());
                }
                Ok(results)
            }
            Err(RetrievalError::IndexNotLoaded) => Err(RetrievalError::IndexNotLoaded),
            Err(e) => {
                error!(agent = ?options.agent_name, error = %e, "retrieval failed, continuing without context");
                Ok(Vec::new())
            }
        }
    }

    /// Apply the configured rewriter, or return the query unchanged.
    pub async fn rewrite_query(&self, query: &str) -> String {
        match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(query).await,
            None => query.to_string(),
        }
    }

    /// Drop every cached result list.
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("retrieval cache cleared");
    }

    /// Number of cached (agent, query, top_k) entries.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
