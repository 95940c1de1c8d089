//! Engine configuration.
//!
//! Every section has serde defaults, so a partial JSON document is enough.
//! Programmatic callers use `Default` plus the `with_*` builders.

use crate::retrieval::{DistanceMetric, FusionStrategy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which fusion algorithm the hybrid retriever uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionKind {
    #[default]
    Rrf,
    Weighted,
}

/// Retrieval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub bm25_weight: f64,
    pub vector_weight: f64,
    pub top_k: usize,
    pub fusion_strategy: FusionKind,
    pub rrf_k: u32,
    pub use_query_rewriting: bool,
    pub collection_name: String,
    pub distance: DistanceMetric,
    /// Chunks sent to the embedder per request when indexing the corpus.
    pub embedding_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            bm25_weight: 0.5,
            vector_weight: 0.5,
            top_k: 10,
            fusion_strategy: FusionKind::Rrf,
            rrf_k: 60,
            use_query_rewriting: false,
            collection_name: "corpus".to_string(),
            distance: DistanceMetric::Cosine,
            embedding_batch_size: 32,
        }
    }
}

impl RetrievalConfig {
    /// The fusion strategy these settings describe.
    pub fn fusion(&self) -> FusionStrategy {
        match self.fusion_strategy {
            FusionKind::Rrf => FusionStrategy::Rrf { k: self.rrf_k },
            FusionKind::Weighted => FusionStrategy::Weighted {
                bm25_weight: self.bm25_weight,
                vector_weight: self.vector_weight,
            },
        }
    }

    /// Use weighted fusion with the given weights.
    pub fn with_weights(mut self, bm25_weight: f64, vector_weight: f64) -> Self {
        self.fusion_strategy = FusionKind::Weighted;
        self.bm25_weight = bm25_weight;
        self.vector_weight = vector_weight;
        self
    }

    /// Use RRF with the given smoothing constant.
    pub fn with_rrf_k(mut self, k: u32) -> Self {
        self.fusion_strategy = FusionKind::Rrf;
        self.rrf_k = k;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_query_rewriting(mut self, enabled: bool) -> Self {
        self.use_query_rewriting = enabled;
        self
    }

    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    pub fn with_embedding_batch_size(mut self, size: usize) -> Self {
        self.embedding_batch_size = size;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("retrieval.top_k must be positive".into()));
        }
        if self.rrf_k == 0 {
            return Err(ConfigError::Invalid("retrieval.rrf_k must be positive".into()));
        }
        if self.bm25_weight < 0.0 || self.vector_weight < 0.0 {
            return Err(ConfigError::Invalid(
                "retrieval weights must not be negative".into(),
            ));
        }
        if self.fusion_strategy == FusionKind::Weighted
            && self.bm25_weight == 0.0
            && self.vector_weight == 0.0
        {
            return Err(ConfigError::Invalid(
                "weighted fusion needs at least one non-zero weight".into(),
            ));
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "retrieval.collection_name must not be empty".into(),
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.embedding_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Longest idle time a session may be configured for (100 years).
pub const MAX_SESSION_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Session memory and lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of turns kept in memory.
    pub memory_window_size: usize,
    /// Token budget for memory.
    pub max_tokens: usize,
    /// When false, memory is not maintained at all.
    pub sliding_window: bool,
    pub session_ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory_window_size: 10,
            max_tokens: 8000,
            sliding_window: true,
            session_ttl_seconds: 3600,
        }
    }
}

impl SessionConfig {
    pub fn with_window_size(mut self, turns: usize) -> Self {
        self.memory_window_size = turns;
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_sliding_window(mut self, enabled: bool) -> Self {
        self.sliding_window = enabled;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    /// The TTL as a chrono duration. Saturates instead of overflowing.
    pub fn ttl_delta(&self) -> ChronoDuration {
        i64::try_from(self.session_ttl_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX)
    }

    /// Whether a session last used at `last_accessed` has expired by `now`.
    pub fn is_expired(&self, last_accessed: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_accessed) > self.ttl_delta()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_window_size == 0 {
            return Err(ConfigError::Invalid(
                "session.memory_window_size must be positive".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("session.max_tokens must be positive".into()));
        }
        if self.session_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "session.session_ttl_seconds must be positive".into(),
            ));
        }
        if self.session_ttl_seconds > MAX_SESSION_TTL_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "session.session_ttl_seconds must be at most {MAX_SESSION_TTL_SECONDS}"
            )));
        }
        Ok(())
    }
}

/// Paths of the prebuilt lexical artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub bm25_index_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bm25_index_path: PathBuf::from("data/indices/bm25_index.json"),
            metadata_path: PathBuf::from("data/indices/chunks.json"),
        }
    }
}

/// How strictly the validator judges player commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Reject anything the passages do not support.
    Strict,
    /// Reject only clear contradictions.
    #[default]
    Lenient,
}

/// Generation settings for one collaborator role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub enabled: bool,
    pub temperature: f32,
    pub max_tokens: usize,
    pub retrieval_top_k: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            temperature: 0.7,
            max_tokens: 1000,
            retrieval_top_k: 5,
        }
    }
}

impl AgentSettings {
    fn deterministic() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Settings for every collaborator role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub validator: AgentSettings,
    pub planner: AgentSettings,
    pub narrator: AgentSettings,
    pub dialogue: AgentSettings,
    pub persona_extractor: AgentSettings,
    pub validation_mode: ValidationMode,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            validator: AgentSettings::deterministic(),
            planner: AgentSettings::deterministic(),
            narrator: AgentSettings::default(),
            dialogue: AgentSettings::default(),
            persona_extractor: AgentSettings::deterministic(),
            validation_mode: ValidationMode::Lenient,
        }
    }
}

impl AgentsConfig {
    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub session: SessionConfig,
    pub index: IndexConfig,
    pub agents: AgentsConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    pub fn with_agents(mut self, agents: AgentsConfig) -> Self {
        self.agents = agents;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retrieval.validate()?;
        self.session.validate()?;
        Ok(())
    }
}
