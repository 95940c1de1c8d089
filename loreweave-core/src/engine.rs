//! The engine facade: retrieval, sessions and the turn machine behind one
//! handle.
//!
//! # Example
//!
//! ```ignore
//! use loreweave_core::{EngineConfig, NarrativeEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_file("loreweave.json").await?;
//!     let engine = NarrativeEngine::from_env(config).await?;
//!
//!     let session_id = engine.create_session(None);
//!     let result = engine.execute_turn(&session_id, "I knock on Bilbo's door", None).await?;
//!     println!("{}", result.display_text().unwrap_or_default());
//!     Ok(())
//! }
//! ```

use crate::agents::{
    Collaborators, LlmDialogueAgent, LlmNarrator, LlmPersonaExtractor, LlmPlanner, LlmValidator,
};
use crate::config::{AgentSettings, ConfigError, EngineConfig};
use crate::game::{
    GameLoop, InMemoryMetrics, MetricsCollector, MetricsSnapshot, ProgressObserver, TurnProgress,
    TurnResult,
};
use crate::generation::{TextGenerator, TunedGenerator};
use crate::retrieval::{
    Embedder, HybridRetriever, InMemoryVectorStore, LexicalRetriever, LlmRewriter, QueryRewriter,
    RetrievalError, RetrievalManager, RetrievalResult, RetrieveOptions, Retriever,
    SemanticRetriever, SynonymRewriter, VectorStore,
};
use crate::session::SessionSummary;
use crate::session_manager::{SessionError, SessionHandle, SessionManager};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from building the engine or from turn entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("LLM error: {0}")]
    Llm(#[from] llm::Error),
}

/// Assembles a [`NarrativeEngine`] from parts.
///
/// A retriever and the collaborators are required. Metrics default to
/// [`InMemoryMetrics`]. With `use_query_rewriting` on and no rewriter given,
/// the built-in [`SynonymRewriter`] is used.
pub struct EngineBuilder {
    config: EngineConfig,
    retriever: Option<Arc<dyn Retriever>>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    collaborators: Option<Collaborators>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            retriever: None,
            rewriter: None,
            collaborators: None,
            metrics: None,
            observer: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn QueryRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<NarrativeEngine, EngineError> {
        self.config.validate()?;

        let retriever = self
            .retriever
            .ok_or_else(|| ConfigError::Invalid("a retriever is required".to_string()))?;
        let collaborators = self
            .collaborators
            .ok_or_else(|| ConfigError::Invalid("collaborators are required".to_string()))?;

        let mut manager = RetrievalManager::new(retriever);
        if self.config.retrieval.use_query_rewriting {
            let rewriter = self
                .rewriter
                .unwrap_or_else(|| Arc::new(SynonymRewriter::new()));
            manager = manager.with_rewriter(rewriter);
        } else if self.rewriter.is_some() {
            warn!("query rewriter supplied but use_query_rewriting is off, ignoring it");
        }
        let retrieval = Arc::new(manager);

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(InMemoryMetrics::new()));

        let mut game_loop = GameLoop::new(retrieval.clone(), collaborators, metrics.clone())
            .with_retrieval_top_k(self.config.retrieval.top_k)
            .with_persona_top_k(self.config.agents.persona_extractor.retrieval_top_k);
        if let Some(observer) = self.observer {
            game_loop = game_loop.with_observer(observer);
        }

        info!(
            fusion = self.config.retrieval.fusion().name(),
            top_k = self.config.retrieval.top_k,
            rewriting = self.config.retrieval.use_query_rewriting,
            "narrative engine ready"
        );

        Ok(NarrativeEngine {
            sessions: SessionManager::new(self.config.session.clone()),
            config: self.config,
            retrieval,
            game_loop,
            metrics,
        })
    }
}

/// Public entry point for retrieval, session lifecycle and turns.
pub struct NarrativeEngine {
    config: EngineConfig,
    retrieval: Arc<RetrievalManager>,
    sessions: SessionManager,
    game_loop: GameLoop,
    metrics: Arc<dyn MetricsCollector>,
}

impl NarrativeEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build an engine with LLM clients from the environment.
    ///
    /// Chat goes through [`llm::Client::from_env`] and corpus embedding through
    /// [`llm::Client::embeddings_from_env`], so a chat provider without an
    /// embeddings API can be paired with one that has it.
    pub async fn from_env(config: EngineConfig) -> Result<Self, EngineError> {
        let client = llm::Client::from_env()?;
        let embeddings = llm::Client::embeddings_from_env()?;
        if !embeddings.supports_embeddings() {
            return Err(ConfigError::Invalid(format!(
                "embedding provider {} has no embeddings API",
                embeddings.provider()
            ))
            .into());
        }
        Self::from_llm(config, client, Arc::new(embeddings)).await
    }

    /// Build the full LLM-backed engine.
    ///
    /// Loads the lexical artifacts named in the index config, embeds the same
    /// chunks into an in-memory vector collection with `embedder`, and wires
    /// the LLM-backed collaborators on `client` with their per-role settings.
    pub async fn from_llm(
        config: EngineConfig,
        client: llm::Client,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let client = Arc::new(client);

        let lexical = LexicalRetriever::load(
            &config.index.bm25_index_path,
            &config.index.metadata_path,
        )
        .await?;

        let collection = config.retrieval.collection_name.as_str();
        let store = InMemoryVectorStore::new(config.retrieval.distance)
            .with_batch_size(config.retrieval.embedding_batch_size);
        if lexical.chunks().is_empty() {
            warn!("lexical index is empty, semantic collection left empty");
            store.create_collection(collection);
        } else {
            let indexed = store
                .index_chunks(collection, lexical.chunks(), embedder.as_ref())
                .await?;
            info!(collection, indexed, "semantic collection built");
        }

        let store: Arc<dyn VectorStore> = Arc::new(store);
        let semantic = SemanticRetriever::connect(store, embedder, collection).await?;
        let hybrid = HybridRetriever::new(
            Arc::new(lexical),
            Arc::new(semantic),
            config.retrieval.fusion(),
        );

        let collaborators = llm_collaborators(&client, &config)?;

        let mut builder = Self::builder(config)
            .with_retriever(Arc::new(hybrid))
            .with_collaborators(collaborators);
        if builder.config.retrieval.use_query_rewriting {
            let settings = AgentSettings::default().with_temperature(0.0);
            let generator: Arc<dyn TextGenerator> =
                Arc::new(TunedGenerator::new(client.clone(), &settings));
            builder = builder.with_rewriter(Arc::new(LlmRewriter::new(generator)));
        }
        builder.build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Retrieve passages through the orchestrator.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        options: RetrieveOptions,
    ) -> Result<Vec<RetrievalResult>, EngineError> {
        Ok(self.retrieval.retrieve(query, top_k, options).await?)
    }

    /// Run one turn for a session.
    ///
    /// The session lock is held for the whole turn, so turns on one session
    /// are serialized while different sessions run concurrently.
    pub async fn execute_turn(
        &self,
        session_id: &str,
        player_command: &str,
        initial_context: Option<&str>,
    ) -> Result<TurnResult, EngineError> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        Ok(self
            .game_loop
            .execute_turn(&mut session, player_command, initial_context)
            .await)
    }

    /// Create a session and return its id.
    pub fn create_session(&self, initial_context: Option<String>) -> String {
        self.sessions.create_session(initial_context).0
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.session(session_id).ok()
    }

    /// Registry lookup that also drops the progress of a session found expired.
    fn session(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        let lookup = self.sessions.session(session_id);
        if let Err(SessionError::Expired(_)) = &lookup {
            self.game_loop.clear_progress(session_id);
        }
        lookup
    }

    /// Summary of one session. Waits for any turn in progress.
    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary, EngineError> {
        let handle = self.session(session_id)?;
        let session = handle.lock().await;
        Ok(session.summary())
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        self.game_loop.clear_progress(session_id);
        self.sessions.delete_session(session_id)
    }

    /// Drop expired sessions, returning how many were removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let removed = self.sessions.remove_expired();
        for session_id in &removed {
            self.game_loop.clear_progress(session_id);
        }
        removed.len()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.list_sessions()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.session_count()
    }

    pub fn clear_cache(&self) {
        self.retrieval.clear_cache();
    }

    /// Counters from the metrics collector, if it keeps any.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.snapshot()
    }

    /// Latest progress of the turn running (or last run) on a session.
    pub fn progress(&self, session_id: &str) -> Option<TurnProgress> {
        self.game_loop.progress(session_id)
    }
}

fn tuned(client: &Arc<llm::Client>, settings: &AgentSettings) -> Arc<dyn TextGenerator> {
    Arc::new(TunedGenerator::new(client.clone(), settings))
}

fn llm_collaborators(
    client: &Arc<llm::Client>,
    config: &EngineConfig,
) -> Result<Collaborators, ConfigError> {
    let agents = &config.agents;
    if !agents.narrator.enabled || !agents.dialogue.enabled {
        return Err(ConfigError::Invalid(
            "narrator and dialogue agents cannot be disabled".to_string(),
        ));
    }

    let mut collaborators = Collaborators::new(
        Arc::new(LlmNarrator::new(tuned(client, &agents.narrator))),
        Arc::new(LlmDialogueAgent::new(tuned(client, &agents.dialogue))),
    );
    if agents.validator.enabled {
        collaborators = collaborators.with_validator(Arc::new(
            LlmValidator::new(tuned(client, &agents.validator)).with_mode(agents.validation_mode),
        ));
    }
    if agents.planner.enabled {
        collaborators =
            collaborators.with_planner(Arc::new(LlmPlanner::new(tuned(client, &agents.planner))));
    }
    if agents.persona_extractor.enabled {
        collaborators = collaborators.with_persona_extractor(Arc::new(LlmPersonaExtractor::new(
            tuned(client, &agents.persona_extractor),
        )));
    }
    Ok(collaborators)
}
