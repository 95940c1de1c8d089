//! Corpus-grounded interactive narrative engine.
//!
//! This crate provides:
//! - Hybrid retrieval (BM25 + embeddings) with RRF or weighted fusion
//! - A retrieval orchestrator with query rewriting and a result cache
//! - Per-session memory bounded by turn count and token budget
//! - A turn state machine that validates, plans, narrates and re-validates
//!   every player command against the corpus
//!
//! # Quick Start
//!
//! ```ignore
//! use loreweave_core::{EngineConfig, NarrativeEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let engine = NarrativeEngine::from_env(config).await?;
//!
//!     let session_id = engine.create_session(Some("Hobbiton, late summer".into()));
//!     let turn = engine.execute_turn(&session_id, "I ask Gandalf about the ring", None).await?;
//!
//!     println!("{}", turn.display_text().unwrap_or_default());
//!     if turn.player_loses() {
//!         println!("That action doesn't fit this world.");
//!     }
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod config;
pub mod engine;
pub mod game;
pub mod generation;
pub mod retrieval;
pub mod session;
pub mod session_manager;
pub mod testing;

// Primary public API
pub use agents::{
    AgentOutput, AgentRole, CollaboratorError, Collaborators, DialogueAgent, Narrator, NextAction,
    Persona, PersonaExtractor, Planner, ScenePlanOutput, SessionSnapshot, Severity,
    ValidationResult, Validator,
};
pub use config::{
    AgentSettings, AgentsConfig, ConfigError, EngineConfig, IndexConfig, RetrievalConfig,
    SessionConfig, ValidationMode,
};
pub use engine::{EngineBuilder, EngineError, NarrativeEngine};
pub use game::{
    GameLoop, InMemoryMetrics, MetricsCollector, MetricsSnapshot, NoopMetrics, TurnOutcome,
    TurnPhase, TurnProgress, TurnResult,
};
pub use generation::{GenerationError, TextGenerator};
pub use retrieval::{
    Chunk, FusionStrategy, HybridRetriever, LexicalRetriever, RetrievalError, RetrievalManager,
    RetrievalResult, RetrieveOptions, Retriever, SemanticRetriever,
};
pub use session::{GameSession, SessionState, Turn};
pub use session_manager::{SessionError, SessionHandle, SessionManager};
