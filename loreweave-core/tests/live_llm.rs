//! Integration tests that call a real LLM provider.
//!
//! These tests need provider credentials (via .env file or environment, see
//! `llm::ClientConfig::from_env`).
//! Run with: `cargo test -p loreweave-core --test live_llm -- --ignored`
//!
//! Retrieval runs over the in-memory corpus with hash embeddings, so only
//! text generation goes over the network.

use loreweave_core::agents::{
    LlmDialogueAgent, LlmNarrator, LlmPersonaExtractor, LlmPlanner, LlmValidator,
};
use loreweave_core::game::{GameLoop, InMemoryMetrics};
use loreweave_core::retrieval::{RetrievalManager, RetrieveOptions};
use loreweave_core::testing::{fantasy_corpus, in_memory_retriever};
use loreweave_core::{Collaborators, GameSession, PersonaExtractor, SessionConfig, TextGenerator};
use std::sync::Arc;

fn setup() -> Option<Arc<dyn TextGenerator>> {
    let _ = dotenvy::dotenv();
    match llm::Client::from_env() {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            eprintln!("Skipping test: {e}");
            None
        }
    }
}

async fn game(generator: Arc<dyn TextGenerator>) -> GameLoop {
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let collaborators = Collaborators::new(
        Arc::new(LlmNarrator::new(generator.clone())),
        Arc::new(LlmDialogueAgent::new(generator.clone())),
    )
    .with_validator(Arc::new(LlmValidator::new(generator.clone())))
    .with_planner(Arc::new(LlmPlanner::new(generator.clone())))
    .with_persona_extractor(Arc::new(LlmPersonaExtractor::new(generator)));

    GameLoop::new(
        Arc::new(RetrievalManager::new(Arc::new(retriever))),
        collaborators,
        Arc::new(InMemoryMetrics::new()),
    )
}

#[tokio::test]
#[ignore] // Run with: cargo test -p loreweave-core --test live_llm -- --ignored
async fn test_live_turn_produces_text() {
    let Some(generator) = setup() else { return };
    let game = game(generator).await;
    let mut session = GameSession::new(SessionConfig::default());

    let result = game
        .execute_turn(&mut session, "I knock on the round green door of Bag End", None)
        .await;

    assert!(result.success, "turn failed: {:?}", result.error);
    let text = result.display_text().unwrap_or_default();
    assert!(!text.trim().is_empty(), "turn should produce text");
    assert_eq!(session.turns().len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_live_persona_extraction() {
    let Some(generator) = setup() else { return };
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let manager = RetrievalManager::new(Arc::new(retriever));
    let passages = manager
        .retrieve(
            "Gandalf character personality speaking style dialogue",
            5,
            RetrieveOptions::for_agent("persona_extractor"),
        )
        .await
        .unwrap();

    let persona = LlmPersonaExtractor::new(generator)
        .extract("Gandalf", &passages)
        .await
        .expect("persona extraction should succeed");

    assert_eq!(persona.name, "Gandalf");
    assert!(!persona.speaking_style.is_empty());
    assert!(persona.personality_traits.len() <= 5);
}
