//! End-to-end turns against the in-memory corpus with scripted collaborators.

use loreweave_core::agents::{Severity, ValidationKind};
use loreweave_core::game::{GameLoop, InMemoryMetrics, MetricsCollector, TurnPhase, TurnProgress};
use loreweave_core::retrieval::{RetrievalManager, Retriever};
use loreweave_core::testing::{
    fantasy_corpus, in_memory_retriever, FailingRetriever, ScriptedDialogue, ScriptedNarrator,
    ScriptedPersonaExtractor, ScriptedPlanner, ScriptedValidator,
};
use loreweave_core::{
    AgentRole, Collaborators, GameSession, ScenePlanOutput, SessionConfig, ValidationResult,
};
use std::sync::{Arc, Mutex};

struct Harness {
    validator: Arc<ScriptedValidator>,
    planner: Arc<ScriptedPlanner>,
    narrator: Arc<ScriptedNarrator>,
    dialogue: Arc<ScriptedDialogue>,
    extractor: Arc<ScriptedPersonaExtractor>,
    metrics: Arc<InMemoryMetrics>,
    game: GameLoop,
}

impl Harness {
    async fn new(validator: ScriptedValidator, planner: ScriptedPlanner) -> Self {
        let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
        Self::with_retriever(
            Arc::new(retriever),
            validator,
            planner,
            ScriptedNarrator::new("The Shire lies quiet under a grey sky."),
        )
    }

    fn with_retriever(
        retriever: Arc<dyn Retriever>,
        validator: ScriptedValidator,
        planner: ScriptedPlanner,
        narrator: ScriptedNarrator,
    ) -> Self {
        let validator = Arc::new(validator);
        let planner = Arc::new(planner);
        let narrator = Arc::new(narrator);
        let dialogue = Arc::new(ScriptedDialogue::new(
            "A wizard is never late, Frodo Baggins.",
        ));
        let extractor = Arc::new(ScriptedPersonaExtractor::new("grave and cryptic"));
        let metrics = Arc::new(InMemoryMetrics::new());

        let collaborators = Collaborators::new(narrator.clone(), dialogue.clone())
            .with_validator(validator.clone())
            .with_planner(planner.clone())
            .with_persona_extractor(extractor.clone());
        let game = GameLoop::new(
            Arc::new(RetrievalManager::new(retriever)),
            collaborators,
            metrics.clone(),
        );

        Self {
            validator,
            planner,
            narrator,
            dialogue,
            extractor,
            metrics,
            game,
        }
    }
}

fn session() -> GameSession {
    GameSession::with_id("test-session", SessionConfig::default())
}

#[tokio::test]
async fn test_rejected_command_ends_turn_and_player_loses() {
    let validator = ScriptedValidator::approving().with_user_verdict(
        ValidationResult::reject("Quantum physics has no place in Middle-earth.", 0.95)
            .with_suggestions(vec!["Ask Gandalf about the Ring".to_string()]),
    );
    let planner = ScriptedPlanner::new(vec![ScenePlanOutput::engage("Gandalf")]);
    let h = Harness::new(validator, planner).await;
    let mut s = session();

    let result = h
        .game
        .execute_turn(&mut s, "ask about quantum physics", None)
        .await;

    assert!(result.success);
    assert!(result.player_loses());
    assert!(result.turn_ended_early);
    assert!(result.npc_output.is_none());
    assert!(result.agent_validation.is_none());

    let output = result.narrator_output.as_ref().unwrap();
    assert!(output.content.contains("doesn't fit this world"));
    assert!(output.content.contains("Ask Gandalf about the Ring"));
    assert_eq!(output.metadata["source"], "rules_referee");
    assert_eq!(output.metadata["type"], "user_prompt");

    let plan = result.scene_plan.as_ref().unwrap();
    assert_eq!(plan.validation_status, "rejected");
    assert!(plan.target.is_none());
    assert_eq!(
        result.metadata.disqualification_reason.as_deref(),
        Some("Quantum physics has no place in Middle-earth.")
    );

    // The planner still runs but cannot override the rejection.
    assert_eq!(h.planner.calls(), 1);
    assert_eq!(h.narrator.calls(), 0);
    assert_eq!(h.dialogue.calls(), 0);

    assert_eq!(s.losses(), 1);
    assert_eq!(s.wins(), 0);
    assert_eq!(s.turns().len(), 1);
    assert!(s.state().active_npcs.is_empty());
}

#[tokio::test]
async fn test_rejected_response_ends_turn_and_player_wins() {
    let validator = ScriptedValidator::approving()
        .with_agent_verdict(ValidationResult::reject("Gandalf never wore a red hat.", 0.9));
    let planner = ScriptedPlanner::new(vec![ScenePlanOutput::engage("Gandalf")]);
    let h = Harness::new(validator, planner).await;
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I greet Gandalf", None).await;

    assert!(result.success);
    assert!(result.player_wins());
    assert!(result.turn_ended_early);
    assert!(result.npc_output.is_none());
    assert_eq!(
        result.metadata.original_agent_response.as_deref(),
        Some("A wizard is never late, Frodo Baggins.")
    );

    let output = result.narrator_output.as_ref().unwrap();
    assert!(output.content.contains("contradicts the established facts"));
    assert_eq!(output.metadata["type"], "agent_response");
    assert_eq!(output.metadata["rejected_role"], "npc_manager");

    assert_eq!(s.wins(), 1);
    assert_eq!(s.turns().len(), 1);
    // Rejected responses do not change world state.
    assert!(s.state().active_npcs.is_empty());
    assert_eq!(
        h.validator.kinds(),
        vec![
            ValidationKind::UserPrompt,
            ValidationKind::AgentResponse(AgentRole::NpcManager)
        ]
    );
}

#[tokio::test]
async fn test_rejected_narration_ends_turn_and_player_wins() {
    let validator = ScriptedValidator::approving().with_agent_verdict(ValidationResult::reject(
        "The Shire has no volcanoes.",
        0.92,
    ));
    let planner =
        ScriptedPlanner::new(vec![ScenePlanOutput::narrate().with_next_scene("Mount Doom")]);
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let h = Harness::with_retriever(
        Arc::new(retriever),
        validator,
        planner,
        ScriptedNarrator::new("Lava pours down the hills of Hobbiton."),
    );
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around Hobbiton", None).await;

    assert!(result.success);
    assert!(result.player_wins());
    assert!(result.turn_ended_early);
    assert_eq!(
        result.metadata.original_agent_response.as_deref(),
        Some("Lava pours down the hills of Hobbiton.")
    );
    assert_eq!(
        result.metadata.disqualification_reason.as_deref(),
        Some("The Shire has no volcanoes.")
    );

    let output = result.narrator_output.as_ref().unwrap();
    assert!(output.content.contains("contradicts the established facts"));
    assert_eq!(output.metadata["type"], "agent_response");
    assert_eq!(output.metadata["rejected_role"], "narrator");

    assert_eq!(h.narrator.calls(), 1);
    assert_eq!(h.dialogue.calls(), 0);
    assert_eq!(s.wins(), 1);
    assert_eq!(s.losses(), 0);
    // The planned scene change is discarded with the rejected narration.
    assert!(s.state().current_scene.is_none());
    assert_eq!(
        h.validator.kinds(),
        vec![
            ValidationKind::UserPrompt,
            ValidationKind::AgentResponse(AgentRole::Narrator)
        ]
    );
}

#[tokio::test]
async fn test_npc_dialogue_turn() {
    let planner = ScriptedPlanner::new(vec![ScenePlanOutput::engage("Gandalf")]);
    let h = Harness::new(ScriptedValidator::approving(), planner).await;
    let mut s = session();

    let result = h
        .game
        .execute_turn(&mut s, "I ask Gandalf why he is late", None)
        .await;

    assert!(result.success);
    assert!(!result.turn_ended_early);
    assert!(result.narrator_output.is_none());
    assert_eq!(result.npc_name.as_deref(), Some("Gandalf"));
    assert_eq!(
        result.display_text(),
        Some("A wizard is never late, Frodo Baggins.")
    );
    assert_eq!(result.metadata.persona_cache_hit, Some(false));
    assert!(!result.metadata.user_chunks.is_empty());
    assert!(!result.metadata.agent_chunks.is_empty());

    assert!(s.state().active_npcs.contains("Gandalf"));
    assert!(s.persona("Gandalf").is_some());
    assert_eq!(s.turns().len(), 1);
    assert!(s.turns()[0].agent_outputs.contains_key(&AgentRole::NpcManager));

    let speakers = h.dialogue.speakers();
    assert_eq!(speakers.len(), 1);
    assert_eq!(speakers[0].0, "Gandalf");
    assert_eq!(speakers[0].1.speaking_style, "grave and cryptic");
}

#[tokio::test]
async fn test_persona_extracted_once_per_npc() {
    let planner = ScriptedPlanner::new(vec![
        ScenePlanOutput::engage("Gandalf"),
        ScenePlanOutput::engage("Gandalf"),
    ]);
    let h = Harness::new(ScriptedValidator::approving(), planner).await;
    let mut s = session();

    let first = h.game.execute_turn(&mut s, "I greet Gandalf", None).await;
    let second = h
        .game
        .execute_turn(&mut s, "I ask Gandalf about his hat", None)
        .await;

    assert_eq!(first.metadata.persona_cache_hit, Some(false));
    assert_eq!(second.metadata.persona_cache_hit, Some(true));
    assert_eq!(h.extractor.calls(), 1);
    assert_eq!(h.dialogue.calls(), 2);
    assert_eq!(s.cached_persona_count(), 1);

    let snap = h.metrics.snapshot().unwrap();
    assert_eq!(snap.persona_cache_hits, 1);
    assert_eq!(snap.persona_cache_misses, 1);
    assert_eq!(snap.turns, 2);
}

#[tokio::test]
async fn test_failed_persona_extraction_uses_fallback() {
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let narrator = Arc::new(ScriptedNarrator::new("unused"));
    let dialogue = Arc::new(ScriptedDialogue::new("Hmm."));
    let collaborators = Collaborators::new(narrator, dialogue.clone())
        .with_planner(Arc::new(ScriptedPlanner::new(vec![ScenePlanOutput::engage("Elrond")])))
        .with_persona_extractor(Arc::new(ScriptedPersonaExtractor::failing()));
    let game = GameLoop::new(
        Arc::new(RetrievalManager::new(Arc::new(retriever))),
        collaborators,
        Arc::new(InMemoryMetrics::new()),
    );
    let mut s = session();

    let result = game.execute_turn(&mut s, "I bow to Elrond", None).await;

    assert!(result.success);
    assert_eq!(dialogue.speakers()[0].1.name, "Elrond");
    assert!(s.persona("Elrond").is_some());
}

#[tokio::test]
async fn test_narrator_turn_sets_scene() {
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let h = Harness::with_retriever(
        Arc::new(retriever),
        ScriptedValidator::approving(),
        ScriptedPlanner::new(vec![ScenePlanOutput::narrate()]),
        ScriptedNarrator::new("The road winds east toward Rivendell.").with_scene("Rivendell"),
    );
    let mut s = session();

    let result = h
        .game
        .execute_turn(&mut s, "I follow the road east", None)
        .await;

    assert!(result.success);
    assert!(result.npc_output.is_none());
    assert!(result.scene_plan.as_ref().unwrap().target.is_none());
    assert_eq!(
        result.narrator_output.as_ref().unwrap().content,
        "The road winds east toward Rivendell."
    );
    assert_eq!(s.state().current_scene.as_deref(), Some("Rivendell"));
    assert!(s.state().active_npcs.is_empty());
    assert_eq!(h.dialogue.calls(), 0);
    assert_eq!(h.extractor.calls(), 0);
}

#[tokio::test]
async fn test_engage_without_target_narrates() {
    let mut plan = ScenePlanOutput::engage("Gandalf");
    plan.target = None;
    let h = Harness::new(ScriptedValidator::approving(), ScriptedPlanner::new(vec![plan])).await;
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I talk to someone", None).await;

    assert!(result.success);
    assert!(result.narrator_output.is_some());
    assert_eq!(h.narrator.calls(), 1);
    assert_eq!(h.dialogue.calls(), 0);
}

#[tokio::test]
async fn test_planner_failure_falls_back_to_narrator() {
    let h = Harness::new(ScriptedValidator::approving(), ScriptedPlanner::failing()).await;
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around", None).await;

    assert!(result.success);
    let plan = result.scene_plan.as_ref().unwrap();
    assert!(plan.reasoning.contains("Scene planning failed"));
    assert_eq!(h.narrator.calls(), 1);
    assert!(result.narrator_output.is_some());

    let snap = h.metrics.snapshot().unwrap();
    assert_eq!(snap.agents[&AgentRole::ScenePlanner].failures, 1);
}

#[tokio::test]
async fn test_validator_failure_approves_with_zero_confidence() {
    let h = Harness::new(ScriptedValidator::failing(), ScriptedPlanner::new(Vec::new())).await;
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around", None).await;

    assert!(result.success);
    let verdict = result.user_validation.as_ref().unwrap();
    assert!(verdict.approved);
    assert_eq!(verdict.confidence, 0.0);
    assert_eq!(verdict.severity, Severity::Warning);
    assert!(verdict.reason.starts_with("Validation unavailable"));
    assert!(result.agent_validation.as_ref().unwrap().approved);
    assert_eq!(s.turns().len(), 1);
}

#[tokio::test]
async fn test_narrator_failure_aborts_without_history() {
    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let h = Harness::with_retriever(
        Arc::new(retriever),
        ScriptedValidator::approving(),
        ScriptedPlanner::new(Vec::new()),
        ScriptedNarrator::failing(),
    );
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around", None).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("narrator"));
    assert!(result.narrator_output.is_none());
    assert!(s.turns().is_empty());
    assert!(s.state().memory.is_empty());
    assert_eq!(s.next_turn_number(), 1);

    let progress = h.game.progress("test-session").unwrap();
    assert_eq!(progress.phase, TurnPhase::Error);
    assert!(progress.error.is_some());

    let snap = h.metrics.snapshot().unwrap();
    assert_eq!(snap.failed_turns, 1);
}

#[tokio::test]
async fn test_missing_index_aborts_turn() {
    let h = Harness::with_retriever(
        Arc::new(FailingRetriever::index_not_loaded()),
        ScriptedValidator::approving(),
        ScriptedPlanner::new(Vec::new()),
        ScriptedNarrator::new("unused"),
    );
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around", None).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("Index not loaded"));
    assert_eq!(h.validator.calls(), 0);
    assert_eq!(h.narrator.calls(), 0);
    assert!(s.turns().is_empty());
}

#[tokio::test]
async fn test_leaf_failure_degrades_to_no_context() {
    let h = Harness::with_retriever(
        Arc::new(FailingRetriever::embedding_failure()),
        ScriptedValidator::approving(),
        ScriptedPlanner::new(Vec::new()),
        ScriptedNarrator::new("Mist covers everything."),
    );
    let mut s = session();

    let result = h.game.execute_turn(&mut s, "I look around", None).await;

    assert!(result.success);
    assert!(result.metadata.user_chunks.is_empty());
    assert!(result.metadata.agent_chunks.is_empty());
    assert_eq!(result.metadata.retrieval_calls, 2);
}

#[tokio::test]
async fn test_progress_phases_for_narrator_turn() {
    let phases = Arc::new(Mutex::new(Vec::new()));
    let seen = phases.clone();
    let observer = move |p: &TurnProgress| seen.lock().unwrap().push(p.phase);

    let retriever = in_memory_retriever(fantasy_corpus()).await.unwrap();
    let collaborators = Collaborators::new(
        Arc::new(ScriptedNarrator::new("Bag End is warm and bright.")),
        Arc::new(ScriptedDialogue::new("unused")),
    );
    let game = GameLoop::new(
        Arc::new(RetrievalManager::new(Arc::new(retriever))),
        collaborators,
        Arc::new(InMemoryMetrics::new()),
    )
    .with_observer(Arc::new(observer));
    let mut s = session();

    let result = game.execute_turn(&mut s, "I enter Bag End", None).await;
    assert!(result.success);

    assert_eq!(
        *phases.lock().unwrap(),
        vec![
            TurnPhase::Started,
            TurnPhase::UserRetrieval,
            TurnPhase::UserValidation,
            TurnPhase::ScenePlanning,
            TurnPhase::NarratorScene,
            TurnPhase::AgentRetrieval,
            TurnPhase::AgentValidation,
            TurnPhase::UpdatingState,
            TurnPhase::Completed,
        ]
    );
    assert!(game.progress("test-session").unwrap().phase.is_terminal());
}

#[tokio::test]
async fn test_memory_and_initial_context_reach_collaborators() {
    let h = Harness::new(ScriptedValidator::approving(), ScriptedPlanner::new(Vec::new())).await;
    let mut s = session();

    h.game
        .execute_turn(&mut s, "look around", Some("Hobbiton, late summer"))
        .await;
    h.game.execute_turn(&mut s, "walk to the Green Dragon", None).await;

    let snapshots = h.narrator.snapshots();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(
        snapshots[0].initial_context.as_deref(),
        Some("Hobbiton, late summer")
    );
    assert_eq!(snapshots[0].memory_context, "");
    assert!(snapshots[1]
        .memory_context
        .starts_with("Previous conversation:\nTurn 1: look around"));
    assert_eq!(snapshots[1].last_command.as_deref(), Some("look around"));
    assert_eq!(s.turns().len(), 2);
    assert_eq!(s.state().memory.len(), 2);
}
