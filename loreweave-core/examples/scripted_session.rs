//! Plays a few scripted turns against the in-memory corpus.
//!
//! Run with: `LOREWEAVE_LOG=debug cargo run -p loreweave-core --example scripted_session`

use loreweave_core::testing::{
    fantasy_corpus, in_memory_retriever, ScriptedDialogue, ScriptedNarrator,
    ScriptedPersonaExtractor, ScriptedPlanner, ScriptedValidator,
};
use loreweave_core::{
    Collaborators, EngineConfig, NarrativeEngine, ScenePlanOutput, ValidationResult,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOREWEAVE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let retriever = in_memory_retriever(fantasy_corpus()).await?;

    let validator = ScriptedValidator::approving()
        .with_user_verdict(ValidationResult::approve("Bag End is in the Shire.", 0.9))
        .with_user_verdict(ValidationResult::approve("Gandalf visits the Shire.", 0.9))
        .with_user_verdict(
            ValidationResult::reject("There are no starships in Middle-earth.", 0.95)
                .with_suggestions(vec!["Walk the road east to Rivendell".to_string()]),
        );
    let planner = ScriptedPlanner::new(vec![
        ScenePlanOutput::narrate().with_next_scene("Bag End"),
        ScenePlanOutput::engage("Gandalf"),
    ]);
    let collaborators = Collaborators::new(
        Arc::new(ScriptedNarrator::new(
            "You stand before a round green door set into the hill.",
        )),
        Arc::new(ScriptedDialogue::new(
            "A wizard is never late. He arrives precisely when he means to.",
        )),
    )
    .with_validator(Arc::new(validator))
    .with_planner(Arc::new(planner))
    .with_persona_extractor(Arc::new(ScriptedPersonaExtractor::new("grave and cryptic")));

    let engine = NarrativeEngine::builder(EngineConfig::default())
        .with_retriever(Arc::new(retriever))
        .with_collaborators(collaborators)
        .build()?;

    let session_id = engine.create_session(Some("The Shire, late summer".to_string()));

    for command in [
        "I walk up the hill to Bag End",
        "I ask Gandalf why he has come",
        "I board my starship and fly to Mordor",
    ] {
        let turn = engine.execute_turn(&session_id, command, None).await?;
        println!("> {command}");
        println!("{}", turn.display_text().unwrap_or("(no response)"));
        println!("[{:?}, {:.0} ms]\n", turn.outcome, turn.duration.as_secs_f64() * 1000.0);
    }

    let summary = engine.session_summary(&session_id).await?;
    println!(
        "turns: {}, scene: {}, npcs: {}, wins: {}, losses: {}",
        summary.turn_count,
        summary.current_scene.as_deref().unwrap_or("-"),
        summary.active_npcs.join(", "),
        summary.wins,
        summary.losses
    );
    if let Some(metrics) = engine.metrics() {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }

    Ok(())
}
