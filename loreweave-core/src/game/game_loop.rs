//! The per-turn state machine.
//!
//! ```text
//! Started -> UserRetrieval -> UserValidation -> ScenePlanning
//!   -> disqualify                                   -> Disqualified (player loses)
//!   -> engage_npc  -> [PersonaExtraction] -> NpcResponse -+
//!   -> narrator_scene -> NarratorScene ------------------+
//!        -> AgentRetrieval -> AgentValidation
//!             -> rejected                           -> Disqualified (player wins)
//!             -> approved -> UpdatingState          -> Completed
//! ```
//!
//! Any phase may end in `Error`, in which case nothing is written to the
//! session history.

use super::metrics::MetricsCollector;
use super::turn::{
    ChunkRef, ProgressObserver, TurnOutcome, TurnPhase, TurnProgress, TurnResult,
};
use crate::agents::{
    AgentOutput, AgentRole, CollaboratorError, Collaborators, NextAction, Persona,
    ScenePlanOutput, SessionSnapshot, ValidationKind, ValidationRequest, ValidationResult,
    SCENE_KEY,
};
use crate::retrieval::{RetrievalError, RetrievalManager, RetrievalResult, RetrieveOptions};
use crate::session::{GameSession, Turn};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Agent name used when retrieving context for the player's command.
pub const USER_VALIDATION_AGENT: &str = "user_validation";
/// Agent name used when retrieving context for a generated response.
pub const AGENT_VALIDATION_AGENT: &str = "agent_validation";
/// Agent name used when retrieving passages about an NPC.
pub const PERSONA_AGENT: &str = "persona_extractor";

/// Memory entries whose commands are folded into the user retrieval query.
const RECENT_COMMANDS_IN_QUERY: usize = 2;

/// Why a turn was aborted.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("{role} failed: {source}")]
    Collaborator {
        role: AgentRole,
        #[source]
        source: CollaboratorError,
    },
}

/// Drives turns for any number of sessions.
pub struct GameLoop {
    retrieval: Arc<RetrievalManager>,
    collaborators: Collaborators,
    metrics: Arc<dyn MetricsCollector>,
    observer: Option<Arc<dyn ProgressObserver>>,
    progress: DashMap<String, TurnProgress>,
    retrieval_top_k: usize,
    persona_top_k: usize,
}

impl GameLoop {
    pub fn new(
        retrieval: Arc<RetrievalManager>,
        collaborators: Collaborators,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            retrieval,
            collaborators,
            metrics,
            observer: None,
            progress: DashMap::new(),
            retrieval_top_k: 10,
            persona_top_k: 5,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Passages fetched for each validation retrieval.
    pub fn with_retrieval_top_k(mut self, top_k: usize) -> Self {
        self.retrieval_top_k = top_k;
        self
    }

    /// Passages fetched when building a persona.
    pub fn with_persona_top_k(mut self, top_k: usize) -> Self {
        self.persona_top_k = top_k;
        self
    }

    /// Latest progress reported for a session.
    pub fn progress(&self, session_id: &str) -> Option<TurnProgress> {
        self.progress.get(session_id).map(|p| p.clone())
    }

    /// Forget progress for a session that no longer exists.
    pub fn clear_progress(&self, session_id: &str) {
        self.progress.remove(session_id);
    }

    fn report(&self, progress: &TurnProgress) {
        debug!(
            session_id = %progress.session_id,
            turn = progress.turn_number,
            phase = %progress.phase,
            message = %progress.message,
            "turn progress"
        );
        self.progress
            .insert(progress.session_id.clone(), progress.clone());
        if let Some(observer) = &self.observer {
            observer.on_progress(progress);
        }
    }

    fn enter(
        &self,
        progress: &mut TurnProgress,
        phase: TurnPhase,
        agent: Option<AgentRole>,
        message: impl Into<String>,
    ) {
        progress.enter(phase, agent, message);
        self.report(progress);
    }

    /// Run one turn to completion.
    ///
    /// Never fails: an aborted turn comes back with `success = false` and the
    /// session history untouched.
    pub async fn execute_turn(
        &self,
        session: &mut GameSession,
        player_command: &str,
        initial_context: Option<&str>,
    ) -> TurnResult {
        let started = Instant::now();
        let turn_number = session.next_turn_number();
        let mut progress = TurnProgress::new(session.session_id(), turn_number);
        let mut result = TurnResult::new(session.session_id(), turn_number, player_command);
        self.report(&progress);

        info!(
            session_id = %session.session_id(),
            turn = turn_number,
            command = %player_command.chars().take(100).collect::<String>(),
            "turn started"
        );

        if let Some(context) = initial_context {
            if session.turns().is_empty() && session.state().initial_context.is_none() {
                session.set_initial_context(context);
            }
        }

        session.touch();
        let outcome = self
            .run(session, player_command, &mut progress, &mut result)
            .await;

        result.duration = started.elapsed();
        result.metadata.timestamp = Some(chrono::Utc::now());
        result.metadata.retrieval_calls = progress.retrieval_calls;
        result.metadata.agents_executed = progress.agents_completed.clone();

        match outcome {
            Ok(()) => {
                info!(
                    session_id = %session.session_id(),
                    turn = turn_number,
                    outcome = ?result.outcome,
                    duration_ms = result.duration.as_millis() as u64,
                    "turn finished"
                );
            }
            Err(e) => {
                error!(
                    session_id = %session.session_id(),
                    turn = turn_number,
                    error = %e,
                    "turn aborted"
                );
                result.success = false;
                result.error = Some(e.to_string());
                progress.error = Some(e.to_string());
                self.enter(
                    &mut progress,
                    TurnPhase::Error,
                    None,
                    format!("Error during turn {turn_number}: {e}"),
                );
            }
        }

        self.metrics
            .record_turn(result.outcome, result.success, result.duration);
        result
    }

    async fn run(
        &self,
        session: &mut GameSession,
        player_command: &str,
        progress: &mut TurnProgress,
        result: &mut TurnResult,
    ) -> Result<(), TurnError> {
        // User retrieval.
        self.enter(progress, TurnPhase::UserRetrieval, None, "Retrieving context for the command");
        let query = user_query(session, player_command);
        let user_passages = self
            .retrieve(&query, self.retrieval_top_k, USER_VALIDATION_AGENT, progress)
            .await?;
        result.metadata.user_chunks = chunk_refs(&user_passages);

        // User validation.
        self.enter(
            progress,
            TurnPhase::UserValidation,
            Some(AgentRole::RulesReferee),
            "Validating the command against the corpus",
        );
        let snapshot = session.snapshot();
        let validation = self
            .validate(
                ValidationKind::UserPrompt,
                player_command,
                player_command,
                &user_passages,
                &snapshot,
                progress,
            )
            .await;
        result.user_validation = Some(validation.clone());

        // Planning.
        self.enter(
            progress,
            TurnPhase::ScenePlanning,
            Some(AgentRole::ScenePlanner),
            "Planning the scene",
        );
        let plan = self
            .plan(player_command, &user_passages, &validation, &snapshot, progress)
            .await;
        result.scene_plan = Some(plan.clone());

        let (role, output, npc) = match plan.next_action {
            NextAction::Disqualify => {
                self.disqualify_command(session, player_command, &validation, &plan, progress, result);
                return Ok(());
            }
            NextAction::EngageNpc => {
                // `plan()` guarantees a target here.
                let npc = plan.target.clone().unwrap_or_default();
                let persona = self.persona_for(session, &npc, progress, result).await?;

                self.enter(
                    progress,
                    TurnPhase::NpcResponse,
                    Some(AgentRole::NpcManager),
                    format!("{npc} is responding"),
                );
                let call = Instant::now();
                let reply = self
                    .collaborators
                    .dialogue
                    .respond(&npc, &persona, player_command, &user_passages, &snapshot)
                    .await;
                let output = self.finish_call(AgentRole::NpcManager, reply, call, progress)?;
                (AgentRole::NpcManager, output, Some(npc))
            }
            NextAction::NarratorScene => {
                self.enter(
                    progress,
                    TurnPhase::NarratorScene,
                    Some(AgentRole::Narrator),
                    "Narrating the scene",
                );
                let call = Instant::now();
                let narration = self
                    .collaborators
                    .narrator
                    .narrate(player_command, &user_passages, &snapshot)
                    .await;
                let output = self.finish_call(AgentRole::Narrator, narration, call, progress)?;
                (AgentRole::Narrator, output, None)
            }
        };

        // Agent retrieval and validation.
        self.enter(
            progress,
            TurnPhase::AgentRetrieval,
            None,
            "Retrieving context for the response",
        );
        let agent_passages = self
            .retrieve(&output.content, self.retrieval_top_k, AGENT_VALIDATION_AGENT, progress)
            .await?;
        result.metadata.agent_chunks = chunk_refs(&agent_passages);

        self.enter(
            progress,
            TurnPhase::AgentValidation,
            Some(AgentRole::RulesReferee),
            "Validating the response against the corpus",
        );
        let agent_validation = self
            .validate(
                ValidationKind::AgentResponse(role),
                player_command,
                &output.content,
                &agent_passages,
                &snapshot,
                progress,
            )
            .await;
        result.agent_validation = Some(agent_validation.clone());
        result.npc_name = npc.clone();

        if !agent_validation.approved {
            self.disqualify_response(
                session,
                player_command,
                role,
                output,
                &agent_validation,
                progress,
                result,
            );
            return Ok(());
        }

        // State update.
        self.enter(progress, TurnPhase::UpdatingState, None, "Updating session state");
        if let Some(npc) = &npc {
            session.activate_npc(npc.clone());
        }
        if let Some(scene) = &plan.next_scene {
            session.set_scene(scene.clone());
        }
        if let Some(scene) = output.metadata.get(SCENE_KEY).and_then(|v| v.as_str()) {
            session.set_scene(scene);
        }
        session.set_last_validation(agent_validation);
        session.add_turn(Turn::new(result.turn_number, player_command).with_output(role, output.clone()));

        match role {
            AgentRole::NpcManager => result.npc_output = Some(output),
            _ => result.narrator_output = Some(output),
        }
        self.enter(
            progress,
            TurnPhase::Completed,
            None,
            format!("Turn {} completed", result.turn_number),
        );
        Ok(())
    }

    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        agent: &str,
        progress: &mut TurnProgress,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let started = Instant::now();
        let passages = self
            .retrieval
            .retrieve(query, top_k, RetrieveOptions::for_agent(agent))
            .await?;
        progress.retrieval_calls += 1;
        self.metrics
            .record_retrieval(agent, passages.len(), started.elapsed());
        debug!(agent, count = passages.len(), "turn retrieval");
        Ok(passages)
    }

    async fn validate(
        &self,
        kind: ValidationKind,
        player_command: &str,
        text: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
        progress: &mut TurnProgress,
    ) -> ValidationResult {
        let outcome = match &self.collaborators.validator {
            Some(validator) => {
                let started = Instant::now();
                let outcome = validator
                    .validate(ValidationRequest {
                        kind,
                        player_command,
                        text,
                        passages,
                        session,
                    })
                    .await;
                self.track(AgentRole::RulesReferee, outcome.is_ok(), started, progress);
                outcome
            }
            None => Err(CollaboratorError::Disabled("validator".to_string())),
        };
        if let Err(e) = &outcome {
            warn!(kind = ?kind, error = %e, "validation unavailable, approving");
        }
        ValidationResult::fail_open(outcome)
    }

    async fn plan(
        &self,
        player_command: &str,
        passages: &[RetrievalResult],
        validation: &ValidationResult,
        session: &SessionSnapshot,
        progress: &mut TurnProgress,
    ) -> ScenePlanOutput {
        let planned = match &self.collaborators.planner {
            Some(planner) => {
                let started = Instant::now();
                let outcome = planner
                    .plan(player_command, passages, validation, session)
                    .await;
                self.track(AgentRole::ScenePlanner, outcome.is_ok(), started, progress);
                outcome
            }
            None => Err(CollaboratorError::Disabled("planner".to_string())),
        };

        if !validation.approved {
            return ScenePlanOutput::disqualify(
                validation.reason.clone(),
                validation.suggestions.clone().unwrap_or_default(),
            );
        }

        let mut plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planning unavailable, narrating");
                ScenePlanOutput::narrate()
                    .with_reasoning(format!("Scene planning failed: {e}. Falling back to narrator."))
            }
        };

        // Only rejected validation may disqualify.
        if plan.next_action == NextAction::Disqualify {
            plan.next_action = NextAction::NarratorScene;
        }
        let has_target = plan
            .target
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if plan.next_action == NextAction::EngageNpc && !has_target {
            warn!("engage_npc plan without a target, narrating instead");
            plan.next_action = NextAction::NarratorScene;
        }
        if plan.next_action != NextAction::EngageNpc {
            plan.target = None;
        }
        plan.validation_status = "approved".to_string();
        plan
    }

    async fn persona_for(
        &self,
        session: &mut GameSession,
        npc: &str,
        progress: &mut TurnProgress,
        result: &mut TurnResult,
    ) -> Result<Persona, TurnError> {
        if let Some(persona) = session.persona(npc) {
            debug!(npc, "persona cache hit");
            self.metrics.record_persona_cache(true);
            result.metadata.persona_cache_hit = Some(true);
            return Ok(persona.clone());
        }
        self.metrics.record_persona_cache(false);
        result.metadata.persona_cache_hit = Some(false);

        self.enter(
            progress,
            TurnPhase::PersonaExtraction,
            Some(AgentRole::PersonaExtractor),
            format!("Building a persona for {npc}"),
        );
        let query = format!("{npc} character personality speaking style dialogue");
        let passages = self
            .retrieve(&query, self.persona_top_k, PERSONA_AGENT, progress)
            .await?;

        let persona = match &self.collaborators.persona_extractor {
            Some(extractor) => {
                let started = Instant::now();
                let outcome = extractor.extract(npc, &passages).await;
                self.track(AgentRole::PersonaExtractor, outcome.is_ok(), started, progress);
                match outcome {
                    Ok(persona) => persona.truncated(),
                    Err(e) => {
                        warn!(npc, error = %e, "persona extraction failed, using fallback");
                        Persona::fallback(npc)
                    }
                }
            }
            None => Persona::fallback(npc),
        };

        session.cache_persona(npc, persona.clone());
        info!(npc, "persona cached");
        Ok(persona)
    }

    fn finish_call(
        &self,
        role: AgentRole,
        outcome: Result<AgentOutput, CollaboratorError>,
        started: Instant,
        progress: &mut TurnProgress,
    ) -> Result<AgentOutput, TurnError> {
        self.track(role, outcome.is_ok(), started, progress);
        outcome.map_err(|source| TurnError::Collaborator { role, source })
    }

    fn track(&self, role: AgentRole, ok: bool, started: Instant, progress: &mut TurnProgress) {
        self.metrics.record_agent_call(role, ok, started.elapsed());
        if ok {
            progress.agents_completed.push(role);
        } else {
            progress.agents_failed.push(role);
        }
    }

    /// The player's command contradicted the corpus: the player loses.
    fn disqualify_command(
        &self,
        session: &mut GameSession,
        player_command: &str,
        validation: &ValidationResult,
        plan: &ScenePlanOutput,
        progress: &mut TurnProgress,
        result: &mut TurnResult,
    ) {
        session.record_loss();

        let mut message = format!(
            "Your action doesn't fit this world. {}",
            validation.reason.trim()
        );
        if !plan.alternative_suggestions.is_empty() {
            message.push_str("\n\nYou might instead:");
            for suggestion in &plan.alternative_suggestions {
                message.push_str(&format!("\n- {suggestion}"));
            }
        }
        let output = AgentOutput::new(message)
            .with_citations(validation.citations.clone())
            .with_reasoning(validation.reason.clone())
            .with_metadata("source", AgentRole::RulesReferee.as_str())
            .with_metadata("type", "user_prompt");

        session.set_last_validation(validation.clone());
        session.add_turn(
            Turn::new(result.turn_number, player_command).with_output(AgentRole::Narrator, output.clone()),
        );

        result.narrator_output = Some(output);
        result.outcome = TurnOutcome::PlayerLoses;
        result.turn_ended_early = true;
        result.metadata.disqualification_reason = Some(validation.reason.clone());
        result.metadata.alternative_suggestions = plan.alternative_suggestions.clone();

        info!(session_id = %session.session_id(), losses = session.losses(), "command disqualified");
        self.enter(
            progress,
            TurnPhase::Disqualified,
            None,
            "Command rejected by the rules referee",
        );
    }

    /// A collaborator contradicted the corpus: the player wins.
    #[allow(clippy::too_many_arguments)]
    fn disqualify_response(
        &self,
        session: &mut GameSession,
        player_command: &str,
        role: AgentRole,
        rejected: AgentOutput,
        validation: &ValidationResult,
        progress: &mut TurnProgress,
        result: &mut TurnResult,
    ) {
        session.record_win();

        let message = format!(
            "The story falters: that response contradicts the established facts. {} You win this round.",
            validation.reason.trim()
        );
        let output = AgentOutput::new(message)
            .with_citations(validation.citations.clone())
            .with_reasoning(validation.reason.clone())
            .with_metadata("source", AgentRole::RulesReferee.as_str())
            .with_metadata("type", "agent_response")
            .with_metadata("rejected_role", role.as_str());

        session.set_last_validation(validation.clone());
        session.add_turn(
            Turn::new(result.turn_number, player_command).with_output(AgentRole::Narrator, output.clone()),
        );

        result.narrator_output = Some(output);
        result.outcome = TurnOutcome::PlayerWins;
        result.turn_ended_early = true;
        result.metadata.disqualification_reason = Some(validation.reason.clone());
        result.metadata.original_agent_response = Some(rejected.content);

        info!(session_id = %session.session_id(), wins = session.wins(), "response disqualified");
        self.enter(
            progress,
            TurnPhase::Disqualified,
            None,
            format!("{role} response rejected by the rules referee"),
        );
    }
}

/// Command, current scene and the last two remembered commands.
fn user_query(session: &GameSession, player_command: &str) -> String {
    let mut parts = vec![player_command.to_string()];
    if let Some(scene) = &session.state().current_scene {
        parts.push(format!("Scene: {scene}"));
    }
    parts.extend(
        session
            .recent_commands(RECENT_COMMANDS_IN_QUERY)
            .into_iter()
            .map(String::from),
    );
    parts.join(" ")
}

fn chunk_refs(passages: &[RetrievalResult]) -> Vec<ChunkRef> {
    passages
        .iter()
        .map(|p| ChunkRef {
            chunk_id: p.chunk_id.clone(),
            score: p.score,
        })
        .collect()
}
