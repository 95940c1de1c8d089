//! Turn phases, progress reports and results.

use crate::agents::{AgentOutput, AgentRole, ScenePlanOutput, ValidationResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Started,
    UserRetrieval,
    UserValidation,
    ScenePlanning,
    PersonaExtraction,
    NpcResponse,
    NarratorScene,
    AgentRetrieval,
    AgentValidation,
    UpdatingState,
    Completed,
    Disqualified,
    Error,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Started => "started",
            TurnPhase::UserRetrieval => "user_retrieval",
            TurnPhase::UserValidation => "user_validation",
            TurnPhase::ScenePlanning => "scene_planning",
            TurnPhase::PersonaExtraction => "persona_extraction",
            TurnPhase::NpcResponse => "npc_response",
            TurnPhase::NarratorScene => "narrator_scene",
            TurnPhase::AgentRetrieval => "agent_retrieval",
            TurnPhase::AgentValidation => "agent_validation",
            TurnPhase::UpdatingState => "updating_state",
            TurnPhase::Completed => "completed",
            TurnPhase::Disqualified => "disqualified",
            TurnPhase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnPhase::Completed | TurnPhase::Disqualified | TurnPhase::Error
        )
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a running turn, reported at every phase change.
#[derive(Debug, Clone, Serialize)]
pub struct TurnProgress {
    pub turn_number: usize,
    pub session_id: String,
    pub phase: TurnPhase,
    pub current_agent: Option<AgentRole>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retrieval_calls: usize,
    pub agents_completed: Vec<AgentRole>,
    pub agents_failed: Vec<AgentRole>,
    pub error: Option<String>,
}

impl TurnProgress {
    pub fn new(session_id: impl Into<String>, turn_number: usize) -> Self {
        Self {
            turn_number,
            session_id: session_id.into(),
            phase: TurnPhase::Started,
            current_agent: None,
            message: format!("Starting turn {turn_number}"),
            timestamp: Utc::now(),
            retrieval_calls: 0,
            agents_completed: Vec::new(),
            agents_failed: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn enter(
        &mut self,
        phase: TurnPhase,
        agent: Option<AgentRole>,
        message: impl Into<String>,
    ) {
        self.phase = phase;
        self.current_agent = agent;
        self.message = message.into();
        self.timestamp = Utc::now();
    }
}

/// Receives progress updates. Must not block.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &TurnProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&TurnProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &TurnProgress) {
        self(progress)
    }
}

/// A retrieved chunk as recorded in turn metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub score: f64,
}

/// Bookkeeping recorded with every turn result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetadata {
    pub timestamp: Option<DateTime<Utc>>,
    pub retrieval_calls: usize,
    pub user_chunks: Vec<ChunkRef>,
    pub agent_chunks: Vec<ChunkRef>,
    pub agents_executed: Vec<AgentRole>,
    /// Whether the NPC persona came from the session cache; `None` when no NPC spoke.
    pub persona_cache_hit: Option<bool>,
    pub disqualification_reason: Option<String>,
    pub alternative_suggestions: Vec<String>,
    /// The response that was disqualified, when the player wins.
    pub original_agent_response: Option<String>,
}

/// What the player won or lost this turn, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    #[default]
    Continue,
    PlayerWins,
    PlayerLoses,
}

/// Everything a turn produced.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub turn_number: usize,
    pub session_id: String,
    pub player_command: String,
    pub user_validation: Option<ValidationResult>,
    pub scene_plan: Option<ScenePlanOutput>,
    pub narrator_output: Option<AgentOutput>,
    pub npc_output: Option<AgentOutput>,
    /// Name of the NPC that spoke.
    pub npc_name: Option<String>,
    pub agent_validation: Option<ValidationResult>,
    pub outcome: TurnOutcome,
    pub turn_ended_early: bool,
    pub success: bool,
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub metadata: TurnMetadata,
}

impl TurnResult {
    pub(crate) fn new(session_id: &str, turn_number: usize, player_command: &str) -> Self {
        Self {
            turn_number,
            session_id: session_id.to_string(),
            player_command: player_command.to_string(),
            user_validation: None,
            scene_plan: None,
            narrator_output: None,
            npc_output: None,
            npc_name: None,
            agent_validation: None,
            outcome: TurnOutcome::Continue,
            turn_ended_early: false,
            success: true,
            error: None,
            duration: Duration::ZERO,
            metadata: TurnMetadata::default(),
        }
    }

    pub fn player_wins(&self) -> bool {
        self.outcome == TurnOutcome::PlayerWins
    }

    pub fn player_loses(&self) -> bool {
        self.outcome == TurnOutcome::PlayerLoses
    }

    /// Text shown to the player: the NPC reply if one spoke, otherwise the narration.
    pub fn display_text(&self) -> Option<&str> {
        self.npc_output
            .as_ref()
            .or(self.narrator_output.as_ref())
            .map(|o| o.content.as_str())
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(TurnPhase::Completed.is_terminal());
        assert!(TurnPhase::Disqualified.is_terminal());
        assert!(!TurnPhase::AgentValidation.is_terminal());
        assert_eq!(TurnPhase::NpcResponse.to_string(), "npc_response");
    }

    #[test]
    fn test_outcome_flags_are_exclusive() {
        let mut result = TurnResult::new("s", 1, "look");
        assert!(!result.player_wins() && !result.player_loses());
        result.outcome = TurnOutcome::PlayerWins;
        assert!(result.player_wins() && !result.player_loses());
    }

    #[test]
    fn test_result_serializes_duration_as_seconds() {
        let mut result = TurnResult::new("s", 1, "look");
        result.duration = Duration::from_millis(1500);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1.5);
        assert_eq!(json["outcome"], "continue");
    }
}
