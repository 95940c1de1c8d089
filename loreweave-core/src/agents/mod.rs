//! Collaborators invoked by the turn machine.
//!
//! Each role has its own trait so the turn machine never looks agents up by
//! name. The `Llm*` types implement those traits on top of a
//! [`TextGenerator`](crate::generation::TextGenerator); tests plug in the
//! scripted doubles from [`crate::testing`].

mod dialogue;
mod narrator;
pub mod parse;
mod persona;
mod planner;
pub mod prompts;
mod validator;

pub use dialogue::LlmDialogueAgent;
pub use narrator::{LlmNarrator, SCENE_KEY};
pub use persona::LlmPersonaExtractor;
pub use planner::LlmPlanner;
pub use validator::LlmValidator;

use crate::generation::GenerationError;
use crate::retrieval::{Metadata, RetrievalResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors from a collaborator call.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Failed to parse collaborator response: {0}")]
    Parse(String),

    #[error("Collaborator disabled: {0}")]
    Disabled(String),
}

/// The collaborator roles that can contribute to a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    RulesReferee,
    ScenePlanner,
    PersonaExtractor,
    NpcManager,
    Narrator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::RulesReferee => "rules_referee",
            AgentRole::ScenePlanner => "scene_planner",
            AgentRole::PersonaExtractor => "persona_extractor",
            AgentRole::NpcManager => "npc_manager",
            AgentRole::Narrator => "narrator",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text produced by a generating collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub content: String,
    /// Chunk ids backing the content.
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AgentOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// How serious a validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Warning,
    Blocking,
}

/// Verdict of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub approved: bool,
    pub reason: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub relevant_chunks: Vec<String>,
    #[serde(default)]
    pub suggestions: Option<Vec<String>>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl ValidationResult {
    pub fn approve(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            relevant_chunks: Vec::new(),
            suggestions: None,
            citations: Vec::new(),
            severity: Severity::None,
        }
    }

    pub fn reject(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            approved: false,
            severity: Severity::Blocking,
            ..Self::approve(reason, confidence)
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.relevant_chunks = citations.clone();
        self.citations = citations;
        self
    }

    /// Reduce a validator outcome, approving when the validator failed.
    ///
    /// A failed or missing validator yields `approved = true` with zero
    /// confidence and the failure recorded in `reason`.
    pub fn fail_open(outcome: Result<ValidationResult, CollaboratorError>) -> Self {
        match outcome {
            Ok(result) => result,
            Err(e) => Self {
                severity: Severity::Warning,
                ..Self::approve(format!("Validation unavailable, approved by default: {e}"), 0.0)
            },
        }
    }
}

/// What the turn should do after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    EngageNpc,
    #[default]
    NarratorScene,
    Disqualify,
}

/// Routing decision from the planner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenePlanOutput {
    pub next_action: NextAction,
    /// NPC name; only meaningful for `EngageNpc`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub retrieval_quality: f64,
    #[serde(default)]
    pub validation_status: String,
    #[serde(default)]
    pub alternative_suggestions: Vec<String>,
    /// Scene the story moves to, if the planner decided on a transition.
    #[serde(default)]
    pub next_scene: Option<String>,
}

impl ScenePlanOutput {
    pub fn engage(npc: impl Into<String>) -> Self {
        Self {
            next_action: NextAction::EngageNpc,
            target: Some(npc.into()),
            ..Self::default()
        }
    }

    pub fn narrate() -> Self {
        Self::default()
    }

    /// A disqualification plan; nothing else from the planner survives.
    pub fn disqualify(reason: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self {
            next_action: NextAction::Disqualify,
            reasoning: reason.into(),
            validation_status: "rejected".to_string(),
            alternative_suggestions: suggestions,
            ..Self::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_next_scene(mut self, scene: impl Into<String>) -> Self {
        self.next_scene = Some(scene.into());
        self
    }
}

/// Character profile of an NPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub speaking_style: String,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub knowledge_areas: Vec<String>,
    #[serde(default)]
    pub dialogue_examples: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl Persona {
    pub const MAX_TRAITS: usize = 5;
    pub const MAX_KNOWLEDGE_AREAS: usize = 5;
    pub const MAX_DIALOGUE_EXAMPLES: usize = 3;

    /// Fallback profile when nothing could be extracted.
    pub fn fallback(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            background: format!("{name} is a character in this story."),
            name,
            speaking_style: "neutral and polite".to_string(),
            personality_traits: vec!["mysterious".to_string(), "knowledgeable".to_string()],
            knowledge_areas: vec!["general knowledge".to_string()],
            dialogue_examples: Vec::new(),
            citations: Vec::new(),
        }
    }

    /// Enforce the list caps.
    pub fn truncated(mut self) -> Self {
        self.personality_traits.truncate(Self::MAX_TRAITS);
        self.knowledge_areas.truncate(Self::MAX_KNOWLEDGE_AREAS);
        self.dialogue_examples.truncate(Self::MAX_DIALOGUE_EXAMPLES);
        self
    }

    /// Render for inclusion in a prompt.
    pub fn to_prompt(&self) -> String {
        let mut parts = Vec::new();
        if !self.speaking_style.is_empty() {
            parts.push(format!("Speaking Style: {}", self.speaking_style));
        }
        if !self.personality_traits.is_empty() {
            parts.push(format!(
                "Personality Traits: {}",
                self.personality_traits.join(", ")
            ));
        }
        if !self.background.is_empty() {
            parts.push(format!("Background: {}", self.background));
        }
        if !self.knowledge_areas.is_empty() {
            parts.push(format!("Knowledge Areas: {}", self.knowledge_areas.join(", ")));
        }
        if !self.dialogue_examples.is_empty() {
            let examples: Vec<String> = self
                .dialogue_examples
                .iter()
                .map(|e| format!("  - \"{e}\""))
                .collect();
            parts.push(format!("Dialogue Examples:\n{}", examples.join("\n")));
        }
        if parts.is_empty() {
            "No specific persona information available.".to_string()
        } else {
            parts.join("\n\n")
        }
    }
}

/// Read-only view of a session handed to collaborators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub turn_number: usize,
    pub current_scene: Option<String>,
    pub active_npcs: Vec<String>,
    pub initial_context: Option<String>,
    /// Rendered memory, empty at the start of a story.
    pub memory_context: String,
    /// Most recent player command, if any.
    pub last_command: Option<String>,
}

/// What is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    /// The player's command, before anything is generated.
    UserPrompt,
    /// Text generated by the given role.
    AgentResponse(AgentRole),
}

/// Input to a [`Validator`].
#[derive(Debug, Clone, Copy)]
pub struct ValidationRequest<'a> {
    pub kind: ValidationKind,
    pub player_command: &'a str,
    /// The text under judgement: the command itself, or the generated response.
    pub text: &'a str,
    pub passages: &'a [RetrievalResult],
    pub session: &'a SessionSnapshot,
}

/// Judges text against retrieved passages.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        request: ValidationRequest<'_>,
    ) -> Result<ValidationResult, CollaboratorError>;
}

/// Decides how a turn proceeds.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        player_command: &str,
        passages: &[RetrievalResult],
        validation: &ValidationResult,
        session: &SessionSnapshot,
    ) -> Result<ScenePlanOutput, CollaboratorError>;
}

/// Describes the scene.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(
        &self,
        player_command: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError>;
}

/// Speaks as an NPC.
#[async_trait]
pub trait DialogueAgent: Send + Sync {
    async fn respond(
        &self,
        npc: &str,
        persona: &Persona,
        player_command: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError>;
}

/// Builds a persona from passages about an NPC.
#[async_trait]
pub trait PersonaExtractor: Send + Sync {
    async fn extract(
        &self,
        npc: &str,
        passages: &[RetrievalResult],
    ) -> Result<Persona, CollaboratorError>;
}

/// The collaborators a turn machine is built with.
///
/// Validator, planner and persona extractor are optional: a missing validator
/// approves, a missing planner narrates, and a missing extractor yields the
/// fallback persona.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Option<Arc<dyn Validator>>,
    pub planner: Option<Arc<dyn Planner>>,
    pub narrator: Arc<dyn Narrator>,
    pub dialogue: Arc<dyn DialogueAgent>,
    pub persona_extractor: Option<Arc<dyn PersonaExtractor>>,
}

impl Collaborators {
    /// Start with the two required generating roles.
    pub fn new(narrator: Arc<dyn Narrator>, dialogue: Arc<dyn DialogueAgent>) -> Self {
        Self {
            validator: None,
            planner: None,
            narrator,
            dialogue,
            persona_extractor: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_persona_extractor(mut self, extractor: Arc<dyn PersonaExtractor>) -> Self {
        self.persona_extractor = Some(extractor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_open_approves_with_zero_confidence() {
        let reduced = ValidationResult::fail_open(Err(CollaboratorError::Parse("bad".into())));
        assert!(reduced.approved);
        assert_eq!(reduced.confidence, 0.0);
        assert!(reduced.reason.contains("bad"));
    }

    #[test]
    fn test_fail_open_passes_results_through() {
        let rejected = ValidationResult::reject("not in this world", 0.9);
        assert_eq!(ValidationResult::fail_open(Ok(rejected.clone())), rejected);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(ValidationResult::approve("ok", 3.0).confidence, 1.0);
    }

    #[test]
    fn test_persona_truncation_and_prompt() {
        let mut persona = Persona::fallback("Gandalf");
        persona.personality_traits = (0..8).map(|i| format!("trait{i}")).collect();
        let persona = persona.truncated();
        assert_eq!(persona.personality_traits.len(), Persona::MAX_TRAITS);

        let prompt = persona.to_prompt();
        assert!(prompt.contains("Speaking Style: neutral and polite"));
        assert!(prompt.contains("Background: Gandalf is a character in this story."));
    }

    #[test]
    fn test_next_action_wire_names() {
        let plan: ScenePlanOutput =
            serde_json::from_str(r#"{"next_action": "engage_npc", "target": "Gandalf"}"#).unwrap();
        assert_eq!(plan.next_action, NextAction::EngageNpc);
        assert_eq!(plan.target.as_deref(), Some("Gandalf"));
        assert_eq!(AgentRole::NpcManager.to_string(), "npc_manager");
    }
}
