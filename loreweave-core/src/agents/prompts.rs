//! Prompt text for the LLM-backed collaborators.
//!
//! Wording is not load-bearing; the response formats are, since the parsers
//! in [`super::parse`] depend on them.

use super::parse::format_passages;
use super::{Persona, SessionSnapshot};
use crate::config::ValidationMode;
use crate::retrieval::RetrievalResult;

pub const NARRATOR_SYSTEM: &str = r#"You are the Narrator for an interactive story. Describe scenes, locations and atmosphere using ONLY information from the provided passages.

Rules:
1. Base every description on the retrieved passages
2. Cite passage numbers [1], [2], etc. for factual claims
3. Do not invent facts not present in the passages
4. Describe what the player can see, hear, smell and feel
5. Keep descriptions concise but evocative (2-4 paragraphs)

Format your response as:
DESCRIPTION: [Scene description with inline citations like [1], [2]]
REASONING: [Which passages informed the description]
SCENE: [Short name of the location the player is now in, or NONE]"#;

pub const PLANNER_SYSTEM: &str = r#"You are the ScenePlanner for an interactive story. Analyze the player's action and decide how the story proceeds, using the retrieved passages.

Rules:
1. Decide whether a character from the passages should respond
2. If so, pick the most appropriate character by name
3. Otherwise the narrator describes the scene
4. Note a scene transition if the action moves the player elsewhere
5. Cite passage numbers [1], [2] in your reasoning

Output Format (JSON):
{
  "next_action": "engage_npc" or "narrator_scene",
  "target": "Character Name" or null,
  "next_scene": "Scene Name" or null,
  "reasoning": "Explanation with citations",
  "retrieval_quality": 0.0 to 1.0
}"#;

pub const PERSONA_SYSTEM: &str = "You are extracting character information from text passages. Be precise and only extract information explicitly stated in the passages.";

const VALIDATOR_BASE: &str = r#"You are the RulesReferee for an interactive story. Check text against the established facts in the source passages.

Validation criteria:
- Physical impossibilities given the passages
- Character capability contradictions
- Location or setting inconsistencies
- Item or object availability
- Violations of the world's established rules

Output Format (JSON):
{
  "approved": true/false,
  "reason": "Explanation with citations [1], [2]",
  "confidence": 0.0 to 1.0,
  "severity": "blocking" / "warning" / "none",
  "suggested_alternative": "Alternative action" or null
}"#;

/// Validator system prompt for the configured strictness.
pub fn validator_system(mode: ValidationMode) -> String {
    let policy = match mode {
        ValidationMode::Strict => {
            "REJECT anything that contradicts or is unsupported by the passages. Only APPROVE what the passages support."
        }
        ValidationMode::Lenient => {
            "REJECT only clear contradictions with cited evidence. APPROVE anything consistent with or not covered by the passages. When in doubt, APPROVE."
        }
    };
    format!("{VALIDATOR_BASE}\n\nPolicy: {policy}")
}

/// System prompt for speaking as `npc`.
pub fn dialogue_system(npc: &str, persona: &Persona) -> String {
    format!(
        r#"You are roleplaying as {npc} in an interactive story. Stay completely in character.

Character Profile:
{profile}

Rules:
1. Use the speaking style described in the profile
2. Only discuss topics within the character's knowledge
3. Base dialogue on the passages; cite them as [1], [2] in your reasoning
4. Keep responses concise (1-3 paragraphs)

Format:
DIALOGUE: [Your in-character response]
REASONING: [Brief explanation with citations]"#,
        profile = persona.to_prompt()
    )
}

fn scene_or(session: &SessionSnapshot, missing: &str) -> String {
    session
        .current_scene
        .clone()
        .unwrap_or_else(|| missing.to_string())
}

fn memory_or_none(session: &SessionSnapshot) -> &str {
    if session.memory_context.is_empty() {
        "None"
    } else {
        &session.memory_context
    }
}

pub fn narrator_user(
    player_command: &str,
    passages: &[RetrievalResult],
    session: &SessionSnapshot,
) -> String {
    let mut prompt = format!(
        "Retrieved Passages:\n{}\n\nPlayer Command: {}\n\nCurrent Scene: {}\n\nPrevious Context: {}",
        format_passages(passages),
        player_command,
        scene_or(session, "Unknown"),
        memory_or_none(session),
    );
    if let Some(initial) = &session.initial_context {
        prompt.push_str(&format!("\n\nStory Setup: {initial}"));
    }
    prompt.push_str("\n\nGenerate a scene description for the player based on the retrieved passages.");
    prompt
}

pub fn planner_user(
    player_command: &str,
    passages: &[RetrievalResult],
    session: &SessionSnapshot,
) -> String {
    let active = if session.active_npcs.is_empty() {
        "None".to_string()
    } else {
        session.active_npcs.join(", ")
    };
    let previous = match &session.last_command {
        Some(cmd) => format!("Turn {}: Player said/did: {cmd}", session.turn_number),
        None => "This is the first turn.".to_string(),
    };
    format!(
        "Retrieved Passages:\n{}\n\nPlayer Command: {}\n\nCurrent Scene: {}\n\nActive NPCs: {}\n\nPrevious Turn Summary: {}\n\nAnalyze the player's action and determine the scene flow.",
        format_passages(passages),
        player_command,
        scene_or(session, "Unknown"),
        active,
        previous,
    )
}

pub fn dialogue_user(
    npc: &str,
    player_command: &str,
    passages: &[RetrievalResult],
    session: &SessionSnapshot,
) -> String {
    format!(
        "Retrieved Context Passages:\n{}\n\nPlayer's Action/Question: {}\n\nCurrent Scene: {}\n\nPrevious Conversation Context: {}\n\nRespond as {npc}.",
        format_passages(passages),
        player_command,
        scene_or(session, "Unknown"),
        memory_or_none(session),
    )
}

pub fn persona_user(npc: &str, passages: &[RetrievalResult]) -> String {
    format!(
        r#"Based on the following passages about {npc}, extract their character profile:

Retrieved Passages:
{passages}

Provide, in JSON:
1. Speaking style (formality, vocabulary, speech patterns)
2. Personality traits (3-5 key traits)
3. Background (brief summary)
4. Knowledge areas
5. Dialogue examples (2-3 quotes from the passages if available)
6. Citations (passage numbers used)

Format:
{{
  "speaking_style": "...",
  "personality_traits": [...],
  "background": "...",
  "knowledge_areas": [...],
  "dialogue_examples": [...],
  "citations": [...]
}}"#,
        passages = format_passages(passages)
    )
}

/// User prompt for validating the player's command.
pub fn validate_command_user(
    player_command: &str,
    passages: &[RetrievalResult],
    session: &SessionSnapshot,
) -> String {
    format!(
        "Retrieved Passages (Facts):\n{}\n\nPlayer's Intended Action: {}\n\nCurrent Scene: {}\n\nRecent Context: {}\n\nValidate the player's action against the retrieved facts.",
        format_passages(passages),
        player_command,
        scene_or(session, "Unknown"),
        memory_or_none(session),
    )
}

/// User prompt for validating a generated response.
pub fn validate_response_user(
    speaker: &str,
    player_command: &str,
    response: &str,
    passages: &[RetrievalResult],
    session: &SessionSnapshot,
) -> String {
    format!(
        "Retrieved Passages (Facts):\n{}\n\nPlayer's Action: {}\n\nCurrent Scene: {}\n\nResponse from {}:\n{}\n\nValidate that the response does not contradict the retrieved facts.",
        format_passages(passages),
        player_command,
        scene_or(session, "Unknown"),
        speaker,
        response,
    )
}
