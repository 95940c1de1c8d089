use super::parse::{cited_chunk_ids, clean_response, parse_sections};
use super::{prompts, AgentOutput, CollaboratorError, DialogueAgent, Persona, SessionSnapshot};
use crate::generation::TextGenerator;
use crate::retrieval::RetrievalResult;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Speaks as an NPC through a text generator.
pub struct LlmDialogueAgent {
    generator: Arc<dyn TextGenerator>,
}

impl LlmDialogueAgent {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn parse(
        response: &str,
        npc: &str,
        persona: &Persona,
        passages: &[RetrievalResult],
    ) -> AgentOutput {
        let mut sections = parse_sections(response);
        let (dialogue, reasoning) = if sections.is_empty() {
            (response.to_string(), format!("Response as {npc}"))
        } else {
            (
                sections.remove("dialogue").unwrap_or_else(|| response.to_string()),
                sections.remove("reasoning").unwrap_or_default(),
            )
        };
        let dialogue = clean_response(&dialogue);

        let mut citations = cited_chunk_ids(&format!("{dialogue} {reasoning}"), passages);
        for id in &persona.citations {
            if !citations.contains(id) {
                citations.push(id.clone());
            }
        }

        AgentOutput::new(dialogue)
            .with_citations(citations)
            .with_reasoning(reasoning)
            .with_metadata("npc_name", npc)
            .with_metadata(
                "persona_used",
                json!({
                    "speaking_style": persona.speaking_style,
                    "traits": persona.personality_traits,
                }),
            )
    }
}

#[async_trait]
impl DialogueAgent for LlmDialogueAgent {
    async fn respond(
        &self,
        npc: &str,
        persona: &Persona,
        player_command: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError> {
        let system = prompts::dialogue_system(npc, persona);
        let prompt = prompts::dialogue_user(npc, player_command, passages, session);
        let response = self.generator.generate(&prompt, Some(&system)).await?;

        let output = Self::parse(&response, npc, persona, passages);
        if output.content.is_empty() {
            return Err(CollaboratorError::Parse(format!("{npc} produced no dialogue")));
        }
        debug!(npc, citations = output.citations.len(), "dialogue generated");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    #[tokio::test]
    async fn test_dialogue_sections_and_persona_citations() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(
            "DIALOGUE: A wizard is never late [1].\nREASONING: Quoted from [1].".to_string(),
        )]));
        let agent = LlmDialogueAgent::new(generator);
        let mut persona = Persona::fallback("Gandalf");
        persona.citations = vec!["persona_chunk".to_string()];
        let passages = vec![RetrievalResult::new("c1", "A wizard is never late.", 1.0)];

        let output = agent
            .respond("Gandalf", &persona, "You are late!", &passages, &SessionSnapshot::default())
            .await
            .unwrap();
        assert_eq!(output.content, "A wizard is never late [1].");
        assert_eq!(output.citations, vec!["c1", "persona_chunk"]);
        assert_eq!(output.metadata["npc_name"], "Gandalf");
    }

    #[test]
    fn test_unsectioned_reply_is_dialogue() {
        let output = LlmDialogueAgent::parse(
            "Fly, you fools!",
            "Gandalf",
            &Persona::fallback("Gandalf"),
            &[],
        );
        assert_eq!(output.content, "Fly, you fools!");
        assert_eq!(output.reasoning, "Response as Gandalf");
    }
}
