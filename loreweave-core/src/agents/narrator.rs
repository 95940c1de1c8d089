use super::parse::{cited_chunk_ids, clean_response, parse_sections};
use super::{prompts, AgentOutput, CollaboratorError, Narrator, SessionSnapshot};
use crate::generation::TextGenerator;
use crate::retrieval::RetrievalResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Metadata key carrying the scene the narration moved the player to.
pub const SCENE_KEY: &str = "scene";

/// Narrator backed by a text generator.
pub struct LlmNarrator {
    generator: Arc<dyn TextGenerator>,
}

impl LlmNarrator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn parse(response: &str, passages: &[RetrievalResult]) -> AgentOutput {
        let mut sections = parse_sections(response);
        let content = match sections.remove("description") {
            Some(description) if !description.is_empty() => clean_response(&description),
            _ => clean_response(response),
        };
        let reasoning = sections.remove("reasoning").unwrap_or_default();
        let scene = sections
            .remove("scene")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"));

        let citations = cited_chunk_ids(&format!("{content}\n{reasoning}"), passages);
        let mut output = AgentOutput::new(content)
            .with_citations(citations)
            .with_reasoning(reasoning);
        if let Some(scene) = scene {
            output = output.with_metadata(SCENE_KEY, scene);
        }
        output
    }
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn narrate(
        &self,
        player_command: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError> {
        let prompt = prompts::narrator_user(player_command, passages, session);
        let response = self
            .generator
            .generate(&prompt, Some(prompts::NARRATOR_SYSTEM))
            .await?;
        let output = Self::parse(&response, passages);
        if output.content.is_empty() {
            return Err(CollaboratorError::Parse("narrator produced no description".into()));
        }
        debug!(citations = output.citations.len(), "narration generated");
        Ok(output)
    }
}
