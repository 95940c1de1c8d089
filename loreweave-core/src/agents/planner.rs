use super::parse::parse_json;
use super::{
    prompts, CollaboratorError, NextAction, Planner, ScenePlanOutput, SessionSnapshot,
    ValidationResult,
};
use crate::generation::TextGenerator;
use crate::retrieval::RetrievalResult;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

static PROPER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("valid regex"));

const COMMON_WORDS: &[&str] = &["I", "You", "He", "She", "They", "We", "The", "A", "An"];

#[derive(Debug, Deserialize)]
struct PlanWire {
    #[serde(default)]
    next_action: Option<String>,
    #[serde(default)]
    target: Option<String>,
    // Older prompt format.
    #[serde(default)]
    npc_responds: Option<bool>,
    #[serde(default)]
    responding_npc: Option<String>,
    #[serde(default)]
    next_scene: Option<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    retrieval_quality: Option<f64>,
}

/// Capitalized names in `command`, minus pronouns and articles, at most three.
pub(crate) fn mentioned_names(command: &str) -> Vec<String> {
    PROPER_NAME
        .find_iter(command)
        .map(|m| m.as_str().to_string())
        .filter(|name| !COMMON_WORDS.contains(&name.as_str()))
        .take(3)
        .collect()
}

/// Mean passage score, clamped to `[0, 1]`.
fn passage_quality(passages: &[RetrievalResult]) -> f64 {
    if passages.is_empty() {
        return 0.0;
    }
    let mean = passages.iter().map(|p| p.score).sum::<f64>() / passages.len() as f64;
    mean.clamp(0.0, 1.0)
}

/// Planner that asks a text generator for a JSON routing decision.
pub struct LlmPlanner {
    generator: Arc<dyn TextGenerator>,
}

impl LlmPlanner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn from_wire(wire: PlanWire, passages: &[RetrievalResult]) -> ScenePlanOutput {
        let target = wire
            .target
            .or(wire.responding_npc)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null"));

        let next_action = match wire.next_action.as_deref() {
            Some("engage_npc") => NextAction::EngageNpc,
            Some("disqualify") => NextAction::Disqualify,
            Some(_) => NextAction::NarratorScene,
            None if wire.npc_responds == Some(true) => NextAction::EngageNpc,
            None => NextAction::NarratorScene,
        };

        ScenePlanOutput {
            next_action,
            target: if next_action == NextAction::EngageNpc { target } else { None },
            reasoning: wire.reasoning,
            retrieval_quality: wire
                .retrieval_quality
                .unwrap_or_else(|| passage_quality(passages))
                .clamp(0.0, 1.0),
            validation_status: "approved".to_string(),
            alternative_suggestions: Vec::new(),
            next_scene: wire.next_scene.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Route to an NPC named in the command who also appears in the passages.
    fn heuristic_plan(command: &str, passages: &[RetrievalResult]) -> ScenePlanOutput {
        let npc = mentioned_names(command)
            .into_iter()
            .find(|name| passages.iter().any(|p| p.chunk_text.contains(name.as_str())));

        let plan = match npc {
            Some(npc) => ScenePlanOutput::engage(npc),
            None => ScenePlanOutput::narrate(),
        };
        ScenePlanOutput {
            retrieval_quality: passage_quality(passages),
            validation_status: "approved".to_string(),
            ..plan
        }
        .with_reasoning("Plan inferred from names in the player command.")
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        player_command: &str,
        passages: &[RetrievalResult],
        _validation: &ValidationResult,
        session: &SessionSnapshot,
    ) -> Result<ScenePlanOutput, CollaboratorError> {
        let prompt = prompts::planner_user(player_command, passages, session);
        let response = self
            .generator
            .generate(&prompt, Some(prompts::PLANNER_SYSTEM))
            .await?;

        let plan = match parse_json::<PlanWire>(&response) {
            Ok(wire) => Self::from_wire(wire, passages),
            Err(e) => {
                warn!(error = %e, "planner returned unparseable plan, using name heuristic");
                Self::heuristic_plan(player_command, passages)
            }
        };
        debug!(action = ?plan.next_action, target = ?plan.target, "scene plan");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    fn passages() -> Vec<RetrievalResult> {
        vec![RetrievalResult::new(
            "c1",
            "Gandalf the Grey smoked his pipe in Bag End.",
            0.6,
        )]
    }

    async fn plan_with(response: &str, command: &str) -> ScenePlanOutput {
        let planner = LlmPlanner::new(Arc::new(ScriptedGenerator::new(vec![Ok(
            response.to_string(),
        )])));
        planner
            .plan(
                command,
                &passages(),
                &ValidationResult::approve("ok", 1.0),
                &SessionSnapshot::default(),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_mentioned_names_skips_common_words() {
        assert_eq!(
            mentioned_names("I ask Gandalf about The Shire"),
            vec!["Gandalf".to_string(), "Shire".to_string()]
        );
    }

    #[tokio::test]
    async fn test_json_plan() {
        let plan = plan_with(
            r#"{"next_action": "engage_npc", "target": "Gandalf", "reasoning": "He is here [1]", "retrieval_quality": 0.7, "next_scene": null}"#,
            "talk to Gandalf",
        )
        .await;
        assert_eq!(plan.next_action, NextAction::EngageNpc);
        assert_eq!(plan.target.as_deref(), Some("Gandalf"));
        assert_eq!(plan.retrieval_quality, 0.7);
    }

    #[tokio::test]
    async fn test_legacy_plan_fields() {
        let plan = plan_with(
            r#"{"npc_responds": true, "responding_npc": "Gandalf", "next_scene": "Bag End"}"#,
            "hello",
        )
        .await;
        assert_eq!(plan.next_action, NextAction::EngageNpc);
        assert_eq!(plan.target.as_deref(), Some("Gandalf"));
        assert_eq!(plan.next_scene.as_deref(), Some("Bag End"));
    }

    #[tokio::test]
    async fn test_narrator_plan_drops_target() {
        let plan = plan_with(
            r#"{"next_action": "narrator_scene", "target": "Gandalf"}"#,
            "look around",
        )
        .await;
        assert_eq!(plan.next_action, NextAction::NarratorScene);
        assert_eq!(plan.target, None);
    }

    #[tokio::test]
    async fn test_unparseable_plan_uses_mentioned_names() {
        let plan = plan_with("Gandalf should answer.", "I greet Gandalf").await;
        assert_eq!(plan.next_action, NextAction::EngageNpc);
        assert_eq!(plan.target.as_deref(), Some("Gandalf"));

        let plan = plan_with("no idea", "I greet Radagast").await;
        assert_eq!(plan.next_action, NextAction::NarratorScene);
    }
}
