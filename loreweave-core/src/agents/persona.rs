use super::parse::{extract_citation_markers, map_citations, parse_json};
use super::{prompts, CollaboratorError, Persona, PersonaExtractor};
use crate::generation::TextGenerator;
use crate::retrieval::RetrievalResult;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

static STYLE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)speaking style[:\s]+([^.\n]+)").expect("valid regex"));
static TRAITS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)personality traits?[:\s]+([^.\n]+)").expect("valid regex"));
static BACKGROUND_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)background[:\s]+([^\n]+)").expect("valid regex"));
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"\n]{8,})""#).expect("valid regex"));

/// Builds personas by asking a text generator to summarize passages.
pub struct LlmPersonaExtractor {
    generator: Arc<dyn TextGenerator>,
}

impl LlmPersonaExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn string_list(value: Option<&Value>) -> Vec<String> {
        match value {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    fn citations(value: Option<&Value>, passages: &[RetrievalResult]) -> Vec<String> {
        let markers: Vec<usize> = Self::string_list(value)
            .iter()
            .flat_map(|m| extract_citation_markers(m).into_iter().chain(m.parse().ok()))
            .collect();
        if markers.is_empty() {
            passages.iter().map(|p| p.chunk_id.clone()).collect()
        } else {
            map_citations(&markers, passages)
        }
    }

    fn from_json(npc: &str, data: &Map<String, Value>, passages: &[RetrievalResult]) -> Persona {
        let text = |key: &str, default: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        Persona {
            name: npc.to_string(),
            speaking_style: text("speaking_style", "neutral"),
            personality_traits: Self::string_list(data.get("personality_traits")),
            background: text("background", "Unknown background"),
            knowledge_areas: Self::string_list(data.get("knowledge_areas")),
            dialogue_examples: Self::string_list(data.get("dialogue_examples")),
            citations: Self::citations(data.get("citations"), passages),
        }
        .truncated()
    }

    /// Best-effort reading of a prose answer.
    fn from_text(npc: &str, text: &str, passages: &[RetrievalResult]) -> Persona {
        let mut persona = Persona::fallback(npc);
        if let Some(style) = STYLE_LINE.captures(text) {
            persona.speaking_style = style[1].trim().to_string();
        }
        if let Some(traits) = TRAITS_LINE.captures(text) {
            persona.personality_traits = traits[1]
                .split([',', ';'])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(background) = BACKGROUND_LINE.captures(text) {
            persona.background = background[1].trim().to_string();
        }
        persona.dialogue_examples = QUOTED
            .captures_iter(text)
            .map(|c| c[1].trim().to_string())
            .collect();

        let markers = extract_citation_markers(text);
        persona.citations = if markers.is_empty() {
            passages.iter().map(|p| p.chunk_id.clone()).collect()
        } else {
            map_citations(&markers, passages)
        };
        persona.truncated()
    }
}

#[async_trait]
impl PersonaExtractor for LlmPersonaExtractor {
    async fn extract(
        &self,
        npc: &str,
        passages: &[RetrievalResult],
    ) -> Result<Persona, CollaboratorError> {
        if passages.is_empty() {
            warn!(npc, "no passages for persona, using fallback profile");
            return Ok(Persona::fallback(npc));
        }

        let prompt = prompts::persona_user(npc, passages);
        let response = self
            .generator
            .generate(&prompt, Some(prompts::PERSONA_SYSTEM))
            .await?;

        let persona = match parse_json::<Map<String, Value>>(&response) {
            Ok(data) => Self::from_json(npc, &data, passages),
            Err(e) => {
                warn!(npc, error = %e, "persona JSON unparseable, reading prose");
                Self::from_text(npc, &response, passages)
            }
        };
        info!(
            npc,
            traits = persona.personality_traits.len(),
            citations = persona.citations.len(),
            "persona extracted"
        );
        Ok(persona)
    }
}
