use super::parse::{cited_chunk_ids, parse_json};
use super::{
    prompts, CollaboratorError, Severity, ValidationKind, ValidationRequest, ValidationResult,
    Validator,
};
use crate::config::ValidationMode;
use crate::generation::TextGenerator;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

const NO_FACTS: &str = "No relevant facts found in corpus to contradict this action.";

/// Default confidence when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Wire format of the validator's JSON verdict.
#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default = "approve_by_default")]
    approved: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    suggested_alternative: Option<String>,
}

fn approve_by_default() -> bool {
    true
}

/// Referee that asks a text generator to judge text against passages.
pub struct LlmValidator {
    generator: Arc<dyn TextGenerator>,
    mode: ValidationMode,
}

impl LlmValidator {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            mode: ValidationMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    fn parse(&self, response: &str, request: &ValidationRequest<'_>) -> ValidationResult {
        match parse_json::<Verdict>(response) {
            Ok(verdict) => {
                let citations = cited_chunk_ids(&verdict.reason, request.passages);
                let confidence = verdict.confidence.unwrap_or(DEFAULT_CONFIDENCE);
                let mut result = if verdict.approved {
                    ValidationResult::approve(verdict.reason, confidence)
                } else {
                    ValidationResult::reject(verdict.reason, confidence)
                }
                .with_citations(citations);
                if let Some(severity) = verdict.severity {
                    result.severity = severity;
                }
                if let Some(alternative) = verdict.suggested_alternative.filter(|a| !a.is_empty()) {
                    result = result.with_suggestions(vec![alternative]);
                }
                result
            }
            Err(e) => {
                warn!(error = %e, "validator returned unparseable verdict, reading keywords");
                let lower = response.to_lowercase();
                let rejected = ["reject", "not allowed", "contradiction"]
                    .iter()
                    .any(|k| lower.contains(k));
                let reason = response.trim().to_string();
                let result = if rejected {
                    ValidationResult::reject(reason, 0.5)
                } else {
                    ValidationResult::approve(reason, 0.5)
                };
                result.with_citations(cited_chunk_ids(response, request.passages))
            }
        }
    }
}

#[async_trait]
impl Validator for LlmValidator {
    async fn validate(
        &self,
        request: ValidationRequest<'_>,
    ) -> Result<ValidationResult, CollaboratorError> {
        if request.passages.is_empty() {
            return Ok(ValidationResult::approve(NO_FACTS, 1.0));
        }

        let prompt = match request.kind {
            ValidationKind::UserPrompt => {
                prompts::validate_command_user(request.player_command, request.passages, request.session)
            }
            ValidationKind::AgentResponse(role) => prompts::validate_response_user(
                role.as_str(),
                request.player_command,
                request.text,
                request.passages,
                request.session,
            ),
        };
        let system = prompts::validator_system(self.mode);
        let response = self.generator.generate(&prompt, Some(&system)).await?;

        let result = self.parse(&response, &request);
        debug!(
            kind = ?request.kind,
            approved = result.approved,
            confidence = result.confidence,
            citations = result.citations.len(),
            "validation verdict"
        );
        Ok(result)
    }
}
