//! Text generation seam shared by agents and the query rewriter.

use crate::config::AgentSettings;
use async_trait::async_trait;
use llm::{Message, Request};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from a text generation backend.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation backend error: {0}")]
    Backend(#[from] llm::Error),

    #[error("Generation failed: {0}")]
    Failed(String),
}

/// Something that turns a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, GenerationError>;
}

#[async_trait]
impl TextGenerator for llm::Client {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, GenerationError> {
        Ok(llm::Client::generate(self, prompt, system_prompt).await?)
    }
}

/// A shared client with per-role sampling settings.
#[derive(Debug, Clone)]
pub struct TunedGenerator {
    client: Arc<llm::Client>,
    temperature: f32,
    max_tokens: usize,
}

impl TunedGenerator {
    pub fn new(client: Arc<llm::Client>, settings: &AgentSettings) -> Self {
        Self {
            client,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

#[async_trait]
impl TextGenerator for TunedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, GenerationError> {
        let mut request = Request::new(vec![Message::user(prompt)])
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);
        if let Some(system) = system_prompt {
            request = request.with_system(system);
        }
        let response = self.client.complete(request).await?;
        debug!(
            model = %response.model,
            chars = response.text.len(),
            "generation completed"
        );
        if response.text.trim().is_empty() {
            return Err(GenerationError::Failed("empty response".to_string()));
        }
        Ok(response.text)
    }
}
