//! Minimal multi-provider LLM client.
//!
//! This crate provides a focused client for chat completions and embeddings
//! against three backends:
//! - Anthropic Messages API
//! - OpenAI-compatible chat/embeddings APIs
//! - A local Ollama server
//!
//! The provider is resolved once when the [`Client`] is built. Every request
//! afterwards goes straight to that backend.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OLLAMA_API_BASE: &str = "http://localhost:11434";

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";
const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_OLLAMA_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Errors that can occur when using the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The backend a [`Client`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl Provider {
    /// Default chat model for this provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            Provider::OpenAi => DEFAULT_OPENAI_MODEL,
            Provider::Ollama => DEFAULT_OLLAMA_MODEL,
        }
    }

    /// Default embedding model, if the provider offers embeddings.
    pub fn default_embedding_model(&self) -> Option<&'static str> {
        match self {
            Provider::Anthropic => None,
            Provider::OpenAi => Some(DEFAULT_OPENAI_EMBEDDING_MODEL),
            Provider::Ollama => Some(DEFAULT_OLLAMA_EMBEDDING_MODEL),
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Anthropic => ANTHROPIC_API_BASE,
            Provider::OpenAi => OPENAI_API_BASE,
            Provider::Ollama => OLLAMA_API_BASE,
        }
    }

    fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Ollama => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            other => Err(Error::Config(format!("Unknown provider: {other}"))),
        }
    }
}

fn provider_from_env(var: &str) -> Result<Option<Provider>, Error> {
    match std::env::var(var) {
        Ok(value) => value.parse().map(Some),
        Err(_) => Ok(None),
    }
}

/// Pick the embeddings provider: an explicit choice wins, then the chat
/// provider when it has an embeddings API, then Ollama.
fn embedding_provider(
    explicit: Option<Provider>,
    chat: Option<Provider>,
) -> Result<Provider, Error> {
    let provider = match (explicit, chat) {
        (Some(provider), _) => provider,
        (None, Some(chat)) if chat.default_embedding_model().is_some() => chat,
        (None, _) => Provider::Ollama,
    };
    if provider.default_embedding_model().is_none() {
        return Err(Error::Config(format!(
            "{provider} does not provide embeddings, choose openai or ollama for LOREWEAVE_EMBEDDING_PROVIDER"
        )));
    }
    Ok(provider)
}

/// Settings used to build a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub provider: Provider,
    pub model: Option<String>,
    pub embedding_model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a config for the given provider with default settings.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: None,
            embedding_model: None,
            api_key: None,
            base_url: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Build a config from environment variables.
    ///
    /// Reads `LOREWEAVE_LLM_PROVIDER` (default `anthropic`), `LOREWEAVE_LLM_MODEL`,
    /// `LOREWEAVE_EMBEDDING_MODEL`, the provider's API key variable, and
    /// `OLLAMA_BASE_URL` for the Ollama provider.
    pub fn from_env() -> Result<Self, Error> {
        let provider =
            provider_from_env("LOREWEAVE_LLM_PROVIDER")?.unwrap_or(Provider::Anthropic);
        let mut config = Self::credentials_from_env(provider)?;
        config.model = std::env::var("LOREWEAVE_LLM_MODEL").ok();
        config.embedding_model = std::env::var("LOREWEAVE_EMBEDDING_MODEL").ok();
        Ok(config)
    }

    /// Build a config for an embeddings client from environment variables.
    ///
    /// Reads `LOREWEAVE_EMBEDDING_PROVIDER`. When it is unset the chat
    /// provider is reused if it offers embeddings, otherwise a local Ollama
    /// server is assumed. `LOREWEAVE_EMBEDDING_MODEL` overrides the model.
    pub fn embeddings_from_env() -> Result<Self, Error> {
        let provider = embedding_provider(
            provider_from_env("LOREWEAVE_EMBEDDING_PROVIDER")?,
            provider_from_env("LOREWEAVE_LLM_PROVIDER")?,
        )?;
        let mut config = Self::credentials_from_env(provider)?;
        config.embedding_model = std::env::var("LOREWEAVE_EMBEDDING_MODEL").ok();
        Ok(config)
    }

    fn credentials_from_env(provider: Provider) -> Result<Self, Error> {
        let mut config = Self::new(provider);
        if let Some(var) = provider.api_key_env() {
            config.api_key = Some(std::env::var(var).map_err(|_| Error::NoApiKey)?);
        }
        if provider == Provider::Ollama {
            config.base_url = std::env::var("OLLAMA_BASE_URL").ok();
        }
        Ok(config)
    }

    /// Set the chat model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the embedding model.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Provider-specific connection details, fixed at construction.
#[derive(Clone)]
enum Backend {
    Anthropic { api_key: String, base_url: String },
    OpenAi { api_key: String, base_url: String },
    Ollama { base_url: String },
}

/// Multi-provider LLM client.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    backend: Backend,
    model: String,
    embedding_model: Option<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("provider", &self.provider())
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl Client {
    /// Build a client from the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        let base_url = config
            .base_url
            .unwrap_or_else(|| config.provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        let backend = match config.provider {
            Provider::Anthropic => Backend::Anthropic {
                api_key: config.api_key.ok_or(Error::NoApiKey)?,
                base_url,
            },
            Provider::OpenAi => Backend::OpenAi {
                api_key: config.api_key.ok_or(Error::NoApiKey)?,
                base_url,
            },
            Provider::Ollama => Backend::Ollama { base_url },
        };

        Ok(Self {
            http,
            backend,
            model: config
                .model
                .unwrap_or_else(|| config.provider.default_model().to_string()),
            embedding_model: config
                .embedding_model
                .or_else(|| config.provider.default_embedding_model().map(String::from)),
        })
    }

    /// Create a client from environment variables (see [`ClientConfig::from_env`]).
    pub fn from_env() -> Result<Self, Error> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Create an embeddings client from environment variables (see
    /// [`ClientConfig::embeddings_from_env`]).
    pub fn embeddings_from_env() -> Result<Self, Error> {
        Self::new(ClientConfig::embeddings_from_env()?)
    }

    /// Whether [`embed`](Self::embed) can succeed for this client.
    pub fn supports_embeddings(&self) -> bool {
        !matches!(self.backend, Backend::Anthropic { .. }) && self.embedding_model.is_some()
    }

    /// Set the default chat model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The provider this client was built for.
    pub fn provider(&self) -> Provider {
        match self.backend {
            Backend::Anthropic { .. } => Provider::Anthropic,
            Backend::OpenAi { .. } => Provider::OpenAi,
            Backend::Ollama { .. } => Provider::Ollama,
        }
    }

    /// The default chat model.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a single completion for a prompt with an optional system prompt.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, Error> {
        let mut request = Request::new(vec![Message::user(prompt)]);
        if let Some(system) = system {
            request = request.with_system(system);
        }
        Ok(self.complete(request).await?.text)
    }

    /// Send a completion request and return the full response.
    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        debug!(provider = %self.provider(), model = %model, "sending completion request");

        match &self.backend {
            Backend::Anthropic { api_key, base_url } => {
                let body = AnthropicRequest {
                    model,
                    max_tokens: request.max_tokens,
                    system: request.system,
                    messages: request.messages.iter().map(WireMessage::from).collect(),
                    temperature: request.temperature,
                };
                let mut headers = json_headers();
                headers.insert(
                    "x-api-key",
                    HeaderValue::from_str(api_key)
                        .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
                );
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_API_VERSION),
                );

                let parsed: AnthropicResponse = self
                    .post(format!("{base_url}/messages"), headers, &body)
                    .await?;
                let text = parsed
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        AnthropicContent::Text { text } => Some(text.as_str()),
                        AnthropicContent::Other => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");

                Ok(Response {
                    model: parsed.model,
                    text,
                    usage: Usage {
                        input_tokens: parsed.usage.input_tokens,
                        output_tokens: parsed.usage.output_tokens,
                    },
                })
            }
            Backend::OpenAi { api_key, base_url } => {
                let body = OpenAiChatRequest {
                    model,
                    messages: with_system_message(request.system, &request.messages),
                    max_tokens: request.max_tokens,
                    temperature: request.temperature,
                };
                let headers = bearer_headers(api_key)?;

                let parsed: OpenAiChatResponse = self
                    .post(format!("{base_url}/chat/completions"), headers, &body)
                    .await?;
                let text = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .ok_or_else(|| Error::Parse("response contained no choices".to_string()))?;
                let usage = parsed.usage.unwrap_or_default();

                Ok(Response {
                    model: parsed.model,
                    text,
                    usage: Usage {
                        input_tokens: usage.prompt_tokens,
                        output_tokens: usage.completion_tokens,
                    },
                })
            }
            Backend::Ollama { base_url } => {
                let body = OllamaChatRequest {
                    model,
                    messages: with_system_message(request.system, &request.messages),
                    stream: false,
                    options: OllamaOptions {
                        temperature: request.temperature,
                        num_predict: Some(request.max_tokens),
                    },
                };

                let parsed: OllamaChatResponse = self
                    .post(format!("{base_url}/api/chat"), json_headers(), &body)
                    .await?;

                Ok(Response {
                    model: parsed.model,
                    text: parsed.message.content,
                    usage: Usage {
                        input_tokens: parsed.prompt_eval_count.unwrap_or(0),
                        output_tokens: parsed.eval_count.unwrap_or(0),
                    },
                })
            }
        }
    }

    /// Embed a batch of texts, returning one vector per input in order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.embedding_model.clone().ok_or_else(|| {
            Error::Config(format!("{} does not provide embeddings", self.provider()))
        })?;
        debug!(provider = %self.provider(), model = %model, count = texts.len(), "embedding texts");

        match &self.backend {
            Backend::Anthropic { .. } => Err(Error::Config(
                "anthropic does not provide embeddings".to_string(),
            )),
            Backend::OpenAi { api_key, base_url } => {
                let body = EmbeddingRequest {
                    model,
                    input: texts.to_vec(),
                };
                let parsed: OpenAiEmbeddingResponse = self
                    .post(format!("{base_url}/embeddings"), bearer_headers(api_key)?, &body)
                    .await?;

                let mut data = parsed.data;
                data.sort_by_key(|d| d.index);
                Ok(data.into_iter().map(|d| d.embedding).collect())
            }
            Backend::Ollama { base_url } => {
                let body = EmbeddingRequest {
                    model,
                    input: texts.to_vec(),
                };
                let parsed: OllamaEmbeddingResponse = self
                    .post(format!("{base_url}/api/embed"), json_headers(), &body)
                    .await?;
                Ok(parsed.embeddings)
            }
        }
    }

    async fn post<B, T>(&self, url: String, headers: HeaderMap, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

fn bearer_headers(api_key: &str) -> Result<HeaderMap, Error> {
    let mut headers = json_headers();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
    );
    Ok(headers)
}

fn with_system_message(system: Option<String>, messages: &[Message]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        wire.push(WireMessage {
            role: "system".to_string(),
            content: system,
        });
    }
    wire.extend(messages.iter().map(WireMessage::from));
    wire
}

// ============================================================================
// Public types
// ============================================================================

/// A completion request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
}

impl Request {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            system: None,
            messages,
            temperature: None,
        }
    }

    /// Set the model for this request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set max tokens.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A message in a conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct Response {
    pub model: String,
    pub text: String,
    pub usage: Usage,
}

/// Token usage information.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client =
            Client::new(ClientConfig::new(Provider::Anthropic).with_api_key("test-key")).unwrap();
        assert_eq!(client.model(), DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(client.provider(), Provider::Anthropic);
    }

    #[test]
    fn test_client_requires_api_key() {
        let result = Client::new(ClientConfig::new(Provider::OpenAi));
        assert!(matches!(result, Err(Error::NoApiKey)));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let client = Client::new(ClientConfig::new(Provider::Ollama)).unwrap();
        assert_eq!(client.provider(), Provider::Ollama);
        assert_eq!(client.model(), DEFAULT_OLLAMA_MODEL);
        assert_eq!(
            client.embedding_model.as_deref(),
            Some(DEFAULT_OLLAMA_EMBEDDING_MODEL)
        );
    }

    #[test]
    fn test_client_with_model() {
        let client = Client::new(ClientConfig::new(Provider::Ollama))
            .unwrap()
            .with_model("mistral");
        assert_eq!(client.model(), "mistral");
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert_eq!(" ollama ".parse::<Provider>().unwrap(), Provider::Ollama);
        assert!("gemini".parse::<Provider>().is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new(vec![Message::user("Hello")])
            .with_system("You are a narrator")
            .with_max_tokens(500)
            .with_temperature(0.3);

        assert_eq!(request.max_tokens, 500);
        assert!(request.system.is_some());
        assert_eq!(request.temperature, Some(0.3));
    }

    #[test]
    fn test_system_message_is_prepended() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let wire = with_system_message(Some("rules".to_string()), &messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[test]
    fn test_anthropic_response_skips_non_text_blocks() {
        let raw = r#"{
            "model": "claude",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello"}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 1}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert!(matches!(parsed.content[0], AnthropicContent::Other));
    }

    #[tokio::test]
    async fn test_anthropic_has_no_embeddings() {
        let client =
            Client::new(ClientConfig::new(Provider::Anthropic).with_api_key("test-key")).unwrap();
        let result = client.embed(&["hello".to_string()]).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_supports_embeddings() {
        let anthropic =
            Client::new(ClientConfig::new(Provider::Anthropic).with_api_key("test-key")).unwrap();
        assert!(!anthropic.supports_embeddings());
        let ollama = Client::new(ClientConfig::new(Provider::Ollama)).unwrap();
        assert!(ollama.supports_embeddings());
    }

    #[test]
    fn test_embedding_provider_selection() {
        assert_eq!(
            embedding_provider(None, Some(Provider::Anthropic)).unwrap(),
            Provider::Ollama
        );
        assert_eq!(
            embedding_provider(None, Some(Provider::OpenAi)).unwrap(),
            Provider::OpenAi
        );
        assert_eq!(embedding_provider(None, None).unwrap(), Provider::Ollama);
        assert_eq!(
            embedding_provider(Some(Provider::OpenAi), Some(Provider::Ollama)).unwrap(),
            Provider::OpenAi
        );
        assert!(matches!(
            embedding_provider(Some(Provider::Anthropic), None),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_embed_empty_batch() {
        let client = Client::new(ClientConfig::new(Provider::Ollama)).unwrap();
        let vectors = client.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
