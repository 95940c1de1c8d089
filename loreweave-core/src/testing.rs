//! Deterministic stand-ins for the engine's collaborators.
//!
//! Everything here runs without network access:
//! - `ScriptedGenerator` and the `Scripted*` collaborators replay canned
//!   responses and count their calls
//! - `CountingRetriever` / `FailingRetriever` for retrieval plumbing
//! - `HashEmbedder` for reproducible bag-of-words vectors
//! - `fantasy_corpus` and `in_memory_retriever` for end-to-end scenarios

use crate::agents::{
    AgentOutput, CollaboratorError, DialogueAgent, Narrator, Persona, PersonaExtractor, Planner,
    ScenePlanOutput, SessionSnapshot, ValidationKind, ValidationRequest, ValidationResult,
    Validator, SCENE_KEY,
};
use crate::generation::{GenerationError, TextGenerator};
use crate::retrieval::{
    Chunk, Embedder, Filters, FusionStrategy, HybridRetriever, InMemoryVectorStore,
    LexicalRetriever, RetrievalError, RetrievalResult, Retriever, SemanticRetriever,
};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Replays scripted generations in order; errors once the script runs out.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A generator whose every call fails.
    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _system_prompt: Option<&str>,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Failed("script exhausted".to_string())))
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Returns a fixed result list (truncated to `top_k`) and records each call.
pub struct CountingRetriever {
    results: Vec<RetrievalResult>,
    calls: AtomicUsize,
    last_top_k: Mutex<Option<usize>>,
    last_query: Mutex<Option<String>>,
}

impl CountingRetriever {
    pub fn new(results: Vec<RetrievalResult>) -> Self {
        Self {
            results,
            calls: AtomicUsize::new(0),
            last_top_k: Mutex::new(None),
            last_query: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_top_k(&self) -> Option<usize> {
        *lock(&self.last_top_k)
    }

    pub fn last_query(&self) -> Option<String> {
        lock(&self.last_query).clone()
    }
}

#[async_trait]
impl Retriever for CountingRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        _filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_top_k) = Some(top_k);
        *lock(&self.last_query) = Some(query.to_string());
        Ok(self.results.iter().take(top_k).cloned().collect())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Fails every call with a fixed error kind.
pub struct FailingRetriever {
    index_not_loaded: bool,
}

impl FailingRetriever {
    pub fn embedding_failure() -> Self {
        Self {
            index_not_loaded: false,
        }
    }

    pub fn index_not_loaded() -> Self {
        Self {
            index_not_loaded: true,
        }
    }
}

#[async_trait]
impl Retriever for FailingRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _top_k: usize,
        _filters: Option<&Filters>,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if self.index_not_loaded {
            Err(RetrievalError::IndexNotLoaded)
        } else {
            Err(RetrievalError::EmbeddingFailure("embedder offline".to_string()))
        }
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Hashes lowercase words into a fixed number of buckets and L2-normalizes.
///
/// Identical texts embed identically; texts sharing words land close together.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in crate::retrieval::tokenize(text) {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embedder that is always unavailable.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        Err(RetrievalError::EmbeddingFailure("embedder offline".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Replays verdicts for command and response validation separately.
///
/// Unscripted calls approve.
#[derive(Default)]
pub struct ScriptedValidator {
    user: Mutex<VecDeque<ValidationResult>>,
    agent: Mutex<VecDeque<ValidationResult>>,
    failing: bool,
    calls: AtomicUsize,
    kinds: Mutex<Vec<ValidationKind>>,
}

impl ScriptedValidator {
    pub fn approving() -> Self {
        Self::default()
    }

    /// Every call errors.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with_user_verdict(self, verdict: ValidationResult) -> Self {
        lock(&self.user).push_back(verdict);
        self
    }

    pub fn with_agent_verdict(self, verdict: ValidationResult) -> Self {
        lock(&self.agent).push_back(verdict);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// What each call validated, in order.
    pub fn kinds(&self) -> Vec<ValidationKind> {
        lock(&self.kinds).clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(
        &self,
        request: ValidationRequest<'_>,
    ) -> Result<ValidationResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.kinds).push(request.kind);
        if self.failing {
            return Err(CollaboratorError::Parse("validator offline".to_string()));
        }
        let queue = match request.kind {
            ValidationKind::UserPrompt => &self.user,
            ValidationKind::AgentResponse(_) => &self.agent,
        };
        let verdict = lock(queue).pop_front();
        Ok(verdict.unwrap_or_else(|| ValidationResult::approve("Consistent with the passages.", 0.9)))
    }
}

/// Replays plans in order; narrates once the script runs out.
#[derive(Default)]
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<ScenePlanOutput>>,
    failing: bool,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<ScenePlanOutput>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _player_command: &str,
        _passages: &[RetrievalResult],
        _validation: &ValidationResult,
        _session: &SessionSnapshot,
    ) -> Result<ScenePlanOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(CollaboratorError::Parse("planner offline".to_string()));
        }
        Ok(lock(&self.plans).pop_front().unwrap_or_else(ScenePlanOutput::narrate))
    }
}

/// Narrates with a fixed text, optionally reporting a scene.
pub struct ScriptedNarrator {
    text: String,
    scene: Option<String>,
    failing: bool,
    calls: AtomicUsize,
    snapshots: Mutex<Vec<SessionSnapshot>>,
}

impl ScriptedNarrator {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scene: None,
            failing: false,
            calls: AtomicUsize::new(0),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new("")
        }
    }

    pub fn with_scene(mut self, scene: impl Into<String>) -> Self {
        self.scene = Some(scene.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Session snapshots seen so far.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        lock(&self.snapshots).clone()
    }
}

#[async_trait]
impl Narrator for ScriptedNarrator {
    async fn narrate(
        &self,
        _player_command: &str,
        passages: &[RetrievalResult],
        session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.snapshots).push(session.clone());
        if self.failing {
            return Err(CollaboratorError::Generation(GenerationError::Failed(
                "narrator offline".to_string(),
            )));
        }
        let mut output = AgentOutput::new(self.text.clone())
            .with_citations(passages.iter().take(1).map(|p| p.chunk_id.clone()).collect());
        if let Some(scene) = &self.scene {
            output = output.with_metadata(SCENE_KEY, scene.clone());
        }
        Ok(output)
    }
}

/// Replies with a fixed line and remembers who spoke.
pub struct ScriptedDialogue {
    text: String,
    failing: bool,
    calls: AtomicUsize,
    speakers: Mutex<Vec<(String, Persona)>>,
}

impl ScriptedDialogue {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failing: false,
            calls: AtomicUsize::new(0),
            speakers: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// NPC names and personas used, in call order.
    pub fn speakers(&self) -> Vec<(String, Persona)> {
        lock(&self.speakers).clone()
    }
}

#[async_trait]
impl DialogueAgent for ScriptedDialogue {
    async fn respond(
        &self,
        npc: &str,
        persona: &Persona,
        _player_command: &str,
        _passages: &[RetrievalResult],
        _session: &SessionSnapshot,
    ) -> Result<AgentOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.speakers).push((npc.to_string(), persona.clone()));
        if self.failing {
            return Err(CollaboratorError::Generation(GenerationError::Failed(
                "dialogue offline".to_string(),
            )));
        }
        Ok(AgentOutput::new(self.text.clone()).with_metadata("npc_name", npc))
    }
}

/// Produces a persona with a fixed speaking style.
pub struct ScriptedPersonaExtractor {
    speaking_style: String,
    failing: bool,
    calls: AtomicUsize,
}

impl ScriptedPersonaExtractor {
    pub fn new(speaking_style: impl Into<String>) -> Self {
        Self {
            speaking_style: speaking_style.into(),
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonaExtractor for ScriptedPersonaExtractor {
    async fn extract(
        &self,
        npc: &str,
        passages: &[RetrievalResult],
    ) -> Result<Persona, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(CollaboratorError::Parse("persona offline".to_string()));
        }
        let mut persona = Persona::fallback(npc);
        persona.speaking_style = self.speaking_style.clone();
        persona.citations = passages.iter().map(|p| p.chunk_id.clone()).collect();
        Ok(persona)
    }
}

// ---------------------------------------------------------------------------
// Corpus fixtures
// ---------------------------------------------------------------------------

/// A small Middle-earth corpus in corpus order.
pub fn fantasy_corpus() -> Vec<Chunk> {
    let passages = [
        "In a hole in the ground there lived a hobbit. Bag End was a comfortable hobbit-hole in the Shire.",
        "Gandalf the Grey was a wizard, an old man with a tall pointed hat, a long grey cloak and a silver scarf.",
        "Gandalf spoke gravely: a wizard is never late, nor is he early, he arrives precisely when he means to.",
        "Frodo Baggins inherited the Ring from his uncle Bilbo and lived at Bag End.",
        "The road from the Shire led east past Bree toward Rivendell, the last homely house.",
        "Elrond was master of Rivendell, wise in lore and the history of the elves.",
        "The Ring was forged by Sauron in the fires of Mount Doom in Mordor.",
        "Samwise Gamgee was the gardener at Bag End and Frodo's loyal friend.",
    ];
    passages
        .iter()
        .enumerate()
        .map(|(i, text)| Chunk::new(i, format!("chunk_{i:03}"), *text).with_source("fellowship"))
        .collect()
}

/// BM25 and hash-embedding retrievers over `chunks`, fused with RRF.
pub async fn in_memory_retriever(chunks: Vec<Chunk>) -> Result<HybridRetriever, RetrievalError> {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let store = Arc::new(InMemoryVectorStore::default());
    store
        .index_chunks("corpus", &chunks, embedder.as_ref())
        .await?;
    let semantic = SemanticRetriever::connect(store, embedder, "corpus").await?;
    let lexical = LexicalRetriever::from_chunks(chunks);
    Ok(HybridRetriever::new(
        Arc::new(lexical),
        Arc::new(semantic),
        FusionStrategy::default(),
    ))
}
