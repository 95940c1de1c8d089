//! Per-story state: turn history, sliding-window memory, persona cache and
//! the win/loss tally.
//!
//! [`GameSession`] is the only thing that mutates a session. The turn machine
//! borrows it mutably for the duration of a turn and hands collaborators a
//! [`SessionSnapshot`] instead.

use crate::agents::{AgentOutput, AgentRole, Persona, SessionSnapshot, ValidationResult};
use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};
use uuid::Uuid;

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k_base unavailable, estimating tokens from length");
        None
    }
});

/// Token cost of `text` under `cl100k_base`, or `chars / 4` without it.
pub fn estimate_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count() / 4,
    }
}

/// One completed player turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_number: usize,
    pub player_command: String,
    pub agent_outputs: BTreeMap<AgentRole, AgentOutput>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(turn_number: usize, player_command: impl Into<String>) -> Self {
        Self {
            turn_number,
            player_command: player_command.into(),
            agent_outputs: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_output(mut self, role: AgentRole, output: AgentOutput) -> Self {
        self.agent_outputs.insert(role, output);
        self
    }

    /// Render as `Turn N: command` followed by one `role: content` line per output.
    pub fn to_text(&self) -> String {
        let mut text = format!("Turn {}: {}", self.turn_number, self.player_command);
        for (role, output) in &self.agent_outputs {
            text.push_str(&format!("\n{role}: {}", output.content));
        }
        text
    }
}

/// A turn held in the memory window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub turn_number: usize,
    pub player_command: String,
    pub outputs: BTreeMap<AgentRole, String>,
    pub tokens: usize,
}

impl MemoryEntry {
    fn from_turn(turn: &Turn, tokens: usize) -> Self {
        Self {
            turn_number: turn.turn_number,
            player_command: turn.player_command.clone(),
            outputs: turn
                .agent_outputs
                .iter()
                .map(|(role, output)| (*role, output.content.clone()))
                .collect(),
            tokens,
        }
    }
}

/// Mutable story state carried between turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub current_scene: Option<String>,
    pub active_npcs: BTreeSet<String>,
    /// Oldest first.
    pub memory: Vec<MemoryEntry>,
    pub initial_context: Option<String>,
    pub last_validation: Option<ValidationResult>,
}

/// Lightweight description of a session for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub turn_count: usize,
    pub current_scene: Option<String>,
    pub active_npcs: Vec<String>,
    pub memory_size: usize,
    pub cached_personas: Vec<String>,
    pub wins: u32,
    pub losses: u32,
}

/// A single story session.
#[derive(Debug, Clone, Serialize)]
pub struct GameSession {
    session_id: String,
    config: SessionConfig,
    turns: Vec<Turn>,
    state: SessionState,
    persona_cache: HashMap<String, Persona>,
    wins: u32,
    losses: u32,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

impl GameSession {
    /// New session with a fresh UUID v4.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), config)
    }

    pub fn with_id(session_id: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            config,
            turns: Vec::new(),
            state: SessionState::default(),
            persona_cache: HashMap::new(),
            wins: 0,
            losses: 0,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn with_initial_context(mut self, context: Option<String>) -> Self {
        self.state.initial_context = context.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn set_initial_context(&mut self, context: impl Into<String>) {
        let context = context.into();
        if !context.trim().is_empty() {
            self.state.initial_context = Some(context);
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    /// Number the next turn will carry.
    pub fn next_turn_number(&self) -> usize {
        self.turns.len() + 1
    }

    /// Append a turn and recompute the memory window.
    pub fn add_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.touch();
        self.recompute_memory();
    }

    fn recompute_memory(&mut self) {
        if !self.config.sliding_window {
            self.state.memory.clear();
            return;
        }

        let mut total = 0;
        let mut kept = Vec::new();
        for turn in self.turns.iter().rev() {
            if kept.len() >= self.config.memory_window_size {
                break;
            }
            let tokens = estimate_tokens(&turn.to_text());
            if total + tokens > self.config.max_tokens {
                break;
            }
            total += tokens;
            kept.push(MemoryEntry::from_turn(turn, tokens));
        }
        kept.reverse();

        debug!(
            session_id = %self.session_id,
            entries = kept.len(),
            tokens = total,
            "memory window recomputed"
        );
        self.state.memory = kept;
    }

    /// Summed token estimate of the memory window.
    pub fn memory_tokens(&self) -> usize {
        self.state.memory.iter().map(|m| m.tokens).sum()
    }

    /// Memory rendered for prompts; empty when there is none.
    pub fn memory_context(&self) -> String {
        if self.state.memory.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Previous conversation:".to_string()];
        for entry in &self.state.memory {
            lines.push(format!("Turn {}: {}", entry.turn_number, entry.player_command));
            for (role, content) in &entry.outputs {
                lines.push(format!("  {role}: {content}"));
            }
        }
        lines.join("\n")
    }

    /// Player commands of the last `n` memory entries, oldest first.
    pub fn recent_commands(&self, n: usize) -> Vec<&str> {
        let memory = &self.state.memory;
        memory[memory.len().saturating_sub(n)..]
            .iter()
            .map(|m| m.player_command.as_str())
            .collect()
    }

    pub fn set_scene(&mut self, scene: impl Into<String>) {
        self.state.current_scene = Some(scene.into());
    }

    /// Returns false if the NPC was already active.
    pub fn activate_npc(&mut self, npc: impl Into<String>) -> bool {
        self.state.active_npcs.insert(npc.into())
    }

    pub fn set_last_validation(&mut self, validation: ValidationResult) {
        self.state.last_validation = Some(validation);
    }

    pub fn persona(&self, npc: &str) -> Option<&Persona> {
        self.persona_cache.get(npc)
    }

    /// Cache a persona unless one is already present. Returns whether it was
    /// stored.
    pub fn cache_persona(&mut self, npc: impl Into<String>, persona: Persona) -> bool {
        match self.persona_cache.entry(npc.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(persona);
                true
            }
        }
    }

    pub fn cached_persona_count(&self) -> usize {
        self.persona_cache.len()
    }

    /// The player caught a collaborator contradicting the corpus.
    pub fn record_win(&mut self) {
        self.wins += 1;
    }

    /// The player's command was disqualified.
    pub fn record_loss(&mut self) {
        self.losses += 1;
    }

    pub fn wins(&self) -> u32 {
        self.wins
    }

    pub fn losses(&self) -> u32 {
        self.losses
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    pub fn summary(&self) -> SessionSummary {
        let mut cached_personas: Vec<String> = self.persona_cache.keys().cloned().collect();
        cached_personas.sort();
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            turn_count: self.turns.len(),
            current_scene: self.state.current_scene.clone(),
            active_npcs: self.state.active_npcs.iter().cloned().collect(),
            memory_size: self.state.memory.len(),
            cached_personas,
            wins: self.wins,
            losses: self.losses,
        }
    }

    /// Read-only view for collaborators.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            turn_number: self.turns.len(),
            current_scene: self.state.current_scene.clone(),
            active_npcs: self.state.active_npcs.iter().cloned().collect(),
            initial_context: self.state.initial_context.clone(),
            memory_context: self.memory_context(),
            last_command: self.turns.last().map(|t| t.player_command.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: usize, command: &str, narration: &str) -> Turn {
        Turn::new(n, command).with_output(AgentRole::Narrator, AgentOutput::new(narration))
    }

    fn session(config: SessionConfig) -> GameSession {
        GameSession::with_id("test", config)
    }

    #[test]
    fn test_turn_text() {
        let t = turn(3, "look", "A hall.")
            .with_output(AgentRole::NpcManager, AgentOutput::new("Hello."));
        assert_eq!(t.to_text(), "Turn 3: look\nnpc_manager: Hello.\nnarrator: A hall.");
    }

    #[test]
    fn test_memory_context_format() {
        let mut s = session(SessionConfig::default());
        assert_eq!(s.memory_context(), "");

        s.add_turn(turn(1, "look around", "You see the Shire."));
        assert_eq!(
            s.memory_context(),
            "Previous conversation:\nTurn 1: look around\n  narrator: You see the Shire."
        );
    }

    #[test]
    fn test_window_size_bound() {
        let mut s = session(SessionConfig::default().with_window_size(2));
        for n in 1..=5 {
            s.add_turn(turn(n, &format!("command {n}"), "ok"));
        }
        let numbers: Vec<usize> = s.state().memory.iter().map(|m| m.turn_number).collect();
        assert_eq!(numbers, vec![4, 5]);
        assert_eq!(s.turns().len(), 5);
        assert_eq!(s.recent_commands(2), vec!["command 4", "command 5"]);
    }

    #[test]
    fn test_token_budget_bound() {
        let narration = "word ".repeat(40);
        let per_turn = estimate_tokens(&turn(1, "c", &narration).to_text());
        let budget = per_turn * 2 + per_turn / 2;

        let mut s = session(SessionConfig::default().with_max_tokens(budget));
        for n in 1..=6 {
            s.add_turn(turn(n, "c", &narration));
        }
        assert!(s.memory_tokens() <= budget);
        assert_eq!(s.state().memory.len(), 2);
        assert_eq!(s.state().memory.last().map(|m| m.turn_number), Some(6));
    }

    #[test]
    fn test_oversized_latest_turn_leaves_memory_empty() {
        let mut s = session(SessionConfig::default().with_max_tokens(1));
        s.add_turn(turn(1, "a long command here", "and a long reply"));
        assert!(s.state().memory.is_empty());
        assert_eq!(s.memory_context(), "");
    }

    #[test]
    fn test_disabled_sliding_window_keeps_no_memory() {
        let mut s = session(SessionConfig::default().with_sliding_window(false));
        s.add_turn(turn(1, "look", "mist"));
        assert!(s.state().memory.is_empty());
        assert_eq!(s.turns().len(), 1);
    }

    #[test]
    fn test_persona_cache_is_insert_once() {
        let mut s = session(SessionConfig::default());
        assert!(s.cache_persona("Gandalf", Persona::fallback("Gandalf")));

        let mut other = Persona::fallback("Gandalf");
        other.speaking_style = "shouty".into();
        assert!(!s.cache_persona("Gandalf", other));
        assert_eq!(
            s.persona("Gandalf").map(|p| p.speaking_style.as_str()),
            Some("neutral and polite")
        );
    }

    #[test]
    fn test_snapshot_and_summary() {
        let mut s = session(SessionConfig::default())
            .with_initial_context(Some("A hobbit's tale".into()));
        s.set_scene("Bag End");
        s.activate_npc("Gandalf");
        s.record_loss();
        s.add_turn(turn(1, "hello", "hi"));

        let snap = s.snapshot();
        assert_eq!(snap.current_scene.as_deref(), Some("Bag End"));
        assert_eq!(snap.active_npcs, vec!["Gandalf"]);
        assert_eq!(snap.last_command.as_deref(), Some("hello"));
        assert_eq!(snap.initial_context.as_deref(), Some("A hobbit's tale"));

        let summary = s.summary();
        assert_eq!(summary.turn_count, 1);
        assert_eq!(summary.losses, 1);
        assert_eq!(summary.wins, 0);
    }
}
