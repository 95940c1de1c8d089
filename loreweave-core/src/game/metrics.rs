//! Turn metrics, injected into the turn machine.

use super::turn::TurnOutcome;
use crate::agents::AgentRole;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Sink for per-turn measurements.
pub trait MetricsCollector: Send + Sync {
    fn record_retrieval(&self, agent: &str, results: usize, elapsed: Duration);

    fn record_agent_call(&self, role: AgentRole, success: bool, elapsed: Duration);

    fn record_turn(&self, outcome: TurnOutcome, success: bool, elapsed: Duration);

    fn record_persona_cache(&self, hit: bool);

    /// Current counters, for collectors that keep them.
    fn snapshot(&self) -> Option<MetricsSnapshot> {
        None
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn record_retrieval(&self, _agent: &str, _results: usize, _elapsed: Duration) {}

    fn record_agent_call(&self, _role: AgentRole, _success: bool, _elapsed: Duration) {}

    fn record_turn(&self, _outcome: TurnOutcome, _success: bool, _elapsed: Duration) {}

    fn record_persona_cache(&self, _hit: bool) {}
}

/// Call counts and accumulated latency for one agent role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentStats {
    pub calls: u64,
    pub failures: u64,
    pub total_ms: u128,
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub turns: u64,
    pub failed_turns: u64,
    pub player_wins: u64,
    pub player_losses: u64,
    pub retrieval_calls: u64,
    pub retrieved_chunks: u64,
    pub persona_cache_hits: u64,
    pub persona_cache_misses: u64,
    pub agents: BTreeMap<AgentRole, AgentStats>,
    pub total_turn_ms: u128,
}

impl MetricsSnapshot {
    pub fn average_turn_ms(&self) -> f64 {
        if self.turns == 0 {
            0.0
        } else {
            self.total_turn_ms as f64 / self.turns as f64
        }
    }
}

/// Keeps counters in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        if let Ok(mut m) = self.inner.lock() {
            *m = MetricsSnapshot::default();
        }
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut m) = self.inner.lock() {
            f(&mut m);
        }
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn record_retrieval(&self, _agent: &str, results: usize, _elapsed: Duration) {
        self.update(|m| {
            m.retrieval_calls += 1;
            m.retrieved_chunks += results as u64;
        });
    }

    fn record_agent_call(&self, role: AgentRole, success: bool, elapsed: Duration) {
        self.update(|m| {
            let stats = m.agents.entry(role).or_default();
            stats.calls += 1;
            if !success {
                stats.failures += 1;
            }
            stats.total_ms += elapsed.as_millis();
        });
    }

    fn record_turn(&self, outcome: TurnOutcome, success: bool, elapsed: Duration) {
        self.update(|m| {
            m.turns += 1;
            if !success {
                m.failed_turns += 1;
            }
            match outcome {
                TurnOutcome::PlayerWins => m.player_wins += 1,
                TurnOutcome::PlayerLoses => m.player_losses += 1,
                TurnOutcome::Continue => {}
            }
            m.total_turn_ms += elapsed.as_millis();
        });
    }

    fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.inner.lock().map(|m| m.clone()).ok()
    }

    fn record_persona_cache(&self, hit: bool) {
        self.update(|m| {
            if hit {
                m.persona_cache_hits += 1;
            } else {
                m.persona_cache_misses += 1;
            }
        });
    }
}
