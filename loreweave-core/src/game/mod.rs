//! Turn orchestration.

mod game_loop;
mod metrics;
mod turn;

pub use game_loop::{
    GameLoop, TurnError, AGENT_VALIDATION_AGENT, PERSONA_AGENT, USER_VALIDATION_AGENT,
};
pub use metrics::{AgentStats, InMemoryMetrics, MetricsCollector, MetricsSnapshot, NoopMetrics};
pub use turn::{
    ChunkRef, ProgressObserver, TurnMetadata, TurnOutcome, TurnPhase, TurnProgress, TurnResult,
};
