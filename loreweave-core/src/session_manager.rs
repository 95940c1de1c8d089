//! Concurrent registry of live sessions with TTL expiry.

use crate::config::SessionConfig;
use crate::session::{GameSession, SessionSummary};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Shared handle to one session. Hold the lock for a whole turn.
pub type SessionHandle = Arc<Mutex<GameSession>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),
}

struct Entry {
    session: SessionHandle,
    last_accessed: DateTime<Utc>,
}

/// Registry of sessions keyed by id.
///
/// Expiry is tracked on the registry entry so it can be checked without
/// taking a session lock. Expired sessions are dropped lazily on lookup or
/// eagerly by [`SessionManager::cleanup_expired_sessions`].
pub struct SessionManager {
    config: SessionConfig,
    sessions: DashMap<String, Entry>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a new session and return its id with a handle to it.
    pub fn create_session(&self, initial_context: Option<String>) -> (String, SessionHandle) {
        let session = GameSession::new(self.config.clone()).with_initial_context(initial_context);
        let id = session.session_id().to_string();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(
            id.clone(),
            Entry {
                session: handle.clone(),
                last_accessed: Utc::now(),
            },
        );
        info!(session_id = %id, "session created");
        (id, handle)
    }

    /// Look a session up, refreshing its access time.
    pub fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.lookup_at(session_id, Utc::now()).ok()
    }

    /// Like [`get_session`](Self::get_session), but says why a lookup failed.
    pub fn session(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        self.lookup_at(session_id, Utc::now())
    }

    fn lookup_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<SessionHandle, SessionError> {
        let removed = self.sessions.remove_if(session_id, |_, entry| {
            self.config.is_expired(entry.last_accessed, now)
        });
        if removed.is_some() {
            info!(session_id, "session expired and removed");
            return Err(SessionError::Expired(session_id.to_string()));
        }

        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.last_accessed = now;
                Ok(entry.session.clone())
            }
            None => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    pub fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!(session_id, "session deleted");
        }
        removed
    }

    /// Drop every expired session; returns how many were removed.
    pub fn cleanup_expired_sessions(&self) -> usize {
        self.remove_expired().len()
    }

    /// Drop every expired session and return the removed ids.
    pub fn remove_expired(&self) -> Vec<String> {
        self.remove_expired_at(Utc::now())
    }

    fn remove_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.sessions.retain(|id, entry| {
            let expired = self.config.is_expired(entry.last_accessed, now);
            if expired {
                removed.push(id.clone());
            }
            !expired
        });
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up expired sessions");
        }
        removed
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Summaries of sessions not currently locked by a running turn.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> =
            self.sessions.iter().map(|e| e.session.clone()).collect();
        let mut summaries: Vec<SessionSummary> = handles
            .iter()
            .filter_map(|h| h.try_lock().ok().map(|s| s.summary()))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
