//! Conversation sessions.
//!
//! A [`Session`] holds the alternating user/assistant turns of one
//! conversation. The [`ConversationManager`] owns all live sessions, hands
//! out per-session locks so concurrent questions against the same session
//! serialize instead of interleaving, and lazily expires idle sessions.
//!
//! Stored history is bounded at append time: FIFO eviction drops the oldest
//! turns once the session exceeds either the turn cap or the history token
//! budget, but never the most recent user turn. Rendering into a prompt
//! applies the same token budget again as a read-side view (newest turns
//! kept), so a caller asking with a smaller budget still gets a bounded
//! slice.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::token;

/// The `[session]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum stored turns per session before FIFO eviction.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Sessions idle longer than this are dropped by the expiry sweep.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_turns() -> usize {
    40
}
fn default_idle_timeout_secs() -> u64 {
    1800
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_turns < 2 {
            return Err(RagError::InvalidConfig(
                "session.max_turns must be >= 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub token_count: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = token::count(&text);
        Self {
            role,
            text,
            token_count,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// One conversation's state. Always accessed through the per-session lock
/// handed out by [`ConversationManager::session`].
pub struct Session {
    pub id: String,
    turns: Vec<Turn>,
    max_turns: usize,
    history_budget_tokens: usize,
    total_tokens: usize,
    last_active: Instant,
}

impl Session {
    fn new(id: String, max_turns: usize, history_budget_tokens: usize) -> Self {
        Self {
            id,
            turns: Vec::new(),
            max_turns,
            history_budget_tokens,
            total_tokens: 0,
            last_active: Instant::now(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Sum of stored turn token counts, maintained across append and evict.
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Append a turn, evicting oldest turns while the session exceeds the
    /// turn cap or the history token budget. The most recent user turn
    /// survives eviction even when the caps would remove it, so the question
    /// an answer responds to is never lost mid-exchange.
    pub fn append(&mut self, turn: Turn) {
        self.total_tokens += turn.token_count;
        self.turns.push(turn);
        self.touch();

        while self.turns.len() > self.max_turns || self.total_tokens > self.history_budget_tokens {
            let last_user = self
                .turns
                .iter()
                .rposition(|t| t.role == Role::User);
            let evict = match last_user {
                Some(0) => 1,
                _ => 0,
            };
            if evict >= self.turns.len() {
                break;
            }
            let removed = self.turns.remove(evict);
            self.total_tokens -= removed.token_count;
        }
    }

    /// Render the newest turns that fit within `budget_tokens`, oldest first.
    /// Walks backwards accumulating whole turns; a turn that would overflow
    /// the budget is skipped along with everything older.
    pub fn history_for_prompt(&self, budget_tokens: usize) -> Vec<&Turn> {
        let mut selected = Vec::new();
        let mut used = 0usize;
        for turn in self.turns.iter().rev() {
            if used + turn.token_count > budget_tokens {
                break;
            }
            used += turn.token_count;
            selected.push(turn);
        }
        selected.reverse();
        selected
    }
}

/// Owns all live sessions behind per-session async locks.
pub struct ConversationManager {
    config: SessionConfig,
    history_budget_tokens: usize,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl ConversationManager {
    pub fn new(config: SessionConfig, history_budget_tokens: usize) -> Self {
        Self {
            config,
            history_budget_tokens,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for `id`, creating it when absent. A `None` id mints
    /// a fresh session with a random id. Returns the id and the lock handle;
    /// callers hold the lock for the whole ask so concurrent questions on one
    /// session run one at a time.
    pub fn session(&self, id: Option<&str>) -> (String, Arc<Mutex<Session>>) {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = sessions.get(&id) {
                return (id, handle.clone());
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let handle = sessions
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Session::new(
                    id.clone(),
                    self.config.max_turns,
                    self.history_budget_tokens,
                )))
            })
            .clone();
        (id, handle)
    }

    /// Drop a session's history. Returns whether a session existed.
    pub fn reset(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions idle past the configured timeout. Sessions whose lock is
    /// currently held are in use and skipped regardless of timestamps.
    pub fn expire_idle(&self) -> usize {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => session.last_active.elapsed() < timeout,
            Err(_) => true,
        });
        let expired = before - sessions.len();
        if expired > 0 {
            tracing::debug!(expired, "expired idle sessions");
        }
        expired
    }
}
