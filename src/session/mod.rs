//! Conversation sessions
//!
//! One [`Session`] per connection, owned by its [`SessionMachine`]. The
//! [`SessionRegistry`] only holds handles for lookup, eviction and health.

mod epoch;
mod machine;
mod registry;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use epoch::EpochGate;
pub use machine::{SessionEvent, SessionMachine, Services};
pub use registry::{SessionHandle, SessionRegistry, SessionSummary};

use crate::prompt::PersonaSelector;

/// Turn-taking state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Greeting,
    Listening,
    Processing,
    Speaking,
    Interrupted,
}

impl TurnState {
    /// Whether the machine may move from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TurnState::{Greeting, Idle, Interrupted, Listening, Processing, Speaking};

        matches!(
            (self, next),
            (_, Idle)
                | (Idle, Greeting)
                | (Greeting | Interrupted | Processing | Speaking, Listening)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Processing | Speaking, Interrupted)
        )
    }

    /// The agent is formulating or delivering a response
    #[must_use]
    pub const fn is_responding(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }
}

/// Speaker of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Capability descriptor supplied once at session start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Client runs on a mobile device
    pub is_mobile: bool,
    /// Selected generation engine; `None` uses the configured default
    pub model: Option<String>,
    /// Role and personality for the system prompt
    pub persona: PersonaSelector,
    /// Maximum output tokens override
    pub word_limit: Option<u32>,
}

/// Activity counters shared between a session and the registry
#[derive(Debug)]
pub struct SessionActivity {
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    message_count: AtomicUsize,
}

impl Default for SessionActivity {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_activity: Mutex::new(now),
            message_count: AtomicUsize::new(0),
        }
    }
}

impl SessionActivity {
    /// Mark the session as active now
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_count.load(Ordering::Relaxed)
    }

    fn set_message_count(&self, count: usize) {
        self.message_count.store(count, Ordering::Relaxed);
    }
}

/// One conversation's state
#[derive(Debug)]
pub struct Session {
    id: String,
    state: TurnState,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    capabilities: Capabilities,
    activity: std::sync::Arc<SessionActivity>,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, history_limit: usize) -> Self {
        Self {
            id: id.into(),
            state: TurnState::Idle,
            history: VecDeque::new(),
            history_limit,
            capabilities: Capabilities::default(),
            activity: std::sync::Arc::new(SessionActivity::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `next`, logging transitions the state graph does not allow
    pub fn transition(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(session_id = %self.id, from = ?self.state, to = ?next, "unexpected transition");
        }
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    /// Append to history, keeping only the most recent entries
    pub fn push_history(&mut self, role: Role, text: impl Into<String>) {
        self.history.push_back(HistoryEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.activity.set_message_count(self.history.len());
        self.activity.touch();
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.activity.set_message_count(0);
    }

    #[must_use]
    pub const fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    /// Counters shared with the registry
    #[must_use]
    pub fn activity(&self) -> std::sync::Arc<SessionActivity> {
        std::sync::Arc::clone(&self.activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_capped() {
        let mut session = Session::new("s", 20);
        for i in 0..25 {
            session.push_history(Role::User, format!("msg {i}"));
        }
        assert_eq!(session.history().len(), 20);
        assert_eq!(session.history()[0].text, "msg 5");
        assert_eq!(session.activity().message_count(), 20);
    }

    #[test]
    fn clear_history_resets_count() {
        let mut session = Session::new("s", 20);
        session.push_history(Role::Assistant, "你好");
        session.clear_history();
        assert!(session.history().is_empty());
        assert_eq!(session.activity().message_count(), 0);
    }

    #[test]
    fn transition_graph() {
        use TurnState::{Greeting, Idle, Interrupted, Listening, Processing, Speaking};

        assert!(Idle.can_transition_to(Greeting));
        assert!(Greeting.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Speaking));
        assert!(Processing.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Interrupted));
        assert!(Interrupted.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Listening.can_transition_to(Interrupted));
        assert!(!Greeting.can_transition_to(Processing));
    }

    #[test]
    fn responding_states() {
        assert!(TurnState::Processing.is_responding());
        assert!(TurnState::Speaking.is_responding());
        assert!(!TurnState::Listening.is_responding());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::User.as_str(), "user");
    }
}
