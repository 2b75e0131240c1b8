use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use super::{SessionActivity, SessionEvent};
use crate::{Error, Result};

/// Registry's view of a live session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    activity: Arc<SessionActivity>,
}

impl SessionHandle {
    #[must_use]
    pub const fn new(
        id: String,
        events: mpsc::UnboundedSender<SessionEvent>,
        activity: Arc<SessionActivity>,
    ) -> Self {
        Self {
            id,
            events,
            activity,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Post an event to the session
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] if the session has already ended
    pub fn send(&self, event: SessionEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::SessionClosed)
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            message_count: self.activity.message_count(),
            created_at: self.activity.created_at(),
            last_activity: self.activity.last_activity(),
        }
    }
}

/// Snapshot of a session for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// All live sessions, keyed by id
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub async fn insert(&self, handle: SessionHandle) {
        tracing::debug!(session_id = %handle.id, "session registered");
        self.sessions.write().await.insert(handle.id.clone(), handle);
    }

    /// Forget a session that ended on its own
    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Remove a session and tell it to shut down
    pub async fn evict(&self, id: &str) -> bool {
        let Some(handle) = self.sessions.write().await.remove(id) else {
            return false;
        };
        if let Err(e) = handle.send(SessionEvent::Evicted) {
            tracing::debug!(session_id = %id, error = %e, "evicted session had already ended");
        }
        tracing::info!(session_id = %id, "session evicted");
        true
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .await
            .values()
            .map(SessionHandle::summary)
            .collect()
    }

    /// Evict sessions idle longer than the timeout as of `now`
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::MAX);
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|h| now - h.activity.last_activity() > timeout)
            .map(|h| h.id.clone())
            .collect();

        for id in &expired {
            self.evict(id).await;
        }
        if !expired.is_empty() {
            tracing::info!(evicted = expired.len(), "idle sessions swept");
        }
        expired.len()
    }

    /// Run [`Self::sweep_idle`] every `interval`
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_idle(Utc::now()).await;
            }
        })
    }
}
