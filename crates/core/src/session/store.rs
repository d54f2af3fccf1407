//! Process-local registry of live sessions
//!
//! Encapsulates the session map with an explicit lifecycle: register on
//! create, evict after the terminal grace window, forcibly evict on
//! shutdown. The map itself is never exported.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use uuid::Uuid;

use super::Session;

/// Map from session id to live handle
pub struct SessionStore {
    sessions: DashMap<Uuid, Arc<Session>>,
    evict_grace: Duration,
}

impl SessionStore {
    /// Create an empty store with the given terminal grace window
    pub fn new(evict_grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            evict_grace,
        }
    }

    /// Register a session
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Look up a session for a new subscriber or a cancel request
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Remove a session immediately
    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of every registered session
    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Evict a terminated session after the grace window
    ///
    /// Subscribers may still attach and receive the final close envelope
    /// until the window elapses.
    pub fn schedule_evict(self: &Arc<Self>, id: Uuid) {
        let store = Arc::clone(self);
        let grace = self.evict_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if store.sessions.remove(&id).is_some() {
                tracing::debug!(session_id = %id, "Evicted terminated session");
            }
        });
    }
}
