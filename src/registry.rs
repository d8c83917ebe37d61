use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::{Session, SessionId};

/// Live sessions of one stratum endpoint that are eligible for job pushes.
///
/// The lock is never held across an await point: broadcasters take a
/// [`snapshot`](Registry::snapshot) and write to sessions after releasing it.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the session was already registered
    pub fn register(&self, session: Arc<Session>) -> bool {
        self.sessions.write().insert(session.id(), session).is_none()
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Clone out the current members under a short read lock
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}
