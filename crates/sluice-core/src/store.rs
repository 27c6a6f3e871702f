//! Session persistence seam.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::session::Session;

/// Sink for session snapshots.
///
/// `save` is called on every tracked mutation with the full current record,
/// so implementations must upsert by `Session::id`.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<()>;
}

/// Store that keeps the latest snapshot of each session in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest snapshot for `id`.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    /// Returns all stored sessions, oldest first.
    pub fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &Session) -> Result<()> {
        self.lock().insert(session.id.clone(), session.clone());
        Ok(())
    }
}

/// Store that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl SessionStore for NullStore {
    fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_upserts() {
        let store = MemoryStore::new();
        let mut session = Session::new();
        store.save(&session).unwrap();
        session.state = 200;
        store.save(&session).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&session.id).unwrap().state, 200);
    }

    #[test]
    fn null_store_accepts_anything() {
        assert!(NullStore.save(&Session::new()).is_ok());
    }
}
