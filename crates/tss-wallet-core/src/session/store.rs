//! Session registry abstraction

use super::Session;
use crate::{Error, Result, SessionId};
use dashmap::DashMap;

/// Registry of sessions.
///
/// Implementations must be safe to share between party tasks; the in-memory
/// implementation is a concurrent map, but an external cache works as long as
/// `update` is atomic per session.
pub trait SessionStore: Send + Sync {
    /// Insert a new session; fails if the id is taken
    fn insert(&self, session: Session) -> Result<()>;

    /// Snapshot of a session
    fn get(&self, id: &str) -> Option<Session>;

    /// Apply `f` atomically and return the updated snapshot.
    ///
    /// If `f` fails the stored session is left exactly as it was.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Session) -> Result<()>) -> Result<Session>;

    /// Remove a session
    fn remove(&self, id: &str) -> Option<Session>;

    /// Snapshot of every session
    fn list(&self) -> Vec<Session>;
}

/// [`SessionStore`] backed by a `DashMap`
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Session) -> Result<()> {
        match self.sessions.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Internal(format!(
                "session id collision: {}",
                session.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut Session) -> Result<()>) -> Result<Session> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        // Work on a copy; the entry guard keeps other writers out meanwhile
        let mut draft = entry.value().clone();
        f(&mut draft)?;
        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}
