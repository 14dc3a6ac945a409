//! Process-wide table of live game sessions.
//!
//! Lock order is always registry first, then a single session. Code holding
//! a session lock must never reach back into the registry.

use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use uuid::Uuid;

use crate::game::GameSession;
use crate::protocol::GameId;

/// Shared handle to one session. Operations on a session are serialized by its mutex.
pub type SessionHandle = Arc<Mutex<GameSession>>;

/// Locks a session, recovering from a poisoned lock so one panicking
/// handler cannot wedge the game for everyone else.
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, GameSession> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage abstraction for sessions.
pub trait SessionRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<SessionHandle>;

    /// Stores a session under its own id and returns the shared handle.
    fn insert(&self, session: GameSession) -> SessionHandle;

    fn remove(&self, id: &str) -> Option<SessionHandle>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh identifier not currently in use.
    fn new_game_id(&self) -> GameId {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    /// Removes every session whose idle window has passed, retiring each one
    /// so holders of stale handles back off. Returns the removed ids.
    fn expire_idle(&self, now: Instant) -> Vec<GameId>;
}

/// In-memory registry backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryRegistry {
    sessions: Mutex<HashMap<GameId, SessionHandle>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<GameId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn get(&self, id: &str) -> Option<SessionHandle> {
        self.table().get(id).cloned()
    }

    fn insert(&self, session: GameSession) -> SessionHandle {
        let id = session.id().clone();
        let handle = Arc::new(Mutex::new(session));
        self.table().insert(id, handle.clone());
        handle
    }

    fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.table().remove(id)
    }

    fn len(&self) -> usize {
        self.table().len()
    }

    fn expire_idle(&self, now: Instant) -> Vec<GameId> {
        let mut table = self.table();
        let mut expired = Vec::new();

        table.retain(|id, handle| {
            let mut session = lock_session(handle);
            if session.is_expired(now) {
                session.retire(now);
                expired.push(id.clone());
                false
            } else {
                true
            }
        });

        for id in &expired {
            info!("Game {} expired after both players left", id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeControl;
    use crate::config::SessionConfig;
    use std::time::Duration;

    fn session(registry: &InMemoryRegistry, creator: Uuid) -> GameSession {
        GameSession::create(
            registry.new_game_id(),
            creator,
            None,
            TimeControl::unlimited(),
            SessionConfig::default(),
        )
        .0
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = InMemoryRegistry::new();
        assert!(registry.is_empty());

        let handle = registry.insert(session(&registry, Uuid::new_v4()));
        let id = lock_session(&handle).id().clone();
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &handle));
        assert!(registry.get("nope").is_none());

        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_new_ids_are_distinct() {
        let registry = InMemoryRegistry::new();
        let a = registry.new_game_id();
        let b = registry.new_game_id();
        assert_ne!(a, b);
        assert!(a.len() >= 32);
    }

    #[test]
    fn test_expire_idle_removes_and_retires() {
        let registry = InMemoryRegistry::new();
        let t0 = Instant::now();
        let creator = Uuid::new_v4();
        let idle = registry.insert(session(&registry, creator));
        let busy = registry.insert(session(&registry, Uuid::new_v4()));

        lock_session(&idle).disconnect(creator, t0);

        let window = SessionConfig::default().idle_expiry;
        assert!(registry.expire_idle(t0 + window - Duration::from_secs(1)).is_empty());

        let expired = registry.expire_idle(t0 + window);
        assert_eq!(expired, vec![lock_session(&idle).id().clone()]);
        assert_eq!(registry.len(), 1);
        assert!(lock_session(&idle).is_retired());
        assert!(!lock_session(&busy).is_retired());
    }
}
