//! In-memory session store.
//!
//! Each session sits behind its own `tokio::sync::Mutex`. A turn holds the
//! owned guard from checkout until its mutations are applied, so turns on
//! one session run one at a time while different sessions proceed in
//! parallel. The map lock is only held long enough to find or insert the
//! entry.

use deskmate_shared::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Lock a session for one turn, creating it if the id is unknown.
    pub async fn checkout(&self, id: &str) -> OwnedMutexGuard<Session> {
        let slot = match self.entry(id).await {
            Some(slot) => slot,
            None => {
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(id.to_string())
                    .or_insert_with(|| {
                        debug!("new session {}", id);
                        Arc::new(Mutex::new(Session::new(id)))
                    })
                    .clone()
            }
        };
        slot.lock_owned().await
    }

    /// Lock an existing session. `None` if the id is unknown.
    pub async fn checkout_existing(&self, id: &str) -> Option<OwnedMutexGuard<Session>> {
        let slot = self.entry(id).await?;
        Some(slot.lock_owned().await)
    }

    /// Copy of a session's current state. Waits for an in-flight turn.
    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        let slot = self.entry(id).await?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Drop a session. Returns false if it did not exist.
    pub async fn evict(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            debug!("evicted session {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_shared::Turn;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkout_creates_and_reuses() {
        let store = SessionStore::new();
        {
            let mut session = store.checkout("a").await;
            session.append(Turn::user("hello"));
        }
        let session = store.checkout("a").await;
        assert_eq!(session.turns().len(), 1);
        drop(session);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = SessionStore::new();
        assert!(store.snapshot("missing").await.is_none());
        assert!(store.checkout_existing("missing").await.is_none());
        assert!(!store.evict("missing").await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict() {
        let store = SessionStore::new();
        drop(store.checkout("a").await);
        assert!(store.evict("a").await);
        assert!(store.snapshot("a").await.is_none());
    }

    #[tokio::test]
    async fn test_turns_on_one_session_serialize() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut session = store.checkout("shared").await;
                let before = session.turns().len();
                tokio::time::sleep(Duration::from_millis(5)).await;
                session.append(Turn::user(format!("turn {}", i)));
                assert_eq!(session.turns().len(), before + 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let session = store.snapshot("shared").await.unwrap();
        assert_eq!(session.turns().len(), 8);
    }
}
