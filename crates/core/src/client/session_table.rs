use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::session::Session;

/// Live sessions keyed by username. At most one session per username.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` unless its username already has a live session.
    pub fn try_insert(&self, session: Arc<Session>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(session.username()) {
            return false;
        }
        map.insert(session.username().to_string(), session);
        true
    }

    /// Removes `session` if it is still the registered one for its username.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(session.username()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                map.remove(session.username());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, username: &str) -> Option<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::identity_verifier::ReferenceImage;
    use crate::shared::frame::Frame;
    use tokio::sync::mpsc;

    fn session(name: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session::new(
            ReferenceImage {
                username: name.into(),
                frame: Arc::new(Frame::new(vec![0; 3], 1, 1, 3, 0)),
            },
            tx,
        ))
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let table = SessionTable::new();
        assert!(table.try_insert(session("alice")));
        assert!(!table.try_insert(session("alice")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_session_cannot_remove_newer_one() {
        let table = SessionTable::new();
        let old = session("bob");
        assert!(table.try_insert(old.clone()));
        assert!(table.remove(&old));

        let new = session("bob");
        assert!(table.try_insert(new.clone()));
        assert!(!table.remove(&old));
        assert!(table.contains("bob"));
    }
}
