use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::state::domain::shared_state_store::{ClientSet, Flag, SharedStateStore, StateError};

/// Single-process store; the default when no Redis URL is configured.
#[derive(Default)]
pub struct InMemoryStateStore {
    sets: RwLock<HashMap<ClientSet, HashSet<String>>>,
    flags: RwLock<HashMap<Flag, bool>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStateStore for InMemoryStateStore {
    async fn members(&self, set: ClientSet) -> Result<HashSet<String>, StateError> {
        Ok(self.sets.read().await.get(&set).cloned().unwrap_or_default())
    }

    async fn add(&self, set: ClientSet, username: &str) -> Result<(), StateError> {
        self.sets
            .write()
            .await
            .entry(set)
            .or_default()
            .insert(username.to_string());
        Ok(())
    }

    async fn remove(&self, set: ClientSet, username: &str) -> Result<(), StateError> {
        if let Some(members) = self.sets.write().await.get_mut(&set) {
            members.remove(username);
        }
        Ok(())
    }

    async fn contains(&self, set: ClientSet, username: &str) -> Result<bool, StateError> {
        Ok(self
            .sets
            .read()
            .await
            .get(&set)
            .is_some_and(|m| m.contains(username)))
    }

    async fn flag(&self, flag: Flag) -> Result<bool, StateError> {
        Ok(self.flags.read().await.get(&flag).copied().unwrap_or(false))
    }

    async fn set_flag(&self, flag: Flag, value: bool) -> Result<(), StateError> {
        self.flags.write().await.insert(flag, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sets_are_independent() {
        let store = InMemoryStateStore::new();
        store.add(ClientSet::Paused, "alice").await.unwrap();
        assert!(store.contains(ClientSet::Paused, "alice").await.unwrap());
        assert!(!store.contains(ClientSet::Blocked, "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = InMemoryStateStore::new();
        store.add(ClientSet::Active, "bob").await.unwrap();
        store.add(ClientSet::Active, "bob").await.unwrap();
        assert_eq!(store.members(ClientSet::Active).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let store = InMemoryStateStore::new();
        store.remove(ClientSet::Active, "ghost").await.unwrap();
        assert!(store.members(ClientSet::Active).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flag_set_and_clear() {
        let store = InMemoryStateStore::new();
        store.set_flag(Flag::SystemFull, true).await.unwrap();
        assert!(store.flag(Flag::SystemFull).await.unwrap());
        store.set_flag(Flag::SystemFull, false).await.unwrap();
        assert!(!store.flag(Flag::SystemFull).await.unwrap());
    }
}
