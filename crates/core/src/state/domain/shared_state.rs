use std::collections::HashSet;
use std::sync::Arc;

use super::shared_state_store::{ClientSet, Flag, SharedStateStore, StateError};

/// Everything the gateway monitor and pool manager read in one pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateSnapshot {
    pub active: HashSet<String>,
    pub paused: HashSet<String>,
    pub blocked: HashSet<String>,
    pub deactivated: HashSet<String>,
    pub pending_close: HashSet<String>,
    pub system_full: bool,
    pub gpu_full: bool,
}

impl StateSnapshot {
    /// Active clients that are not held back by any status.
    pub fn schedulable(&self) -> HashSet<String> {
        self.active
            .iter()
            .filter(|u| {
                !self.paused.contains(*u)
                    && !self.blocked.contains(*u)
                    && !self.deactivated.contains(*u)
            })
            .cloned()
            .collect()
    }
}

/// Typed access to the shared state keys.
#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn SharedStateStore>,
}

impl SharedState {
    pub fn new(store: Arc<dyn SharedStateStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot, StateError> {
        Ok(StateSnapshot {
            active: self.store.members(ClientSet::Active).await?,
            paused: self.store.members(ClientSet::Paused).await?,
            blocked: self.store.members(ClientSet::Blocked).await?,
            deactivated: self.store.members(ClientSet::Deactivated).await?,
            pending_close: self.store.members(ClientSet::PendingClose).await?,
            system_full: self.store.flag(Flag::SystemFull).await?,
            gpu_full: self.store.flag(Flag::GpuFull).await?,
        })
    }

    pub async fn active_clients(&self) -> Result<HashSet<String>, StateError> {
        self.store.members(ClientSet::Active).await
    }

    pub async fn mark_active(&self, username: &str) -> Result<(), StateError> {
        self.store.add(ClientSet::Active, username).await
    }

    pub async fn mark_inactive(&self, username: &str) -> Result<(), StateError> {
        self.store.remove(ClientSet::Active, username).await
    }

    pub async fn is_paused(&self, username: &str) -> Result<bool, StateError> {
        self.store.contains(ClientSet::Paused, username).await
    }

    pub async fn is_blocked(&self, username: &str) -> Result<bool, StateError> {
        self.store.contains(ClientSet::Blocked, username).await
    }

    pub async fn is_deactivated(&self, username: &str) -> Result<bool, StateError> {
        self.store.contains(ClientSet::Deactivated, username).await
    }

    /// Adds or removes `username` from a status set.
    pub async fn set_status(
        &self,
        set: ClientSet,
        username: &str,
        member: bool,
    ) -> Result<(), StateError> {
        if member {
            self.store.add(set, username).await
        } else {
            self.store.remove(set, username).await
        }
    }

    pub async fn pending_close(&self) -> Result<HashSet<String>, StateError> {
        self.store.members(ClientSet::PendingClose).await
    }

    pub async fn request_close(&self, username: &str) -> Result<(), StateError> {
        self.store.add(ClientSet::PendingClose, username).await
    }

    pub async fn clear_pending_close(&self, username: &str) -> Result<(), StateError> {
        self.store.remove(ClientSet::PendingClose, username).await
    }

    pub async fn system_full(&self) -> Result<bool, StateError> {
        self.store.flag(Flag::SystemFull).await
    }

    pub async fn set_system_full(&self, full: bool) -> Result<(), StateError> {
        self.store.set_flag(Flag::SystemFull, full).await
    }

    pub async fn gpu_full(&self) -> Result<bool, StateError> {
        self.store.flag(Flag::GpuFull).await
    }

    pub async fn set_gpu_full(&self, full: bool) -> Result<(), StateError> {
        self.store.set_flag(Flag::GpuFull, full).await
    }
}
