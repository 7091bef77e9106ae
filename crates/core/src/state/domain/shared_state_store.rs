use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

/// Per-client status sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientSet {
    Active,
    Paused,
    Blocked,
    Deactivated,
    PendingClose,
}

impl ClientSet {
    pub fn key(self) -> &'static str {
        match self {
            ClientSet::Active => "clients:active",
            ClientSet::Paused => "clients:paused",
            ClientSet::Blocked => "clients:blocked",
            ClientSet::Deactivated => "clients:deactivated",
            ClientSet::PendingClose => "clients:pending_close",
        }
    }
}

/// System-wide capacity signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    SystemFull,
    GpuFull,
}

impl Flag {
    pub fn key(self) -> &'static str {
        match self {
            Flag::SystemFull => "flags:system_full",
            Flag::GpuFull => "flags:gpu_full",
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Key-value store shared between the gateway, the pool manager and,
/// in multi-process deployments, other server instances.
#[async_trait]
pub trait SharedStateStore: Send + Sync {
    async fn members(&self, set: ClientSet) -> Result<HashSet<String>, StateError>;

    async fn add(&self, set: ClientSet, username: &str) -> Result<(), StateError>;

    async fn remove(&self, set: ClientSet, username: &str) -> Result<(), StateError>;

    async fn contains(&self, set: ClientSet, username: &str) -> Result<bool, StateError>;

    async fn flag(&self, flag: Flag) -> Result<bool, StateError>;

    async fn set_flag(&self, flag: Flag, value: bool) -> Result<(), StateError>;
}
