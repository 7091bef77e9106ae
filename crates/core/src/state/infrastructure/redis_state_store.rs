use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::state::domain::shared_state_store::{ClientSet, Flag, SharedStateStore, StateError};

pub const DEFAULT_KEY_PREFIX: &str = "deskguard";

/// Redis-backed store for deployments running several server processes.
///
/// Status sets are Redis sets, flags are `"1"`/`"0"` strings; every key is
/// namespaced as `<prefix>:<key>`.
pub struct RedisStateStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StateError> {
        let client = redis::Client::open(redis_url).map_err(backend)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        log::info!("Connected to shared state at {redis_url}");
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

fn backend(e: redis::RedisError) -> StateError {
    StateError::Backend(Box::new(e))
}

#[async_trait]
impl SharedStateStore for RedisStateStore {
    async fn members(&self, set: ClientSet) -> Result<HashSet<String>, StateError> {
        let mut con = self.connection.clone();
        let members: HashSet<String> = con.smembers(self.key(set.key())).await.map_err(backend)?;
        Ok(members)
    }

    async fn add(&self, set: ClientSet, username: &str) -> Result<(), StateError> {
        let mut con = self.connection.clone();
        let _: () = con
            .sadd(self.key(set.key()), username)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn remove(&self, set: ClientSet, username: &str) -> Result<(), StateError> {
        let mut con = self.connection.clone();
        let _: () = con
            .srem(self.key(set.key()), username)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn contains(&self, set: ClientSet, username: &str) -> Result<bool, StateError> {
        let mut con = self.connection.clone();
        let member: bool = con
            .sismember(self.key(set.key()), username)
            .await
            .map_err(backend)?;
        Ok(member)
    }

    async fn flag(&self, flag: Flag) -> Result<bool, StateError> {
        let mut con = self.connection.clone();
        let value: Option<String> = con.get(self.key(flag.key())).await.map_err(backend)?;
        Ok(value.as_deref() == Some("1"))
    }

    async fn set_flag(&self, flag: Flag, value: bool) -> Result<(), StateError> {
        let mut con = self.connection.clone();
        let encoded = if value { "1" } else { "0" };
        let _: () = con
            .set(self.key(flag.key()), encoded)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
