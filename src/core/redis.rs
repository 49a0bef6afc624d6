use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

/// Shared Redis connection used as a best-effort cache.
///
/// Every operation is a no-op while disconnected, so callers never have to
/// branch on whether Redis is configured.
#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let Some(mut manager) = self.manager().await else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Reads one JSON field of a hash; undecodable entries count as a miss.
    pub(crate) async fn get_field_json<T: DeserializeOwned>(
        &self,
        key: &str,
        field: &str,
    ) -> Result<Option<T>, RedisError> {
        let Some(mut manager) = self.manager().await else {
            return Ok(None);
        };

        let raw: Option<String> = manager.hget(key, field).await?;
        Ok(raw.and_then(|payload| match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, field, error = %err, "Discarding undecodable cache entry");
                None
            }
        }))
    }

    /// Writes one field and refreshes the TTL of the whole hash.
    pub(crate) async fn set_field_json<T: Serialize>(
        &self,
        key: &str,
        field: &str,
        value: &T,
        ttl_seconds: u64,
    ) -> Result<(), RedisError> {
        let Some(mut manager) = self.manager().await else {
            return Ok(());
        };

        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key, field, error = %err, "Skipping cache write for unserializable value");
                return Ok(());
            }
        };
        redis::pipe()
            .atomic()
            .hset(key, field, payload)
            .ignore()
            .expire(key, ttl_seconds as i64)
            .ignore()
            .query_async::<_, ()>(&mut manager)
            .await
    }

    pub(crate) async fn delete(&self, keys: &[String]) -> Result<(), RedisError> {
        if keys.is_empty() {
            return Ok(());
        }
        let Some(mut manager) = self.manager().await else {
            return Ok(());
        };

        manager.del::<_, ()>(keys).await
    }

    async fn manager(&self) -> Option<ConnectionManager> {
        self.manager.read().await.clone()
    }
}
