// Context blobs: a small string map keyed by an opaque context id. Loaded
// once at the start of a request, written back once when a prompt's
// saveResultTo modified it. Last writer wins across concurrent writers.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use std::sync::Arc;

const REDIS_KEY_PREFIX: &str = "pathway-gateway:context:";

/// Blobs expire after a day of inactivity; a conversation context is
/// short-lived by contract
const REDIS_BLOB_TTL_SECS: u64 = 86_400;

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, context_id: &str) -> GatewayResult<Map<String, Value>>;
    async fn save(&self, context_id: &str, blob: &Map<String, Value>) -> GatewayResult<()>;
}

/// Single-instance store backed by process memory
#[derive(Default)]
pub struct MemoryContextStore {
    blobs: DashMap<String, Map<String, Value>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn load(&self, context_id: &str) -> GatewayResult<Map<String, Value>> {
        Ok(self
            .blobs
            .get(context_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, context_id: &str, blob: &Map<String, Value>) -> GatewayResult<()> {
        self.blobs.insert(context_id.to_string(), blob.clone());
        Ok(())
    }
}

/// Shared store for multi-instance deployments
pub struct RedisContextStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisContextStore {
    pub async fn connect(redis_url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Storage(format!("invalid context Redis URL: {}", e)))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Storage(format!("context Redis connection failed: {}", e)))?;
        Ok(Self { manager })
    }

    fn key(context_id: &str) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, context_id)
    }
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn load(&self, context_id: &str) -> GatewayResult<Map<String, Value>> {
        let mut manager = self.manager.clone();
        let body: Option<String> = manager.get(Self::key(context_id)).await?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(Map::new()),
        }
    }

    async fn save(&self, context_id: &str, blob: &Map<String, Value>) -> GatewayResult<()> {
        let mut manager = self.manager.clone();
        let body = serde_json::to_string(blob)?;
        let _: () = manager
            .set_ex(Self::key(context_id), body, REDIS_BLOB_TTL_SECS)
            .await?;
        Ok(())
    }
}

pub type SharedContextStore = Arc<dyn ContextStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryContextStore::new();
        let mut blob = Map::new();
        blob.insert("styleGuide".to_string(), json!("AP"));

        store.save("ctx1", &blob).await.unwrap();
        let loaded = store.load("ctx1").await.unwrap();
        assert_eq!(loaded.get("styleGuide"), Some(&json!("AP")));
    }

    #[tokio::test]
    async fn test_memory_store_missing_context_is_empty() {
        let store = MemoryContextStore::new();
        assert!(store.load("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_last_writer_wins() {
        let store = MemoryContextStore::new();
        let mut first = Map::new();
        first.insert("k".to_string(), json!("one"));
        let mut second = Map::new();
        second.insert("k".to_string(), json!("two"));

        store.save("ctx", &first).await.unwrap();
        store.save("ctx", &second).await.unwrap();
        assert_eq!(store.load("ctx").await.unwrap().get("k"), Some(&json!("two")));
    }
}
