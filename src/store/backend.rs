// Storage backends for the dynamic-pathway document: one JSON blob,
// human-readable, living at `pathways.json` (or the equivalent Redis key).
// Backends only move the document; the store owns its semantics.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the whole document, creating an empty one on first use
    async fn load(&self) -> GatewayResult<Value>;

    async fn save(&self, document: &Value) -> GatewayResult<()>;

    /// Timestamp of the last save by any writer, None before first use
    async fn last_modified(&self) -> GatewayResult<Option<DateTime<Utc>>>;
}

/// Local-file backend; the document is operator-diffable pretty JSON
pub struct LocalFileBackend {
    path: PathBuf,
}

impl LocalFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalFileBackend {
    async fn load(&self) -> GatewayResult<Value> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "creating empty pathway document");
                let empty = Value::Object(serde_json::Map::new());
                self.save(&empty).await?;
                Ok(empty)
            }
            Err(e) => Err(GatewayError::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, document: &Value) -> GatewayResult<()> {
        let body = serde_json::to_string_pretty(document)?;
        tokio::fs::write(&self.path, body).await.map_err(|e| {
            GatewayError::Storage(format!("failed to write {}: {}", self.path.display(), e))
        })
    }

    async fn last_modified(&self) -> GatewayResult<Option<DateTime<Utc>>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => {
                let modified = metadata.modified().map_err(|e| {
                    GatewayError::Storage(format!("mtime unavailable: {}", e))
                })?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::Storage(format!(
                "failed to stat {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Redis-blob backend for shared storage across instances. The document
/// and its last-modified stamp live under sibling keys.
pub struct RedisBlobBackend {
    manager: redis::aio::ConnectionManager,
    key: String,
}

impl RedisBlobBackend {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> GatewayResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Storage(format!("invalid storage Redis URL: {}", e)))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| {
                GatewayError::Storage(format!("storage Redis connection failed: {}", e))
            })?;
        Ok(Self {
            manager,
            key: key.into(),
        })
    }

    fn stamp_key(&self) -> String {
        format!("{}:last-modified", self.key)
    }
}

#[async_trait]
impl StorageBackend for RedisBlobBackend {
    async fn load(&self) -> GatewayResult<Value> {
        let mut manager = self.manager.clone();
        let body: Option<String> = manager.get(&self.key).await?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => {
                info!(key = %self.key, "creating empty pathway document");
                let empty = Value::Object(serde_json::Map::new());
                self.save(&empty).await?;
                Ok(empty)
            }
        }
    }

    async fn save(&self, document: &Value) -> GatewayResult<()> {
        let mut manager = self.manager.clone();
        let body = serde_json::to_string_pretty(document)?;
        let _: () = manager.set(&self.key, body).await?;
        let _: () = manager
            .set(self.stamp_key(), Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    async fn last_modified(&self) -> GatewayResult<Option<DateTime<Utc>>> {
        let mut manager = self.manager.clone();
        let stamp: Option<String> = manager.get(self.stamp_key()).await?;
        Ok(stamp
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_backend_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("pathways.json"));

        assert!(backend.last_modified().await.unwrap().is_none());
        let document = backend.load().await.unwrap();
        assert_eq!(document, json!({}));
        assert!(backend.last_modified().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_local_backend_round_trips_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pathways.json");
        let backend = LocalFileBackend::new(&path);

        let document = json!({"alice": {"greet": {"secret": "s1", "prompt": ["hi"]}}});
        backend.save(&document).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), document);

        // Operator-diffable on disk: indented, one field per line
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("\n  \"alice\""));
    }
}
