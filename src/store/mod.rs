pub mod backend;

use crate::chunking::InputFormat;
use crate::error::{GatewayError, GatewayResult};
use crate::pathway::{ChatMessage, CHAT_HISTORY_SLOT, Pathway, PathwayFlags, Prompt, PromptBody};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use backend::{LocalFileBackend, RedisBlobBackend, StorageBackend};

/// One stored prompt entry: legacy bare string or structured object
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredPrompt {
    Legacy(String),
    Structured(StructuredPrompt),
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredPrompt {
    pub name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default)]
    pub cortex_pathway_name: Option<String>,
}

/// A persisted user pathway: the compiled shape minus runtime closures,
/// plus the write-capability secret and display name
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredPathway {
    pub prompt: Vec<StoredPrompt>,
    pub secret: String,
    pub display_name: Option<String>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    #[serde(flatten)]
    pub flags: PathwayFlags,
    pub input_chunk_size: Option<usize>,
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    pub input_format: Option<InputFormat>,
    pub format: Option<String>,
}

impl StoredPathway {
    /// All-or-nothing detection: a mixed array counts as legacy
    pub fn is_structured(&self) -> bool {
        !self.prompt.is_empty()
            && self
                .prompt
                .iter()
                .all(|entry| matches!(entry, StoredPrompt::Structured(_)))
    }
}

/// The whole persisted document: userId → pathwayName → record
pub type PathwayDocument = HashMap<String, HashMap<String, StoredPathway>>;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPathwayInfo {
    pub user_id: String,
    pub name: String,
    pub display_name: Option<String>,
}

struct DocCache {
    document: PathwayDocument,
    last_modified: Option<chrono::DateTime<chrono::Utc>>,
    checked_at: Option<Instant>,
}

/// CRUD over user-owned pathways with a cached document. Writers go
/// load-modify-save with last-writer-wins; per-record secrets make
/// non-owner overwrites impossible, and the global publish key gates every
/// mutation on top.
pub struct DynamicPathwayStore {
    backend: Arc<dyn StorageBackend>,
    publish_key: Option<String>,
    default_model: String,
    poll_interval: Duration,
    cache: RwLock<DocCache>,
}

fn digest(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

impl DynamicPathwayStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        publish_key: Option<String>,
        default_model: impl Into<String>,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            backend,
            publish_key,
            default_model: default_model.into(),
            poll_interval: Duration::from_secs(poll_interval_secs),
            cache: RwLock::new(DocCache {
                document: PathwayDocument::new(),
                last_modified: None,
                checked_at: None,
            }),
        }
    }

    fn check_publish_key(&self, provided: Option<&str>) -> GatewayResult<()> {
        match (&self.publish_key, provided) {
            (None, _) => Ok(()),
            (Some(expected), Some(provided)) if digest(expected) == digest(provided) => Ok(()),
            _ => Err(GatewayError::Unauthorized(
                "a valid publish key is required for pathway mutations".to_string(),
            )),
        }
    }

    async fn load_document(&self) -> GatewayResult<PathwayDocument> {
        let value = self.backend.load().await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn save_document(&self, document: &PathwayDocument) -> GatewayResult<()> {
        self.backend
            .save(&serde_json::to_value(document)?)
            .await?;
        let mut cache = self.cache.write().await;
        cache.document = document.clone();
        cache.last_modified = self.backend.last_modified().await.ok().flatten();
        cache.checked_at = Some(Instant::now());
        Ok(())
    }

    /// Current document, refreshed when another writer bumped the
    /// backend's last-modified stamp. Load failures fall back to the last
    /// cached copy.
    pub async fn document(&self) -> PathwayDocument {
        {
            let cache = self.cache.read().await;
            if let Some(checked) = cache.checked_at {
                if checked.elapsed() < self.poll_interval {
                    return cache.document.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(checked) = cache.checked_at {
            if checked.elapsed() < self.poll_interval {
                return cache.document.clone();
            }
        }

        match self.backend.last_modified().await {
            Ok(stamp) => {
                if cache.checked_at.is_none() || stamp != cache.last_modified {
                    match self.load_document().await {
                        Ok(document) => {
                            cache.document = document;
                            cache.last_modified = stamp;
                        }
                        Err(e) => {
                            warn!(error = %e, "pathway document load failed; serving cached copy");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "pathway document stat failed; serving cached copy");
            }
        }
        cache.checked_at = Some(Instant::now());
        cache.document.clone()
    }

    /// Create or update a user pathway. The per-record secret is required
    /// at create and must match on every subsequent mutation. A
    /// `prompt_names` filter replaces only the named prompts and is
    /// rejected against legacy (bare-string) pathways.
    pub async fn put(
        &self,
        user_id: &str,
        name: &str,
        mut update: StoredPathway,
        publish_key: Option<&str>,
        prompt_names: Option<&[String]>,
    ) -> GatewayResult<()> {
        self.check_publish_key(publish_key)?;
        if update.secret.is_empty() {
            return Err(GatewayError::InvalidInput(
                "a secret is required to publish a pathway".to_string(),
            ));
        }

        let mut document = self.load_document().await?;
        let user_pathways = document.entry(user_id.to_string()).or_default();

        if let Some(existing) = user_pathways.get(name) {
            if existing.secret != update.secret {
                return Err(GatewayError::Unauthorized(format!(
                    "secret mismatch for pathway '{}'",
                    name
                )));
            }

            if let Some(names) = prompt_names {
                if !existing.is_structured() {
                    return Err(GatewayError::LegacyPathway(format!(
                        "pathway '{}' stores legacy prompts; republish it with named \
                         prompt objects before using a promptNames filter",
                        name
                    )));
                }
                update.prompt = merge_named_prompts(&existing.prompt, update.prompt, names)?;
            }
        } else if prompt_names.is_some() {
            return Err(GatewayError::PathwayNotFound(format!(
                "cannot apply a promptNames filter to unknown pathway '{}'",
                name
            )));
        }

        user_pathways.insert(name.to_string(), update);
        self.save_document(&document).await?;
        info!(user_id = %user_id, pathway = %name, "dynamic_pathway_saved");
        Ok(())
    }

    /// Remove a user pathway; removing the last one removes the namespace
    pub async fn delete(
        &self,
        user_id: &str,
        name: &str,
        secret: &str,
        publish_key: Option<&str>,
    ) -> GatewayResult<()> {
        self.check_publish_key(publish_key)?;

        let mut document = self.load_document().await?;
        let user_pathways = document.get_mut(user_id).ok_or_else(|| {
            GatewayError::PathwayNotFound(format!("{}/{}", user_id, name))
        })?;
        let existing = user_pathways.get(name).ok_or_else(|| {
            GatewayError::PathwayNotFound(format!("{}/{}", user_id, name))
        })?;
        if existing.secret != secret {
            return Err(GatewayError::Unauthorized(format!(
                "secret mismatch for pathway '{}'",
                name
            )));
        }

        user_pathways.remove(name);
        if user_pathways.is_empty() {
            document.remove(user_id);
        }
        self.save_document(&document).await?;
        info!(user_id = %user_id, pathway = %name, "dynamic_pathway_deleted");
        Ok(())
    }

    /// Materialized pathway ready for the engine, None when unknown
    pub async fn get_pathway(&self, user_id: &str, name: &str) -> Option<Pathway> {
        let document = self.document().await;
        let stored = document.get(user_id)?.get(name)?;
        Some(materialize(name, stored, &self.default_model))
    }

    /// Stored record as persisted, secret included; for owners and tests
    pub async fn get_stored(&self, user_id: &str, name: &str) -> Option<StoredPathway> {
        let document = self.document().await;
        document.get(user_id)?.get(name).cloned()
    }

    pub async fn list_pathways(&self) -> Vec<DynamicPathwayInfo> {
        let document = self.document().await;
        let mut infos: Vec<DynamicPathwayInfo> = document
            .iter()
            .flat_map(|(user_id, pathways)| {
                pathways.iter().map(move |(name, stored)| DynamicPathwayInfo {
                    user_id: user_id.clone(),
                    name: name.clone(),
                    display_name: stored.display_name.clone(),
                })
            })
            .collect();
        infos.sort_by(|a, b| (&a.user_id, &a.name).cmp(&(&b.user_id, &b.name)));
        infos
    }
}

fn merge_named_prompts(
    existing: &[StoredPrompt],
    incoming: Vec<StoredPrompt>,
    names: &[String],
) -> GatewayResult<Vec<StoredPrompt>> {
    let mut merged: Vec<StoredPrompt> = existing.to_vec();
    for entry in incoming {
        let StoredPrompt::Structured(incoming_prompt) = entry else {
            return Err(GatewayError::InvalidInput(
                "promptNames updates require structured prompt objects".to_string(),
            ));
        };
        if !names.contains(&incoming_prompt.name) {
            continue;
        }
        let slot = merged.iter_mut().find(|candidate| {
            matches!(candidate, StoredPrompt::Structured(p) if p.name == incoming_prompt.name)
        });
        match slot {
            Some(slot) => *slot = StoredPrompt::Structured(incoming_prompt),
            None => merged.push(StoredPrompt::Structured(incoming_prompt)),
        }
    }
    Ok(merged)
}

/// Materialize a stored record into an executable pathway. Each prompt
/// entry becomes a system + chat-history + user message triple, with the
/// text slot leading the user message; file hashes bubble up de-duplicated.
fn materialize(name: &str, stored: &StoredPathway, default_model: &str) -> Pathway {
    let mut pathway = Pathway::new(
        name,
        stored.model.clone().unwrap_or_else(|| default_model.to_string()),
    );
    pathway.display_name = stored.display_name.clone();
    pathway.flags = stored.flags.clone();
    pathway.input_chunk_size = stored.input_chunk_size;
    pathway.timeout_secs = stored.timeout_secs;
    pathway.temperature = stored.temperature;
    pathway.input_format = stored.input_format;
    pathway.format = stored.format.clone();

    let mut file_hashes: Vec<String> = Vec::new();
    for entry in &stored.prompt {
        let (prompt_name, prompt_text, files) = match entry {
            StoredPrompt::Legacy(text) => (None, text.clone(), Vec::new()),
            StoredPrompt::Structured(structured) => (
                Some(structured.name.clone()),
                structured.prompt.clone(),
                structured.files.clone(),
            ),
        };

        let mut messages = Vec::new();
        if let Some(system_prompt) = &stored.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.push(ChatMessage::user(CHAT_HISTORY_SLOT));
        messages.push(ChatMessage::user(format!("{{{{text}}}}\n\n{}", prompt_text)));

        let mut prompt = Prompt {
            name: prompt_name,
            body: PromptBody::Messages(messages),
            save_result_to: None,
            file_hashes: files.clone(),
        };
        for hash in files {
            if !file_hashes.contains(&hash) {
                file_hashes.push(hash);
            }
        }
        // A structured entry may delegate to another pathway by name; the
        // engine treats it as a plain prompt against this pathway's model
        if prompt.name.is_none() {
            prompt.name = Some(format!("{}[{}]", name, pathway.prompts.len()));
        }
        pathway.prompts.push(prompt);
    }
    pathway.file_hashes = file_hashes;
    pathway
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn local_store(dir: &tempfile::TempDir) -> DynamicPathwayStore {
        DynamicPathwayStore::new(
            Arc::new(LocalFileBackend::new(dir.path().join("pathways.json"))),
            Some("publish-key".to_string()),
            "gpt-4o",
            0,
        )
    }

    fn greet_pathway(secret: &str) -> StoredPathway {
        StoredPathway {
            prompt: vec![StoredPrompt::Structured(StructuredPrompt {
                name: "hi".to_string(),
                prompt: "Say hi in {{lang}}".to_string(),
                files: vec![],
                cortex_pathway_name: None,
            })],
            secret: secret.to_string(),
            display_name: Some("Greeter".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);

        store
            .put("alice", "greet", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        let stored = store.get_stored("alice", "greet").await.unwrap();
        assert_eq!(stored.secret, "s1");
        assert_eq!(stored.display_name.as_deref(), Some("Greeter"));
        assert_eq!(stored.prompt.len(), 1);

        // Secret round-trips through the on-disk document
        let on_disk: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("pathways.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk["alice"]["greet"]["secret"], "s1");
    }

    #[tokio::test]
    async fn test_mutation_requires_matching_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        store
            .put("alice", "greet", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        let err = store
            .put("alice", "greet", greet_pathway("wrong"), Some("publish-key"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));

        let err = store
            .delete("alice", "greet", "wrong", Some("publish-key"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_mutation_requires_publish_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        let err = store
            .put("alice", "greet", greet_pathway("s1"), Some("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));

        let err = store
            .put("alice", "greet", greet_pathway("s1"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_missing_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        let err = store
            .put("alice", "greet", greet_pathway(""), Some("publish-key"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_empty_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        store
            .put("alice", "greet", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        store
            .delete("alice", "greet", "s1", Some("publish-key"))
            .await
            .unwrap();

        let document = store.document().await;
        assert!(!document.contains_key("alice"));
    }

    #[tokio::test]
    async fn test_prompt_names_filter_rejects_legacy_pathway() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);

        let legacy = StoredPathway {
            prompt: vec![StoredPrompt::Legacy("old style {{text}}".to_string())],
            secret: "s1".to_string(),
            ..Default::default()
        };
        store
            .put("alice", "old", legacy, Some("publish-key"), None)
            .await
            .unwrap();

        let names = vec!["hi".to_string()];
        let err = store
            .put(
                "alice",
                "old",
                greet_pathway("s1"),
                Some("publish-key"),
                Some(&names),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LegacyPathway(_)));
    }

    #[tokio::test]
    async fn test_prompt_names_filter_merges_named_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);

        let mut initial = greet_pathway("s1");
        initial.prompt.push(StoredPrompt::Structured(StructuredPrompt {
            name: "bye".to_string(),
            prompt: "Say bye in {{lang}}".to_string(),
            files: vec![],
            cortex_pathway_name: None,
        }));
        store
            .put("alice", "greet", initial, Some("publish-key"), None)
            .await
            .unwrap();

        let mut update = greet_pathway("s1");
        update.prompt = vec![StoredPrompt::Structured(StructuredPrompt {
            name: "hi".to_string(),
            prompt: "Say hello warmly in {{lang}}".to_string(),
            files: vec![],
            cortex_pathway_name: None,
        })];
        let names = vec!["hi".to_string()];
        store
            .put("alice", "greet", update, Some("publish-key"), Some(&names))
            .await
            .unwrap();

        let stored = store.get_stored("alice", "greet").await.unwrap();
        assert_eq!(stored.prompt.len(), 2);
        let StoredPrompt::Structured(first) = &stored.prompt[0] else {
            panic!("expected structured prompt");
        };
        assert_eq!(first.prompt, "Say hello warmly in {{lang}}");
        let StoredPrompt::Structured(second) = &stored.prompt[1] else {
            panic!("expected structured prompt");
        };
        assert_eq!(second.prompt, "Say bye in {{lang}}");
    }

    #[tokio::test]
    async fn test_materialized_message_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);

        let mut record = greet_pathway("s1");
        record.system_prompt = Some("You are terse.".to_string());
        store
            .put("alice", "greet", record, Some("publish-key"), None)
            .await
            .unwrap();

        let pathway = store.get_pathway("alice", "greet").await.unwrap();
        assert_eq!(pathway.prompts.len(), 1);
        let PromptBody::Messages(messages) = &pathway.prompts[0].body else {
            panic!("expected a message prompt");
        };
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "You are terse.");
        assert_eq!(messages[1].content, CHAT_HISTORY_SLOT);
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content, "{{text}}\n\nSay hi in {{lang}}");
    }

    #[tokio::test]
    async fn test_file_hashes_bubble_up_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);

        let record = StoredPathway {
            prompt: vec![
                StoredPrompt::Structured(StructuredPrompt {
                    name: "a".to_string(),
                    prompt: "use the file".to_string(),
                    files: vec!["hash1".to_string(), "hash2".to_string()],
                    cortex_pathway_name: None,
                }),
                StoredPrompt::Structured(StructuredPrompt {
                    name: "b".to_string(),
                    prompt: "use it again".to_string(),
                    files: vec!["hash2".to_string()],
                    cortex_pathway_name: None,
                }),
            ],
            secret: "s1".to_string(),
            ..Default::default()
        };
        store
            .put("alice", "files", record, Some("publish-key"), None)
            .await
            .unwrap();

        let pathway = store.get_pathway("alice", "files").await.unwrap();
        assert_eq!(pathway.file_hashes, vec!["hash1", "hash2"]);
    }

    #[tokio::test]
    async fn test_concurrent_writer_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let reader = local_store(&dir);
        let writer = local_store(&dir);

        // Prime the reader's cache with the empty document
        assert!(reader.get_pathway("alice", "greet").await.is_none());

        writer
            .put("alice", "greet", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        // Zero poll interval: the next access re-stats and reloads
        assert!(reader.get_pathway("alice", "greet").await.is_some());
    }

    #[tokio::test]
    async fn test_publish_then_execute() {
        use crate::bus::PubSubBus;
        use crate::callbacks::ClientToolCallbacks;
        use crate::context::MemoryContextStore;
        use crate::engine::{PathwayEngine, ResolveOutcome};
        use crate::plugins::{PluginRegistry, mock::ScriptedPlugin};
        use crate::registry::RequestRegistry;
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        store
            .put("alice", "greet", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        let plugin = Arc::new(ScriptedPlugin::new());
        let bus = PubSubBus::local_only();
        let engine = PathwayEngine::new(
            RequestRegistry::new(300),
            bus.clone(),
            ClientToolCallbacks::new(bus, 60),
            Arc::new(MemoryContextStore::new()),
            PluginRegistry::new(plugin.clone()),
            30,
        );

        let mut pathway = store.get_pathway("alice", "greet").await.unwrap();
        pathway.model = "scripted".to_string();
        let outcome = engine
            .resolve(
                &Arc::new(pathway),
                [("lang".to_string(), json!("fr"))].into_iter().collect(),
            )
            .await
            .unwrap();
        let ResolveOutcome::Value(value) = outcome else {
            panic!("expected a synchronous value");
        };

        // The stored prompt compiled with the substituted language
        assert_eq!(value, json!("echo:\n\nSay hi in fr"));
        assert_eq!(plugin.call_count(), 1);
    }

    #[tokio::test]
    async fn test_list_pathways_is_sorted_and_secret_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(&dir);
        store
            .put("bob", "b", greet_pathway("s2"), Some("publish-key"), None)
            .await
            .unwrap();
        store
            .put("alice", "a", greet_pathway("s1"), Some("publish-key"), None)
            .await
            .unwrap();

        let infos = store.list_pathways().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].user_id, "alice");
        assert_eq!(infos[1].user_id, "bob");
        let listed = serde_json::to_string(&infos).unwrap();
        assert!(!listed.contains("secret"));
    }
}
