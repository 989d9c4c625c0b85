// Per-request lifecycle registry: progress counters, cancel flag, args
// snapshot, and the deferred starter for async requests. The only broadly
// shared mutable structure in the process; every operation is atomic per
// request id.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deferred closure that begins resolution for an async request. Invoked at
/// most once, when the first subscriber attaches or the front door pulls it.
pub type RequestStarter = Box<dyn FnOnce() + Send + 'static>;

/// Grace period a finished record lingers for, so late subscribers still
/// observe the terminal state
const FINISHED_GRACE_SECS: i64 = 30;

#[derive(Clone)]
pub struct RequestRecord {
    pub id: String,
    pub pathway_name: String,
    pub args: Map<String, Value>,
    pub total_count: usize,
    pub completed_count: usize,
    pub started: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub cancellation_token: CancellationToken,
    starter: Arc<Mutex<Option<RequestStarter>>>,
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("pathway_name", &self.pathway_name)
            .field("total_count", &self.total_count)
            .field("completed_count", &self.completed_count)
            .field("started", &self.started)
            .field("canceled", &self.cancellation_token.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct RequestRegistry {
    requests: Arc<DashMap<String, RequestRecord>>,
    idle_timeout: Duration,
}

impl RequestRegistry {
    pub fn new(idle_timeout_secs: u64) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            idle_timeout: Duration::seconds(idle_timeout_secs as i64),
        }
    }

    /// Create a record for a new request
    pub fn create(&self, id: &str, pathway_name: &str, args: Map<String, Value>) -> RequestRecord {
        let record = RequestRecord {
            id: id.to_string(),
            pathway_name: pathway_name.to_string(),
            args,
            total_count: 0,
            completed_count: 0,
            started: false,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
            warnings: Vec::new(),
            cancellation_token: CancellationToken::new(),
            starter: Arc::new(Mutex::new(None)),
        };
        self.requests.insert(id.to_string(), record.clone());
        debug!(request_id = %id, pathway = %pathway_name, "request_created");
        record
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        self.requests.get(id).map(|entry| entry.value().clone())
    }

    /// Attach the deferred starter for an async request
    pub fn set_starter(&self, id: &str, starter: RequestStarter) {
        if let Some(entry) = self.requests.get(id) {
            if let Ok(mut slot) = entry.starter.lock() {
                *slot = Some(starter);
            }
        }
    }

    /// Take the starter, if it has not been pulled yet. The caller invokes
    /// it outside any registry lock.
    pub fn take_starter(&self, id: &str) -> Option<RequestStarter> {
        let entry = self.requests.get(id)?;
        entry.starter.lock().ok()?.take()
    }

    pub fn mark_started(&self, id: &str) {
        if let Some(mut entry) = self.requests.get_mut(id) {
            entry.started = true;
        }
    }

    pub fn set_total(&self, id: &str, total: usize) {
        if let Some(mut entry) = self.requests.get_mut(id) {
            entry.total_count = total;
        }
    }

    /// Increment the completed counter, returning (completed, total)
    pub fn increment_completed(&self, id: &str) -> Option<(usize, usize)> {
        let mut entry = self.requests.get_mut(id)?;
        entry.completed_count += 1;
        Some((entry.completed_count, entry.total_count))
    }

    /// Flip the cancel flag. The engine observes it before the next
    /// dispatch; an in-flight dispatch finishes but its result is discarded.
    pub fn cancel(&self, id: &str) -> bool {
        if let Some(entry) = self.requests.get(id) {
            entry.cancellation_token.cancel();
            info!(request_id = %id, "request_cancel_requested");
            true
        } else {
            false
        }
    }

    pub fn is_canceled(&self, id: &str) -> bool {
        self.requests
            .get(id)
            .map(|entry| entry.cancellation_token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn set_result(&self, id: &str, result: Value) {
        if let Some(mut entry) = self.requests.get_mut(id) {
            entry.result = Some(result);
            entry.finished_at = Some(Utc::now());
        }
    }

    pub fn set_error(&self, id: &str, error: &str) {
        if let Some(mut entry) = self.requests.get_mut(id) {
            entry.error = Some(error.to_string());
            entry.finished_at = Some(Utc::now());
        }
    }

    pub fn add_warning(&self, id: &str, warning: &str) {
        if let Some(mut entry) = self.requests.get_mut(id) {
            warn!(request_id = %id, warning = %warning, "request_warning");
            entry.warnings.push(warning.to_string());
        }
    }

    pub fn delete(&self, id: &str) -> Option<RequestRecord> {
        self.requests.remove(id).map(|(_, record)| record)
    }

    pub fn active_count(&self) -> usize {
        self.requests.len()
    }

    /// Purge finished records past their grace period and idle records past
    /// the configured timeout
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let grace = Duration::seconds(FINISHED_GRACE_SECS);
        let before = self.requests.len();
        self.requests.retain(|_, record| match record.finished_at {
            Some(finished) => now - finished < grace,
            None => now - record.created_at < self.idle_timeout,
        });
        let removed = before - self.requests.len();
        if removed > 0 {
            debug!(removed = removed, "request_registry_swept");
        }
        removed
    }
}

/// Background sweep purging expired records
pub fn start_cleanup_task(registry: RequestRegistry, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            registry.cleanup_expired();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("text".to_string(), json!("hello"));
        map
    }

    #[test]
    fn test_create_and_get() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", args());
        let record = registry.get("r1").unwrap();
        assert_eq!(record.pathway_name, "chat");
        assert!(!record.started);
        assert_eq!(record.args.get("text"), Some(&json!("hello")));
    }

    #[test]
    fn test_progress_counters() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", Map::new());
        registry.set_total("r1", 4);
        assert_eq!(registry.increment_completed("r1"), Some((1, 4)));
        assert_eq!(registry.increment_completed("r1"), Some((2, 4)));
        let record = registry.get("r1").unwrap();
        assert_eq!(record.completed_count, 2);
    }

    #[test]
    fn test_cancel_flag_is_observable() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", Map::new());
        assert!(!registry.is_canceled("r1"));
        assert!(registry.cancel("r1"));
        assert!(registry.is_canceled("r1"));
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_starter_taken_once() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", Map::new());
        registry.set_starter("r1", Box::new(|| {}));
        assert!(registry.take_starter("r1").is_some());
        assert!(registry.take_starter("r1").is_none());
    }

    #[test]
    fn test_cleanup_keeps_fresh_records() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", Map::new());
        assert_eq!(registry.cleanup_expired(), 0);
        assert!(registry.get("r1").is_some());
    }

    #[test]
    fn test_delete() {
        let registry = RequestRegistry::new(300);
        registry.create("r1", "chat", Map::new());
        assert!(registry.delete("r1").is_some());
        assert!(registry.get("r1").is_none());
    }
}
