pub mod broker;
pub mod redis_mirror;

use crate::error::GatewayResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub use broker::{BusSubscription, LocalBroker};
pub use redis_mirror::RedisMirror;

/// Progress events for in-flight requests, keyed by request id
pub const REQUEST_PROGRESS: &str = "REQUEST_PROGRESS";
/// Client-tool callback resolutions fanned out to every instance
pub const CLIENT_TOOL_CALLBACKS: &str = "CLIENT_TOOL_CALLBACKS";

/// Terminal data marker for streamed paths
pub const DONE_MARKER: &str = "[DONE]";

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: String,
    pub progress: f64,
    pub data: Option<Value>,
    pub status: Option<String>,
    pub info: Option<String>,
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn progress(request_id: &str, completed: usize, total: usize) -> Self {
        let total = total.max(1);
        Self {
            request_id: request_id.to_string(),
            progress: (completed as f64 / total as f64).min(1.0),
            ..Default::default()
        }
    }

    /// Incremental data (a streamed delta or a finished chunk result)
    pub fn data(request_id: &str, completed: usize, total: usize, data: Value) -> Self {
        let mut event = Self::progress(request_id, completed, total);
        event.data = Some(data);
        event
    }

    /// Terminal success event; streamed paths carry the `[DONE]` marker
    pub fn done(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            progress: 1.0,
            data: Some(Value::String(DONE_MARKER.to_string())),
            ..Default::default()
        }
    }

    pub fn canceled(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            progress: 1.0,
            data: Some(Value::String(DONE_MARKER.to_string())),
            status: Some("canceled".to_string()),
            ..Default::default()
        }
    }

    pub fn timed_out(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            progress: 1.0,
            data: Some(Value::String(DONE_MARKER.to_string())),
            status: Some("timed_out".to_string()),
            error: Some("request timed out".to_string()),
            ..Default::default()
        }
    }

    pub fn failed(request_id: &str, error: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            progress: 1.0,
            data: Some(Value::String(DONE_MARKER.to_string())),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Terminal events carry the `[DONE]` marker, a status, or an error;
    /// a bare progress of 1.0 is still an intermediate completion
    pub fn is_terminal(&self) -> bool {
        self.data.as_ref().and_then(Value::as_str) == Some(DONE_MARKER)
            || self.error.is_some()
            || self.status.is_some()
    }
}

/// The process-wide bus: a local broker, optionally mirrored across
/// instances through Redis. Publish failures never propagate to callers;
/// the primary return value of a request does not depend on delivery.
#[derive(Clone)]
pub struct PubSubBus {
    broker: Arc<LocalBroker>,
    mirror: Option<RedisMirror>,
    instance_id: String,
}

impl PubSubBus {
    /// Single-instance mode: the in-process broker only
    pub fn local_only() -> Self {
        Self {
            broker: Arc::new(LocalBroker::new()),
            mirror: None,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Multi-instance mode: mirror every publish through the shared Redis
    /// channel and re-inject foreign events locally
    pub async fn with_redis(redis_url: &str) -> GatewayResult<Self> {
        let broker = Arc::new(LocalBroker::new());
        let instance_id = Uuid::new_v4().to_string();
        let mirror = redis_mirror::start(
            redis_url,
            &[REQUEST_PROGRESS, CLIENT_TOOL_CALLBACKS],
            Arc::clone(&broker),
            instance_id.clone(),
        )
        .await?;
        Ok(Self {
            broker,
            mirror: Some(mirror),
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn publish(&self, topic: &str, key: Option<&str>, payload: Value) {
        self.broker.publish(topic, key, &payload);
        if let Some(mirror) = &self.mirror {
            mirror.forward(topic, key, payload);
        }
    }

    pub fn publish_progress(&self, event: &ProgressEvent) {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish(REQUEST_PROGRESS, Some(&event.request_id), payload),
            Err(e) => tracing::error!(error = %e, "progress event serialization failed"),
        }
    }

    pub fn subscribe(&self, topic: &str, filter: Option<HashSet<String>>) -> BusSubscription {
        self.broker.subscribe(topic, filter)
    }

    /// Subscribe to one request's progress events
    pub fn subscribe_request(&self, request_id: &str) -> BusSubscription {
        let filter: HashSet<String> = [request_id.to_string()].into_iter().collect();
        self.broker.subscribe(REQUEST_PROGRESS, Some(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_event_shape() {
        let event = ProgressEvent::data("r1", 1, 4, json!("partial"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["progress"], 0.25);
        assert_eq!(value["data"], "partial");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_terminal_events() {
        assert!(ProgressEvent::done("r1").is_terminal());
        assert!(ProgressEvent::canceled("r1").is_terminal());
        assert!(ProgressEvent::timed_out("r1").is_terminal());
        assert!(ProgressEvent::failed("r1", "boom").is_terminal());
        assert!(!ProgressEvent::progress("r1", 1, 4).is_terminal());
        assert_eq!(
            ProgressEvent::done("r1").data,
            Some(Value::String(DONE_MARKER.to_string()))
        );
    }

    #[tokio::test]
    async fn test_request_subscription_filters() {
        let bus = PubSubBus::local_only();
        let mut sub = bus.subscribe_request("r1");

        bus.publish_progress(&ProgressEvent::progress("r2", 1, 2));
        bus.publish_progress(&ProgressEvent::progress("r1", 1, 2));

        let event = sub.recv().await.unwrap();
        assert_eq!(event["requestId"], "r1");
    }

    #[tokio::test]
    async fn test_zero_total_guard() {
        let event = ProgressEvent::progress("r1", 0, 0);
        assert_eq!(event.progress, 0.0);
    }
}
