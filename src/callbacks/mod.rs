// Client-tool callback registry: pathways that hand a tool invocation to
// the caller suspend here until the result arrives on a second call,
// possibly landing on a different instance. Resolution fans out over the
// shared bus; only the instance holding the live waiter completes it.

use crate::bus::{CLIENT_TOOL_CALLBACKS, PubSubBus};
use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct PendingCallback {
    request_id: String,
    created_at: DateTime<Utc>,
    sender: oneshot::Sender<Value>,
}

#[derive(Clone)]
pub struct ClientToolCallbacks {
    pending: Arc<DashMap<String, PendingCallback>>,
    bus: PubSubBus,
    default_timeout: std::time::Duration,
}

impl ClientToolCallbacks {
    pub fn new(bus: PubSubBus, default_timeout_secs: u64) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            bus,
            default_timeout: std::time::Duration::from_secs(default_timeout_secs),
        }
    }

    /// Attach the cross-instance listener. Every instance attempts local
    /// resolution for every fanned-out callback; non-owners no-op.
    pub fn start_listener(&self) {
        let registry = self.clone();
        let mut subscription = self.bus.subscribe(CLIENT_TOOL_CALLBACKS, None);
        tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(callback_id) = message.get("callbackId").and_then(Value::as_str) else {
                    continue;
                };
                let result = message.get("result").cloned().unwrap_or(Value::Null);
                registry.resolve_local(callback_id, result);
            }
        });
    }

    /// Suspend until `resolve` is invoked for `callback_id`, or the timeout
    /// elapses. Each callback id supports a single waiter.
    pub async fn await_callback(
        &self,
        callback_id: &str,
        request_id: &str,
        timeout: Option<std::time::Duration>,
    ) -> GatewayResult<Value> {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            callback_id.to_string(),
            PendingCallback {
                request_id: request_id.to_string(),
                created_at: Utc::now(),
                sender,
            },
        );
        debug!(callback_id = %callback_id, request_id = %request_id, "client_tool_waiting");

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::Callback(format!(
                "callback '{}' was rejected before a result arrived",
                callback_id
            ))),
            Err(_) => {
                self.pending.remove(callback_id);
                Err(GatewayError::Callback(format!(
                    "callback '{}' timed out after {}s",
                    callback_id,
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Resolve on this instance only. Returns true when a live waiter was
    /// completed here.
    pub fn resolve_local(&self, callback_id: &str, result: Value) -> bool {
        match self.pending.remove(callback_id) {
            Some((_, pending)) => {
                info!(
                    callback_id = %callback_id,
                    request_id = %pending.request_id,
                    "client_tool_resolved"
                );
                pending.sender.send(result).is_ok()
            }
            None => false,
        }
    }

    /// Resolve a callback wherever its waiter lives: locally first, then
    /// fanned out over the shared bus for the other instances
    pub fn resolve(&self, callback_id: &str, result: Value) -> bool {
        let resolved_here = self.resolve_local(callback_id, result.clone());
        self.bus.publish(
            CLIENT_TOOL_CALLBACKS,
            Some(callback_id),
            json!({ "callbackId": callback_id, "result": result }),
        );
        resolved_here
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reject waiters older than the watchdog threshold
    pub fn reject_stale(&self, max_age_secs: u64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(max_age_secs as i64);
        let before = self.pending.len();
        self.pending.retain(|callback_id, pending| {
            let fresh = pending.created_at > cutoff;
            if !fresh {
                warn!(
                    callback_id = %callback_id,
                    request_id = %pending.request_id,
                    "client_tool_callback_expired"
                );
            }
            fresh
        });
        before - self.pending.len()
    }
}

/// Watchdog sweep rejecting callbacks that outlived the configured age
pub fn start_cleanup_task(registry: ClientToolCallbacks, interval_secs: u64, max_age_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            registry.reject_stale(max_age_secs);
        }
    });
}
