// Cross-instance mirror: every local publish is forwarded onto a shared
// Redis pub/sub channel, and inbound foreign messages are re-injected into
// the local broker. Envelopes carry the origin instance id so a publisher
// never re-delivers its own events.

use crate::bus::broker::LocalBroker;
use crate::error::{GatewayError, GatewayResult};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const CHANNEL_PREFIX: &str = "pathway-gateway";
const OUTBOUND_QUEUE_DEPTH: usize = 1024;

fn channel_for(topic: &str) -> String {
    format!("{}:{}", CHANNEL_PREFIX, topic)
}

fn topic_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(CHANNEL_PREFIX)?.strip_prefix(':')
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    instance_id: String,
    key: Option<String>,
    payload: Value,
}

/// Handle to the outbound half of the mirror. Forwarding is fire-and-forget;
/// a full queue drops the event with a warning, matching the bus delivery
/// contract.
#[derive(Clone)]
pub struct RedisMirror {
    outbound: mpsc::Sender<(String, Option<String>, Value)>,
}

impl RedisMirror {
    pub fn forward(&self, topic: &str, key: Option<&str>, payload: Value) {
        let item = (topic.to_string(), key.map(str::to_string), payload);
        if let Err(e) = self.outbound.try_send(item) {
            warn!(error = %e, "mirror outbound queue full, dropping event");
        }
    }
}

/// Connect the mirror: one task publishing local events to Redis, one task
/// re-injecting foreign events into the local broker. The topics mirrored
/// are fixed at startup.
pub async fn start(
    redis_url: &str,
    topics: &[&str],
    broker: Arc<LocalBroker>,
    instance_id: String,
) -> GatewayResult<RedisMirror> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| GatewayError::Bus(format!("invalid bus Redis URL: {}", e)))?;
    let mut manager = redis::aio::ConnectionManager::new(client.clone())
        .await
        .map_err(|e| GatewayError::Bus(format!("bus Redis connection failed: {}", e)))?;

    let (outbound, mut outbound_rx) =
        mpsc::channel::<(String, Option<String>, Value)>(OUTBOUND_QUEUE_DEPTH);

    // Outbound: local publishes fan out to the shared channel
    let outbound_instance = instance_id.clone();
    tokio::spawn(async move {
        while let Some((topic, key, payload)) = outbound_rx.recv().await {
            let envelope = Envelope {
                instance_id: outbound_instance.clone(),
                key,
                payload,
            };
            let body = match serde_json::to_string(&envelope) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "mirror envelope serialization failed");
                    continue;
                }
            };
            let publish: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
                .arg(channel_for(&topic))
                .arg(&body)
                .query_async(&mut manager)
                .await;
            if let Err(e) = publish {
                warn!(topic = %topic, error = %e, "mirror publish failed, event dropped");
            }
        }
    });

    // Inbound: foreign publishes re-enter the local broker
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| GatewayError::Bus(format!("bus Redis pubsub failed: {}", e)))?;
    for topic in topics {
        pubsub
            .subscribe(channel_for(topic))
            .await
            .map_err(|e| GatewayError::Bus(format!("bus Redis subscribe failed: {}", e)))?;
    }

    tokio::spawn(async move {
        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let channel = message.get_channel_name().to_string();
            let Some(topic) = topic_from_channel(&channel) else {
                continue;
            };
            let body: String = match message.get_payload() {
                Ok(body) => body,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "mirror inbound payload unreadable");
                    continue;
                }
            };
            let envelope: Envelope = match serde_json::from_str(&body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "mirror inbound envelope malformed");
                    continue;
                }
            };
            if envelope.instance_id == instance_id {
                continue;
            }
            debug!(topic = %topic, origin = %envelope.instance_id, "mirror event re-injected");
            broker.publish(topic, envelope.key.as_deref(), &envelope.payload);
        }
        warn!("mirror inbound stream ended; cross-instance events stop flowing");
    });

    Ok(RedisMirror { outbound })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming_round_trips() {
        let channel = channel_for("REQUEST_PROGRESS");
        assert_eq!(channel, "pathway-gateway:REQUEST_PROGRESS");
        assert_eq!(topic_from_channel(&channel), Some("REQUEST_PROGRESS"));
        assert_eq!(topic_from_channel("unrelated"), None);
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            instance_id: "i1".to_string(),
            key: Some("r1".to_string()),
            payload: serde_json::json!({"progress": 0.5}),
        };
        let body = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&body).unwrap();
        assert_eq!(back.instance_id, "i1");
        assert_eq!(back.key.as_deref(), Some("r1"));
        assert_eq!(back.payload["progress"], 0.5);
    }
}
