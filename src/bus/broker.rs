// In-process topic broker. Subscribers hold bounded channels; delivery is
// best-effort and a drop on back-pressure is logged, never propagated to
// the publisher.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bounded per-subscriber queue depth
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    id: String,
    /// When set, only events whose key is in the set are delivered
    filter: Option<HashSet<String>>,
    sender: mpsc::Sender<Value>,
}

#[derive(Default)]
pub struct LocalBroker {
    topics: DashMap<String, Vec<Subscriber>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to every matching subscriber of `topic`. Returns
    /// the number of subscribers reached.
    pub fn publish(&self, topic: &str, key: Option<&str>, payload: &Value) -> usize {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if subscriber.sender.is_closed() {
                return false;
            }
            let matches = match (&subscriber.filter, key) {
                (Some(filter), Some(key)) => filter.contains(key),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if matches {
                match subscriber.sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            topic = %topic,
                            subscriber_id = %subscriber.id,
                            "subscriber queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
        delivered
    }

    /// Attach a subscriber to a topic, optionally filtered by event key
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        filter: Option<HashSet<String>>,
    ) -> BusSubscription {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                filter,
                sender,
            });
        debug!(topic = %topic, subscriber_id = %id, "bus_subscribed");
        BusSubscription {
            id,
            topic: topic.to_string(),
            receiver,
            broker: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, topic: &str, id: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

/// A live subscription. Dropping it detaches from the broker; detaching
/// after the topic already forgot the subscriber is a no-op.
pub struct BusSubscription {
    id: String,
    topic: String,
    receiver: mpsc::Receiver<Value>,
    broker: Arc<LocalBroker>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.topic, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = Arc::new(LocalBroker::new());
        let mut sub = broker.subscribe("topic", None);
        assert_eq!(broker.publish("topic", None, &json!({"a": 1})), 1);
        assert_eq!(sub.recv().await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_filter_by_key() {
        let broker = Arc::new(LocalBroker::new());
        let filter: HashSet<String> = ["r1".to_string()].into_iter().collect();
        let mut sub = broker.subscribe("topic", Some(filter));

        assert_eq!(broker.publish("topic", Some("r2"), &json!("skip")), 0);
        assert_eq!(broker.publish("topic", Some("r1"), &json!("take")), 1);
        assert_eq!(sub.recv().await, Some(json!("take")));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let broker = Arc::new(LocalBroker::new());
        assert_eq!(broker.publish("nobody", None, &json!(1)), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = Arc::new(LocalBroker::new());
        let sub = broker.subscribe("topic", None);
        assert_eq!(broker.subscriber_count("topic"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("topic"), 0);
    }

    #[tokio::test]
    async fn test_fifo_per_producer() {
        let broker = Arc::new(LocalBroker::new());
        let mut sub = broker.subscribe("topic", None);
        for i in 0..10 {
            broker.publish("topic", None, &json!(i));
        }
        for i in 0..10 {
            assert_eq!(sub.recv().await, Some(json!(i)));
        }
    }
}
