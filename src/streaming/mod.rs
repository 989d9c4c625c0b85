// SSE translation of the progress topic: one request's bus events become
// an event-stream response, closing after the terminal event. A subscriber
// attaching after the request already finished gets the stored terminal
// state as its first and only event.

use crate::bus::ProgressEvent;
use crate::engine::PathwayEngine;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::RequestRecord;
use actix_web_lab::sse;
use futures_util::stream::LocalBoxStream;
use std::time::Duration;
use tracing::debug;

const KEEP_ALIVE_SECS: u64 = 15;

/// Terminal event reconstructed from a finished (or cancel-before-start)
/// record for subscribers that attached too late to see it published
fn synthesize_terminal(record: &RequestRecord) -> ProgressEvent {
    if record.cancellation_token.is_cancelled() && record.error.is_none() {
        return ProgressEvent::canceled(&record.id);
    }
    match &record.error {
        Some(error) if error == "request timed out" => ProgressEvent::timed_out(&record.id),
        Some(error) => ProgressEvent::failed(&record.id, error),
        None => ProgressEvent::done(&record.id),
    }
}

fn to_sse_event(payload: &serde_json::Value) -> sse::Event {
    sse::Event::Data(sse::Data::new(payload.to_string()))
}

type SseStream = LocalBoxStream<'static, Result<sse::Event, actix_web::Error>>;

/// Attach to a request's progress stream. Attaching is what begins the
/// work for an async request whose starter has not been pulled yet.
pub fn progress_stream(
    engine: &PathwayEngine,
    request_id: &str,
) -> GatewayResult<sse::Sse<SseStream>> {
    let record = engine
        .registry()
        .get(request_id)
        .ok_or_else(|| GatewayError::RequestNotFound(request_id.to_string()))?;

    // Subscribe before starting so the first events cannot be missed
    let subscription = engine.bus().subscribe_request(request_id);

    let finished = record.finished_at.is_some();
    let canceled_before_start = record.cancellation_token.is_cancelled() && !record.started;

    let stream: SseStream = if finished || canceled_before_start {
        debug!(request_id = %request_id, "late subscriber; emitting stored terminal state");
        let event = synthesize_terminal(&record);
        let payload = serde_json::to_value(&event)?;
        Box::pin(futures_util::stream::iter(vec![Ok(to_sse_event(&payload))]))
    } else {
        engine.start_request(request_id);
        Box::pin(futures_util::stream::unfold(
            (subscription, false),
            |(mut subscription, done)| async move {
                if done {
                    return None;
                }
                let payload = subscription.recv().await?;
                let terminal = serde_json::from_value::<ProgressEvent>(payload.clone())
                    .map(|event| event.is_terminal())
                    .unwrap_or(false);
                Some((Ok(to_sse_event(&payload)), (subscription, terminal)))
            },
        ))
    };

    Ok(sse::Sse::from_stream(stream).with_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Map, Value};
    use tokio_util::sync::CancellationToken;

    fn record(id: &str) -> RequestRecord {
        let registry = crate::registry::RequestRegistry::new(300);
        registry.create(id, "chat", Map::new());
        registry.get(id).unwrap()
    }

    #[test]
    fn test_synthesize_canceled_before_start() {
        let record = record("r1");
        record.cancellation_token.cancel();
        let event = synthesize_terminal(&record);
        assert_eq!(event.status.as_deref(), Some("canceled"));
    }

    #[test]
    fn test_synthesize_timed_out() {
        let mut record = record("r1");
        record.error = Some("request timed out".to_string());
        record.finished_at = Some(Utc::now());
        let event = synthesize_terminal(&record);
        assert_eq!(event.status.as_deref(), Some("timed_out"));
    }

    #[test]
    fn test_synthesize_failed_and_done() {
        let mut record = record("r1");
        record.error = Some("upstream broke".to_string());
        assert!(synthesize_terminal(&record).error.is_some());

        let mut record = record;
        record.error = None;
        record.cancellation_token = CancellationToken::new();
        let event = synthesize_terminal(&record);
        assert_eq!(event.data, Some(Value::String("[DONE]".to_string())));
        assert!(event.error.is_none());
    }
}
