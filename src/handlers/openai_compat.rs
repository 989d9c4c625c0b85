// OpenAI-compatible REST translation: chat-completions requests are
// re-routed onto pathways, and progress events are reserialized into
// chat.completion chunks. Incoming model names route to the pathway of the
// same name when one exists, otherwise to the chat pathway.

use crate::bus::{DONE_MARKER, ProgressEvent};
use crate::engine::{PathwayEngine, ResolveOutcome};
use crate::error::GatewayError;
use crate::handlers::GatewayState;
use actix_web::{Either, HttpResponse, web};
use actix_web_lab::sse;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

type ChunkStream = BoxStream<'static, Result<sse::Event, actix_web::Error>>;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// One chat.completion.chunk frame
fn chat_completion_chunk(response_id: &str, model: &str, content: &str, is_final: bool) -> Value {
    if is_final {
        json!({
            "id": response_id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": "stop"
            }]
        })
    } else {
        json!({
            "id": response_id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": content },
                "finish_reason": Value::Null
            }]
        })
    }
}

fn chat_completion_response(response_id: &str, model: &str, content: &str) -> Value {
    json!({
        "id": response_id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

/// Split incoming messages into the current text slot and the preceding
/// chat history
fn messages_to_args(messages: &[Value]) -> Map<String, Value> {
    let mut args = Map::new();
    let last_user = messages
        .iter()
        .rposition(|m| m.get("role").and_then(Value::as_str) == Some("user"));

    let text = last_user
        .and_then(|idx| messages[idx].get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    args.insert("text".to_string(), Value::String(text));

    let history: Vec<Value> = messages
        .iter()
        .enumerate()
        .filter(|(idx, _)| Some(*idx) != last_user)
        .map(|(_, message)| message.clone())
        .collect();
    if !history.is_empty() {
        args.insert("chatHistory".to_string(), Value::Array(history));
    }
    args
}

fn value_to_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

enum StreamStage {
    Streaming,
    DoneMarker,
    Ended,
}

/// Reserialize one request's progress events into the chat-completions
/// stream wire format, ending with the literal `[DONE]` data line
fn stream_chat_completions(
    engine: &PathwayEngine,
    request_id: &str,
    response_id: String,
    model: String,
) -> sse::Sse<ChunkStream> {
    let subscription = engine.bus().subscribe_request(request_id);
    engine.start_request(request_id);

    let stream: ChunkStream = Box::pin(futures_util::stream::unfold(
        (subscription, StreamStage::Streaming, response_id, model),
        |(mut subscription, stage, response_id, model)| async move {
            match stage {
                StreamStage::Ended => None,
                StreamStage::DoneMarker => {
                    let event = sse::Event::Data(sse::Data::new(DONE_MARKER));
                    Some((
                        Ok(event),
                        (subscription, StreamStage::Ended, response_id, model),
                    ))
                }
                StreamStage::Streaming => loop {
                    let Some(payload) = subscription.recv().await else {
                        return None;
                    };
                    let Ok(event) = serde_json::from_value::<ProgressEvent>(payload) else {
                        continue;
                    };

                    if event.is_terminal() {
                        let frame = match &event.error {
                            Some(error) => json!({ "error": { "message": error } }),
                            None => chat_completion_chunk(&response_id, &model, "", true),
                        };
                        let data = sse::Event::Data(sse::Data::new(frame.to_string()));
                        return Some((
                            Ok(data),
                            (subscription, StreamStage::DoneMarker, response_id, model),
                        ));
                    }

                    if let Some(Value::String(delta)) = &event.data {
                        let frame = chat_completion_chunk(&response_id, &model, delta, false);
                        let data = sse::Event::Data(sse::Data::new(frame.to_string()));
                        return Some((
                            Ok(data),
                            (subscription, StreamStage::Streaming, response_id, model),
                        ));
                    }
                },
            }
        },
    ));

    sse::Sse::from_stream(stream).with_keep_alive(Duration::from_secs(15))
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    body: web::Json<ChatCompletionsRequest>,
    state: web::Data<GatewayState>,
) -> Result<Either<HttpResponse, sse::Sse<ChunkStream>>, GatewayError> {
    let request = body.into_inner();

    // Route the advertised model name onto a pathway
    let pathway = state
        .engine
        .get_pathway(&request.model)
        .or_else(|| state.engine.get_pathway("chat"))
        .ok_or_else(|| GatewayError::PathwayNotFound(request.model.clone()))?;
    info!(model = %request.model, pathway = %pathway.name, "chat_completions_routed");

    let mut args = messages_to_args(&request.messages);
    if request.stream {
        args.insert("stream".to_string(), Value::Bool(true));
    }

    let pathway = if request.temperature.is_some() {
        let mut overridden = (*pathway).clone();
        overridden.temperature = request.temperature;
        Arc::new(overridden)
    } else {
        pathway
    };

    let outcome = state.engine.resolve(&pathway, args).await?;
    let response_id = format!("chatcmpl-{}", Uuid::new_v4().simple());

    match outcome {
        ResolveOutcome::Value(value) => {
            Ok(Either::Left(HttpResponse::Ok().json(chat_completion_response(
                &response_id,
                &request.model,
                &value_to_content(&value),
            ))))
        }
        ResolveOutcome::Async { request_id } => Ok(Either::Right(stream_chat_completions(
            &state.engine,
            &request_id,
            response_id,
            request.model,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_messages_to_args_splits_history_and_text() {
        let messages = vec![
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": "earlier question"}),
            json!({"role": "assistant", "content": "earlier answer"}),
            json!({"role": "user", "content": "current question"}),
        ];
        let args = messages_to_args(&messages);
        assert_eq!(args.get("text"), Some(&json!("current question")));
        let history = args.get("chatHistory").unwrap().as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1]["content"], "earlier question");
    }

    #[test]
    fn test_messages_to_args_without_user_message() {
        let messages = vec![json!({"role": "system", "content": "be brief"})];
        let args = messages_to_args(&messages);
        assert_eq!(args.get("text"), Some(&json!("")));
    }

    #[test]
    fn test_chunk_frames() {
        let delta = chat_completion_chunk("id1", "gpt-4o", "hel", false);
        assert_eq!(delta["choices"][0]["delta"]["content"], "hel");
        assert_eq!(delta["choices"][0]["finish_reason"], Value::Null);

        let last = chat_completion_chunk("id1", "gpt-4o", "", true);
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_completion_response_shape() {
        let response = chat_completion_response("id1", "gpt-4o", "answer");
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["choices"][0]["message"]["content"], "answer");
    }
}
