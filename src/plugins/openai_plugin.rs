// OpenAI-compatible chat-completions plugin. Any backend speaking this
// wire format (OpenAI itself, Azure fronts, local gateways) is reachable
// by pointing the base URL at it.

use crate::config::settings::ModelConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::pathway::ChatMessage;
use crate::plugins::{DeltaStream, ModelPlugin, PluginRequest, ensure_not_canceled};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use tracing::{debug, error, instrument, warn};

#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiChatPlugin {
    name: String,
    client: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    context_window: usize,
    prompt_token_ratio: f64,
    truncate_from_front: bool,
}

impl OpenAiChatPlugin {
    pub fn new(name: impl Into<String>, config: &ModelConfig) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.default_model.clone(),
            context_window: config.context_window,
            prompt_token_ratio: config.prompt_token_ratio,
            truncate_from_front: config.truncate_from_front,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn build_request(&self, request: &PluginRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            stream: stream.then_some(true),
        }
    }

    async fn post(&self, body: &ChatCompletionRequest) -> GatewayResult<reqwest::Response> {
        let mut builder = self.client.post(self.endpoint()).json(body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(status = %status, "chat completion request failed");
            return Err(GatewayError::Upstream(format!(
                "model backend returned {}: {}",
                status,
                crate::chunking::semantic_truncate(&detail, 300)
            )));
        }
        Ok(response)
    }

    /// Content delta of one chat-completions stream chunk
    fn extract_delta(chunk: &Value) -> Option<String> {
        chunk
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait]
impl ModelPlugin for OpenAiChatPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_max_token_length(&self) -> usize {
        self.context_window
    }

    fn prompt_token_ratio(&self) -> f64 {
        self.prompt_token_ratio
    }

    fn truncate_from_front(&self) -> bool {
        self.truncate_from_front
    }

    fn chunk_parallel_safe(&self) -> bool {
        true
    }

    fn emulated_chat_model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn process_stream_event(&self, raw: &Value) -> Option<String> {
        Self::extract_delta(raw)
    }

    #[instrument(skip(self, request), fields(model = %self.model, request_id = %request.request_id))]
    async fn execute(&self, request: &PluginRequest) -> GatewayResult<String> {
        ensure_not_canceled(request)?;
        let body = self.build_request(request, false);

        let response = tokio::select! {
            response = self.post(&body) => response?,
            _ = request.cancellation.cancelled() => {
                return Err(GatewayError::Canceled(format!(
                    "request {} canceled during dispatch",
                    request.request_id
                )));
            }
        };

        let parsed: ChatCompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        debug!(chars = content.len(), "chat completion received");
        Ok(content)
    }

    async fn execute_stream(&self, request: &PluginRequest) -> GatewayResult<DeltaStream> {
        ensure_not_canceled(request)?;
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;

        let events = response.bytes_stream().eventsource();
        let stream = futures_util::stream::unfold(events, |mut events| async move {
            loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        if event.data.trim() == "[DONE]" {
                            return None;
                        }
                        let value: Value = match serde_json::from_str(&event.data) {
                            Ok(value) => value,
                            Err(e) => {
                                warn!(error = %e, "unparseable stream chunk skipped");
                                continue;
                            }
                        };
                        if let Some(error_obj) = value.get("error") {
                            let err =
                                GatewayError::Upstream(format!("stream error: {}", error_obj));
                            return Some((Err(err), events));
                        }
                        match Self::extract_delta(&value) {
                            Some(delta) => return Some((Ok(delta), events)),
                            None => continue,
                        }
                    }
                    Some(Err(e)) => {
                        let err = GatewayError::Upstream(format!("stream transport error: {}", e));
                        return Some((Err(err), events));
                    }
                    None => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ModelConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn plugin_for(server: &mockito::Server) -> OpenAiChatPlugin {
        OpenAiChatPlugin::new(
            "openai",
            &ModelConfig {
                api_base: server.url(),
                api_key: Some("test-key".to_string()),
                default_model: "gpt-4o".to_string(),
                context_window: 128_000,
                prompt_token_ratio: 0.5,
                truncate_from_front: false,
            },
        )
    }

    fn request() -> PluginRequest {
        PluginRequest {
            request_id: "r1".to_string(),
            pathway_name: "chat".to_string(),
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::user("Hello")],
            temperature: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_returns_first_choice_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let plugin = plugin_for(&server);
        let text = plugin.execute(&request()).await.unwrap();
        assert_eq!(text, "Hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_maps_to_upstream() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error": "rate limited"}"#)
            .create_async()
            .await;

        let plugin = plugin_for(&server);
        let err = plugin.execute(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_canceled_before_dispatch() {
        let server = mockito::Server::new_async().await;
        let plugin = plugin_for(&server);
        let mut req = request();
        req.cancellation = CancellationToken::new();
        req.cancellation.cancel();
        let err = plugin.execute(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Canceled(_)));
    }

    #[tokio::test]
    async fn test_stream_yields_deltas_until_done() {
        let mut server = mockito::Server::new_async().await;
        let chunk1 = json!({"choices": [{"delta": {"content": "Hel"}}]});
        let chunk2 = json!({"choices": [{"delta": {"content": "lo"}}]});
        let body = format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", chunk1, chunk2);
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let plugin = plugin_for(&server);
        let mut stream = plugin.execute_stream(&request()).await.unwrap();
        let mut collected = String::new();
        while let Some(delta) = stream.next().await {
            collected.push_str(&delta.unwrap());
        }
        assert_eq!(collected, "Hello");
    }

    #[test]
    fn test_extract_delta_ignores_contentless_chunks() {
        assert_eq!(
            OpenAiChatPlugin::extract_delta(&json!({"choices": [{"delta": {}}]})),
            None
        );
        assert_eq!(
            OpenAiChatPlugin::extract_delta(
                &json!({"choices": [{"delta": {"content": "x"}}]})
            ),
            Some("x".to_string())
        );
    }
}
