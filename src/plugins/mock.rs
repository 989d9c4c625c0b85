// Scripted plugin for engine tests: records every dispatch with a start
// timestamp, replays queued responses, and can inject failures and
// latency.

use crate::error::{GatewayError, GatewayResult};
use crate::pathway::ChatMessage;
use crate::plugins::{ModelPlugin, PluginRequest, ensure_not_canceled};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub started_at: Instant,
}

impl RecordedCall {
    /// Content of the last user message, the slot scripted tests assert on
    pub fn user_content(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

pub struct ScriptedPlugin {
    name: String,
    responses: Mutex<VecDeque<String>>,
    failures: AtomicUsize,
    delay: Option<Duration>,
    context_window: usize,
    prompt_token_ratio: f64,
    truncate_from_front: bool,
    parallel_safe: bool,
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedPlugin {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            responses: Mutex::new(VecDeque::new()),
            failures: AtomicUsize::new(0),
            delay: None,
            context_window: 8000,
            prompt_token_ratio: 0.5,
            truncate_from_front: false,
            parallel_safe: true,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.responses.lock().unwrap() = responses.into_iter().map(Into::into).collect();
        self
    }

    /// Fail the next `n` dispatches with an upstream error
    pub fn with_failures(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn serial_chunks(mut self) -> Self {
        self.parallel_safe = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for ScriptedPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelPlugin for ScriptedPlugin {
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
        self.parallel_safe
    }

    async fn execute(&self, request: &PluginRequest) -> GatewayResult<String> {
        ensure_not_canceled(request)?;
        self.calls.lock().unwrap().push(RecordedCall {
            messages: request.messages.clone(),
            started_at: Instant::now(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Upstream("scripted failure".to_string()));
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| {
            let user = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            format!("echo:{}", user)
        }))
    }
}
