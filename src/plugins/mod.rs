pub mod openai_plugin;

#[cfg(test)]
pub mod mock;

use crate::error::{GatewayError, GatewayResult};
use crate::pathway::{ChatMessage, CompiledPrompt, Prompt, compile_prompt};
use crate::tokens::TokenCodec;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use openai_plugin::OpenAiChatPlugin;

/// Normalized stream of content deltas from a streaming execution
pub type DeltaStream = Pin<Box<dyn Stream<Item = GatewayResult<String>> + Send>>;

/// One dispatch handed to a model plugin
#[derive(Clone, Debug)]
pub struct PluginRequest {
    pub request_id: String,
    pub pathway_name: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub cancellation: CancellationToken,
}

/// Contract the engine relies on. Vendor specifics live entirely behind it.
#[async_trait]
pub trait ModelPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Context window of the backing model, in tokens
    fn model_max_token_length(&self) -> usize;

    /// Share of the context window reserved for input, in (0, 1]
    fn prompt_token_ratio(&self) -> f64;

    /// Direction oversized single-chunk input is truncated from
    fn truncate_from_front(&self) -> bool {
        false
    }

    /// Whether per-chunk dispatches within one prompt may run concurrently
    fn chunk_parallel_safe(&self) -> bool {
        false
    }

    /// OpenAI-compatible model name this plugin answers for on the REST
    /// translator, when advertised
    fn emulated_chat_model(&self) -> Option<&str> {
        None
    }

    fn emulated_completion_model(&self) -> Option<&str> {
        None
    }

    /// Render a prompt against concrete parameters. The default is the
    /// shared compiler; plugins with bespoke message shapes override it.
    fn get_compiled_prompt(
        &self,
        codec: &TokenCodec,
        prompt: &Prompt,
        params: &Map<String, Value>,
    ) -> CompiledPrompt {
        compile_prompt(codec, prompt, params)
    }

    /// Normalize one raw vendor stream event into a content delta. Returns
    /// None for events that carry no content.
    fn process_stream_event(&self, _raw: &Value) -> Option<String> {
        None
    }

    /// Execute a dispatch and return the full response text
    async fn execute(&self, request: &PluginRequest) -> GatewayResult<String>;

    /// Execute a dispatch as a delta stream. The default wraps `execute`
    /// into a single-item stream for plugins without native streaming.
    async fn execute_stream(&self, request: &PluginRequest) -> GatewayResult<DeltaStream> {
        let text = self.execute(request).await?;
        Ok(Box::pin(futures_util::stream::once(async move { Ok(text) })))
    }
}

/// Model-name to plugin routing, with a default for unmapped names
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ModelPlugin>>,
    default_plugin: Arc<dyn ModelPlugin>,
}

impl PluginRegistry {
    pub fn new(default_plugin: Arc<dyn ModelPlugin>) -> Self {
        let mut plugins: HashMap<String, Arc<dyn ModelPlugin>> = HashMap::new();
        plugins.insert(default_plugin.name().to_string(), default_plugin.clone());
        Self {
            plugins,
            default_plugin,
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn ModelPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Resolve a pathway's target model to a plugin: exact name, then
    /// advertised emulation names, then the default
    pub fn resolve(&self, model: &str) -> GatewayResult<Arc<dyn ModelPlugin>> {
        if let Some(plugin) = self.plugins.get(model) {
            return Ok(plugin.clone());
        }
        for plugin in self.plugins.values() {
            if plugin.emulated_chat_model() == Some(model)
                || plugin.emulated_completion_model() == Some(model)
            {
                return Ok(plugin.clone());
            }
        }
        Ok(self.default_plugin.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelPlugin>> {
        self.plugins.get(name).cloned()
    }
}

/// Guard used by implementations to fail fast on canceled work
pub fn ensure_not_canceled(request: &PluginRequest) -> GatewayResult<()> {
    if request.cancellation.is_cancelled() {
        return Err(GatewayError::Canceled(format!(
            "request {} canceled before dispatch",
            request.request_id
        )));
    }
    Ok(())
}
