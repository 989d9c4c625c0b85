pub mod resolvers;

use crate::bus::{ProgressEvent, PubSubBus};
use crate::callbacks::ClientToolCallbacks;
use crate::chunking::{
    InputFormat, detect_format, semantic_chunk, single_token_chunks, truncate_back, truncate_front,
};
use crate::context::SharedContextStore;
use crate::error::{GatewayError, GatewayResult};
use crate::pathway::{Pathway, Prompt, chunk_token_budget, parse_response};
use crate::plugins::{ModelPlugin, PluginRegistry, PluginRequest};
use crate::registry::RequestRegistry;
use crate::tokens::TokenCodec;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pathway-owned control flow layered over the engine. Implementations may
/// invoke the engine again; the iteration bound is the resolver's own.
#[async_trait]
pub trait CustomResolver: Send + Sync {
    async fn resolve(
        &self,
        engine: &PathwayEngine,
        pathway: &Pathway,
        args: &Map<String, Value>,
        request_id: &str,
    ) -> GatewayResult<Value>;
}

/// Outcome of `resolve`: a parsed value for synchronous callers, or the
/// request id for async/streaming callers who subscribe for progress
#[derive(Debug)]
pub enum ResolveOutcome {
    Value(Value),
    Async { request_id: String },
}

fn bool_arg(args: &Map<String, Value>, key: &str) -> bool {
    match args.get(key) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn string_arg(args: &Map<String, Value>, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn prompt_label(prompt: &Prompt, index: usize) -> String {
    prompt
        .name
        .clone()
        .unwrap_or_else(|| format!("prompt[{}]", index))
}

/// The orchestrator: drives a compiled pathway to completion against the
/// plugin its model resolves to, publishing progress along the way.
#[derive(Clone)]
pub struct PathwayEngine {
    registry: RequestRegistry,
    bus: PubSubBus,
    callbacks: ClientToolCallbacks,
    context: SharedContextStore,
    plugins: PluginRegistry,
    pathways: Arc<DashMap<String, Arc<Pathway>>>,
    default_timeout: Duration,
}

impl PathwayEngine {
    pub fn new(
        registry: RequestRegistry,
        bus: PubSubBus,
        callbacks: ClientToolCallbacks,
        context: SharedContextStore,
        plugins: PluginRegistry,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            bus,
            callbacks,
            context,
            plugins,
            pathways: Arc::new(DashMap::new()),
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &PubSubBus {
        &self.bus
    }

    pub fn callbacks(&self) -> &ClientToolCallbacks {
        &self.callbacks
    }

    pub fn install_pathway(&self, pathway: Pathway) {
        self.pathways
            .insert(pathway.name.clone(), Arc::new(pathway));
    }

    pub fn install_pathways(&self, pathways: Vec<Pathway>) {
        for pathway in pathways {
            self.install_pathway(pathway);
        }
    }

    pub fn get_pathway(&self, name: &str) -> Option<Arc<Pathway>> {
        self.pathways.get(name).map(|entry| entry.value().clone())
    }

    /// Suspend the current pathway until the caller submits a client-tool
    /// result, possibly through another instance
    pub async fn await_client_tool(
        &self,
        callback_id: &str,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> GatewayResult<Value> {
        self.callbacks
            .await_callback(callback_id, request_id, timeout)
            .await
    }

    /// Entry point. Synchronous callers get the parsed value; callers that
    /// set `async` or `stream` get a request id back immediately, and work
    /// begins when the first subscriber attaches or the front door pulls
    /// the starter.
    pub async fn resolve(
        &self,
        pathway: &Arc<Pathway>,
        mut args: Map<String, Value>,
    ) -> GatewayResult<ResolveOutcome> {
        pathway.validate()?;
        if pathway.flags.disabled {
            return Err(GatewayError::InvalidInput(format!(
                "pathway '{}' is disabled",
                pathway.name
            )));
        }

        for (name, param) in &pathway.inputs {
            if !args.contains_key(name) {
                if let Some(default) = &param.default {
                    args.insert(name.clone(), default.clone());
                }
            }
        }

        let async_mode = bool_arg(&args, "async") || bool_arg(&args, "stream");
        let request_id = Uuid::new_v4().to_string();
        self.registry.create(&request_id, &pathway.name, args.clone());

        if async_mode {
            let engine = self.clone();
            let pathway = pathway.clone();
            let starter_args = args.clone();
            let starter_id = request_id.clone();
            self.registry.set_starter(
                &request_id,
                Box::new(move || {
                    tokio::spawn(async move {
                        if let Err(e) = engine.run_request(pathway, starter_args, starter_id).await
                        {
                            debug!(error = %e, "async request finished with error");
                        }
                    });
                }),
            );
            return Ok(ResolveOutcome::Async { request_id });
        }

        let value = self.run_request(pathway.clone(), args, request_id).await?;
        Ok(ResolveOutcome::Value(value))
    }

    /// Convenience lookup + resolve for the front door
    pub async fn resolve_by_name(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> GatewayResult<ResolveOutcome> {
        let pathway = self
            .get_pathway(name)
            .ok_or_else(|| GatewayError::PathwayNotFound(name.to_string()))?;
        self.resolve(&pathway, args).await
    }

    /// Pull the deferred starter for an async request. Idempotent; only
    /// the first caller begins the work.
    pub fn start_request(&self, request_id: &str) -> bool {
        match self.registry.take_starter(request_id) {
            Some(starter) => {
                starter();
                true
            }
            None => false,
        }
    }

    /// Run a request under the timeout supervisor, translating the outcome
    /// into the record's terminal state and the terminal progress event
    pub async fn run_request(
        &self,
        pathway: Arc<Pathway>,
        args: Map<String, Value>,
        request_id: String,
    ) -> GatewayResult<Value> {
        self.registry.mark_started(&request_id);
        info!(request_id = %request_id, pathway = %pathway.name, "request_started");

        let timeout = pathway
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        match tokio::time::timeout(
            timeout,
            self.execute_pathway(&pathway, &args, &request_id),
        )
        .await
        {
            Err(_) => {
                // Release any pending plugin call before reporting
                self.registry.cancel(&request_id);
                self.registry.set_error(&request_id, "request timed out");
                self.bus
                    .publish_progress(&ProgressEvent::timed_out(&request_id));
                Err(GatewayError::TimedOut(format!(
                    "pathway '{}' exceeded its {}s timeout",
                    pathway.name,
                    timeout.as_secs()
                )))
            }
            Ok(Err(e)) if e.is_cancellation() => {
                self.registry.set_result(&request_id, Value::Null);
                self.bus
                    .publish_progress(&ProgressEvent::canceled(&request_id));
                info!(request_id = %request_id, "request_canceled");
                Err(e)
            }
            Ok(Err(e)) => {
                self.registry.set_error(&request_id, &e.to_string());
                self.bus
                    .publish_progress(&ProgressEvent::failed(&request_id, &e.to_string()));
                Err(e)
            }
            Ok(Ok(value)) => {
                self.registry.set_result(&request_id, value.clone());
                self.bus.publish_progress(&ProgressEvent::done(&request_id));
                info!(request_id = %request_id, "request_completed");
                Ok(value)
            }
        }
    }

    /// Custom resolver when the pathway carries one, otherwise the
    /// standard prompt pipeline
    pub async fn execute_pathway(
        &self,
        pathway: &Pathway,
        args: &Map<String, Value>,
        request_id: &str,
    ) -> GatewayResult<Value> {
        match &pathway.resolver {
            Some(resolver) => resolver.resolve(self, pathway, args, request_id).await,
            None => self.execute_prompts(pathway, args, request_id).await,
        }
    }

    /// Replace oversized input with the summary pathway's output, recursing
    /// through the engine itself
    async fn summarize_input(&self, text: &str, request_id: &str) -> GatewayResult<String> {
        let summary = self.get_pathway("summary").ok_or_else(|| {
            GatewayError::PathwayNotFound(
                "the summary pathway is required for input summarization".to_string(),
            )
        })?;
        let mut args = Map::new();
        args.insert("text".to_string(), Value::String(text.to_string()));
        args.insert("targetLength".to_string(), json!(0));

        // The summary runs as a child request so the parent's progress
        // counters only cover its own dispatch plan
        let child_id = Uuid::new_v4().to_string();
        self.registry.create(&child_id, "summary", args.clone());
        let value = Box::pin(self.execute_prompts(&summary, &args, &child_id)).await;
        self.registry.delete(&child_id);
        let value = value?;

        if self.registry.is_canceled(request_id) {
            return Err(GatewayError::Canceled(format!(
                "request {} canceled during summarization",
                request_id
            )));
        }
        Ok(value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()))
    }

    fn cancel_token(&self, request_id: &str) -> CancellationToken {
        self.registry
            .get(request_id)
            .map(|record| record.cancellation_token.clone())
            .unwrap_or_default()
    }

    fn note_completion(&self, request_id: &str) {
        if let Some((completed, total)) = self.registry.increment_completed(request_id) {
            self.bus
                .publish_progress(&ProgressEvent::progress(request_id, completed, total));
        }
    }

    async fn dispatch_once(
        &self,
        plugin: &Arc<dyn ModelPlugin>,
        codec: &TokenCodec,
        pathway: &Pathway,
        prompt: &Prompt,
        prompt_index: usize,
        params: &Map<String, Value>,
        request_id: &str,
        token: &CancellationToken,
    ) -> GatewayResult<String> {
        if token.is_cancelled() {
            return Err(GatewayError::Canceled(format!(
                "request {} canceled before dispatch",
                request_id
            )));
        }

        let compiled = plugin.get_compiled_prompt(codec, prompt, params);
        if compiled.token_length >= plugin.model_max_token_length() {
            return Err(GatewayError::PromptTooLarge(format!(
                "prompt '{}' compiles to {} tokens against a {}-token context window",
                prompt_label(prompt, prompt_index),
                compiled.token_length,
                plugin.model_max_token_length()
            )));
        }

        let request = PluginRequest {
            request_id: request_id.to_string(),
            pathway_name: pathway.name.clone(),
            model: pathway.model.clone(),
            messages: compiled.messages,
            temperature: pathway.temperature,
            cancellation: token.clone(),
        };

        let result = plugin.execute(&request).await.map_err(|e| match e {
            GatewayError::Upstream(msg) => GatewayError::Upstream(format!(
                "prompt '{}': {}",
                prompt_label(prompt, prompt_index),
                msg
            )),
            other => other,
        })?;

        // A cancel that landed mid-flight discards the produced result
        if token.is_cancelled() {
            return Err(GatewayError::Canceled(format!(
                "request {} canceled during dispatch",
                request_id
            )));
        }
        Ok(result)
    }

    /// Forward the plugin's native stream for the single required dispatch,
    /// emitting each delta on the progress topic
    async fn stream_single_dispatch(
        &self,
        pathway: &Pathway,
        plugin: &Arc<dyn ModelPlugin>,
        codec: &TokenCodec,
        base_params: &Map<String, Value>,
        chunk: &str,
        request_id: &str,
        token: &CancellationToken,
    ) -> GatewayResult<String> {
        let prompt = pathway
            .prompts
            .first()
            .ok_or_else(|| GatewayError::Internal("streaming pathway has no prompt".to_string()))?;

        let mut params = base_params.clone();
        params.insert("text".to_string(), Value::String(chunk.to_string()));
        params.insert("previousResult".to_string(), Value::String(String::new()));

        if token.is_cancelled() {
            return Err(GatewayError::Canceled(format!(
                "request {} canceled before dispatch",
                request_id
            )));
        }
        let compiled = plugin.get_compiled_prompt(codec, prompt, &params);
        if compiled.token_length >= plugin.model_max_token_length() {
            return Err(GatewayError::PromptTooLarge(format!(
                "prompt '{}' compiles to {} tokens against a {}-token context window",
                prompt_label(prompt, 0),
                compiled.token_length,
                plugin.model_max_token_length()
            )));
        }

        let request = PluginRequest {
            request_id: request_id.to_string(),
            pathway_name: pathway.name.clone(),
            model: pathway.model.clone(),
            messages: compiled.messages,
            temperature: pathway.temperature,
            cancellation: token.clone(),
        };

        let full = if pathway.flags.use_single_token_stream {
            // Advisory flag: rebuild the finished text at token granularity
            let text = plugin.execute(&request).await?;
            for piece in single_token_chunks(codec, &text) {
                if token.is_cancelled() {
                    return Err(GatewayError::Canceled(format!(
                        "request {} canceled mid-stream",
                        request_id
                    )));
                }
                self.bus.publish_progress(&ProgressEvent::data(
                    request_id,
                    0,
                    1,
                    Value::String(piece),
                ));
            }
            text
        } else {
            let mut stream = plugin.execute_stream(&request).await?;
            let mut accumulated = String::new();
            while let Some(delta) = stream.next().await {
                if token.is_cancelled() {
                    return Err(GatewayError::Canceled(format!(
                        "request {} canceled mid-stream",
                        request_id
                    )));
                }
                let delta = delta?;
                accumulated.push_str(&delta);
                self.bus.publish_progress(&ProgressEvent::data(
                    request_id,
                    0,
                    1,
                    Value::String(delta),
                ));
            }
            accumulated
        };

        self.note_completion(request_id);
        Ok(full)
    }

    /// The standard pipeline: input preparation, chunking, dispatch in the
    /// declared mode, context propagation, and response parsing
    pub async fn execute_prompts(
        &self,
        pathway: &Pathway,
        args: &Map<String, Value>,
        request_id: &str,
    ) -> GatewayResult<Value> {
        let plugin = self.plugins.resolve(&pathway.model)?;
        let codec = TokenCodec::for_model(&pathway.model)?;
        let token = self.cancel_token(request_id);

        // Input preparation
        let mut text = string_arg(args, "text");
        if pathway.flags.use_input_summarization && !text.is_empty() {
            text = self.summarize_input(&text, request_id).await?;
        }

        let context_id = string_arg(args, "contextId");
        let mut context_blob = if context_id.is_empty() {
            Map::new()
        } else {
            match self.context.load(&context_id).await {
                Ok(blob) => blob,
                Err(e) => {
                    // Context failures degrade to an empty blob
                    warn!(context_id = %context_id, error = %e, "context load failed");
                    Map::new()
                }
            }
        };
        let mut context_dirty = false;

        let mut base_params = args.clone();
        for (key, value) in context_blob.iter() {
            base_params.insert(key.clone(), value.clone());
        }

        // Chunk budget applies only when some prompt consumes the text
        let uses_text = pathway.prompts.iter().any(Prompt::uses_text_input);
        let chunks: Vec<String> = if uses_text {
            let mut empty_params = base_params.clone();
            empty_params.insert("text".to_string(), Value::String(String::new()));
            empty_params.insert("previousResult".to_string(), Value::String(String::new()));
            let max_overhead = pathway
                .prompts
                .iter()
                .map(|prompt| plugin.get_compiled_prompt(&codec, prompt, &empty_params).token_length)
                .max()
                .unwrap_or(0);
            let any_dual = pathway
                .prompts
                .iter()
                .any(|p| p.uses_text_input() && p.uses_previous_result());

            let mut budget = chunk_token_budget(
                plugin.prompt_token_ratio(),
                plugin.model_max_token_length(),
                max_overhead,
                any_dual,
            )?;
            if let Some(size) = pathway.input_chunk_size {
                budget = budget.min(size.max(1));
            }

            let format: InputFormat = pathway
                .input_format
                .unwrap_or_else(|| detect_format(&text));
            let text_tokens = codec.count_or_estimate(&text);

            if pathway.flags.use_input_chunking && text_tokens > budget {
                semantic_chunk(&codec, &text, budget, format)?
            } else {
                if !text.is_empty() && text_tokens >= budget {
                    self.registry.add_warning(
                        request_id,
                        "input reaches the chunk budget; truncating",
                    );
                    text = if plugin.truncate_from_front() {
                        truncate_front(&codec, &text, budget)?
                    } else {
                        truncate_back(&codec, &text, budget)?
                    };
                }
                vec![text.clone()]
            }
        } else {
            vec![text.clone()]
        };

        // Dispatch accounting
        let text_prompts = pathway.prompts.iter().filter(|p| p.uses_text_input()).count();
        let non_text_prompts = pathway.prompts.len() - text_prompts;
        let parallel_chunk_mode =
            pathway.flags.use_parallel_chunk_processing && chunks.len() > 1;
        let parallel_prompt_mode = !parallel_chunk_mode
            && pathway.flags.use_parallel_prompt_processing
            && pathway.prompts.len() > 1;

        let total = if parallel_chunk_mode {
            chunks.len() * pathway.prompts.len()
        } else {
            chunks.len() * text_prompts + non_text_prompts
        };
        // First writer wins so bounded re-prompt loops keep their original
        // denominator
        if self
            .registry
            .get(request_id)
            .map(|record| record.total_count)
            .unwrap_or(0)
            == 0
        {
            self.registry.set_total(request_id, total.max(1));
        }
        debug!(
            request_id = %request_id,
            pathway = %pathway.name,
            chunks = chunks.len(),
            prompts = pathway.prompts.len(),
            total = total,
            "dispatch_plan"
        );

        // One required dispatch and a streaming caller: forward the native
        // stream verbatim. Anything larger was already downgraded to async.
        if bool_arg(args, "stream") && total == 1 {
            let raw = self
                .stream_single_dispatch(
                    pathway,
                    &plugin,
                    &codec,
                    &base_params,
                    &chunks[0],
                    request_id,
                    &token,
                )
                .await?;
            if let Some(prompt) = pathway.prompts.first() {
                if let Some(key) = &prompt.save_result_to {
                    context_blob.insert(key.clone(), Value::String(raw.clone()));
                    context_dirty = true;
                }
            }
            self.save_context(&context_id, &context_blob, context_dirty).await;
            return parse_response(pathway, &raw);
        }

        let outcome = if parallel_chunk_mode {
            // Each chunk runs the full prompt list with its own
            // previous-result lineage; joined output follows input order
            let futures = chunks.iter().map(|chunk| {
                let chunk = chunk.clone();
                let base = base_params.clone();
                let plugin = &plugin;
                let codec = &codec;
                let token = &token;
                async move {
                    let mut previous = String::new();
                    let mut updates: Vec<(String, String)> = Vec::new();
                    for (index, prompt) in pathway.prompts.iter().enumerate() {
                        let mut params = base.clone();
                        for (key, value) in &updates {
                            params.insert(key.clone(), Value::String(value.clone()));
                        }
                        params.insert("text".to_string(), Value::String(chunk.clone()));
                        params
                            .insert("previousResult".to_string(), Value::String(previous.clone()));
                        let out = self
                            .dispatch_once(
                                plugin, codec, pathway, prompt, index, &params, request_id, token,
                            )
                            .await?;
                        self.note_completion(request_id);
                        if let Some(key) = &prompt.save_result_to {
                            updates.push((key.clone(), out.clone()));
                        }
                        previous = out;
                    }
                    Ok::<(String, Vec<(String, String)>), GatewayError>((previous, updates))
                }
            });

            let mut finals = Vec::with_capacity(chunks.len());
            for lineage in join_all(futures).await {
                let (final_text, updates) = lineage?;
                for (key, value) in updates {
                    context_blob.insert(key, Value::String(value));
                    context_dirty = true;
                }
                finals.push(final_text);
            }
            parse_response(pathway, &finals.join("\n\n"))?
        } else if parallel_prompt_mode {
            // Prompts run independently, no previous-result propagation;
            // the result is one entry per prompt in declaration order
            let futures = pathway.prompts.iter().enumerate().map(|(index, prompt)| {
                let base = base_params.clone();
                let chunks = &chunks;
                let plugin = &plugin;
                let codec = &codec;
                let token = &token;
                async move {
                    let mut params = base;
                    params.insert("previousResult".to_string(), Value::String(String::new()));
                    let out = if prompt.uses_text_input() {
                        let mut parts = Vec::with_capacity(chunks.len());
                        for chunk in chunks.iter() {
                            let mut chunk_params = params.clone();
                            chunk_params
                                .insert("text".to_string(), Value::String(chunk.clone()));
                            let part = self
                                .dispatch_once(
                                    plugin,
                                    codec,
                                    pathway,
                                    prompt,
                                    index,
                                    &chunk_params,
                                    request_id,
                                    token,
                                )
                                .await?;
                            self.note_completion(request_id);
                            parts.push(part);
                        }
                        parts.join("\n\n")
                    } else {
                        let part = self
                            .dispatch_once(
                                plugin, codec, pathway, prompt, index, &params, request_id, token,
                            )
                            .await?;
                        self.note_completion(request_id);
                        part
                    };
                    Ok::<String, GatewayError>(out)
                }
            });

            let mut entries = Vec::with_capacity(pathway.prompts.len());
            for result in join_all(futures).await {
                entries.push(result?);
            }
            for (prompt, entry) in pathway.prompts.iter().zip(entries.iter()) {
                if let Some(key) = &prompt.save_result_to {
                    context_blob.insert(key.clone(), Value::String(entry.clone()));
                    context_dirty = true;
                }
            }
            let mut parsed = Vec::with_capacity(entries.len());
            for entry in &entries {
                parsed.push(parse_response(pathway, entry)?);
            }
            Value::Array(parsed)
        } else {
            // Default serial mode with previous-result propagation
            let mut previous = String::new();
            for (index, prompt) in pathway.prompts.iter().enumerate() {
                let mut params = base_params.clone();
                for (key, value) in context_blob.iter() {
                    params.insert(key.clone(), value.clone());
                }
                params.insert("previousResult".to_string(), Value::String(previous.clone()));

                let result = if prompt.uses_text_input() {
                    if plugin.chunk_parallel_safe() && chunks.len() > 1 {
                        let futures = chunks.iter().map(|chunk| {
                            let mut chunk_params = params.clone();
                            chunk_params
                                .insert("text".to_string(), Value::String(chunk.clone()));
                            let plugin = &plugin;
                            let codec = &codec;
                            let token = &token;
                            async move {
                                let out = self
                                    .dispatch_once(
                                        plugin,
                                        codec,
                                        pathway,
                                        prompt,
                                        index,
                                        &chunk_params,
                                        request_id,
                                        token,
                                    )
                                    .await?;
                                self.note_completion(request_id);
                                Ok::<String, GatewayError>(out)
                            }
                        });
                        let mut parts = Vec::with_capacity(chunks.len());
                        for part in join_all(futures).await {
                            parts.push(part?);
                        }
                        parts.join("\n\n")
                    } else {
                        let mut parts = Vec::with_capacity(chunks.len());
                        for chunk in &chunks {
                            let mut chunk_params = params.clone();
                            chunk_params
                                .insert("text".to_string(), Value::String(chunk.clone()));
                            let part = self
                                .dispatch_once(
                                    &plugin,
                                    &codec,
                                    pathway,
                                    prompt,
                                    index,
                                    &chunk_params,
                                    request_id,
                                    &token,
                                )
                                .await?;
                            self.note_completion(request_id);
                            parts.push(part);
                        }
                        parts.join("\n\n")
                    }
                } else {
                    let part = self
                        .dispatch_once(
                            &plugin, &codec, pathway, prompt, index, &params, request_id, &token,
                        )
                        .await?;
                    self.note_completion(request_id);
                    part
                };

                if let Some(key) = &prompt.save_result_to {
                    context_blob.insert(key.clone(), Value::String(result.clone()));
                    context_dirty = true;
                }
                previous = result;
            }
            parse_response(pathway, &previous)?
        };

        self.save_context(&context_id, &context_blob, context_dirty).await;
        Ok(outcome)
    }

    async fn save_context(&self, context_id: &str, blob: &Map<String, Value>, dirty: bool) {
        if !dirty || context_id.is_empty() {
            return;
        }
        if let Err(e) = self.context.save(context_id, blob).await {
            warn!(context_id = %context_id, error = %e, "context save failed");
        }
    }
}
