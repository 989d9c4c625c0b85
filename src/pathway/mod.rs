pub mod builtin;
pub mod compiler;
pub mod parser;

use crate::chunking::InputFormat;
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use compiler::{CompiledPrompt, chunk_token_budget, compile_prompt, interpolate};
pub use parser::parse_response;

/// Input slot mentioning the request text
pub const TEXT_SLOT: &str = "{{text}}";
/// Input slot carrying the prior prompt's parsed output in serial dispatch
pub const PREVIOUS_RESULT_SLOT: &str = "{{previousResult}}";
/// Placeholder message expanded into the caller-supplied chat history
pub const CHAT_HISTORY_SLOT: &str = "{{chatHistory}}";

/// One message in a prompt's message list. `content` may itself contain
/// template placeholders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A prompt is either a raw template string or a message list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptBody {
    Template(String),
    Messages(Vec<ChatMessage>),
}

/// One step of a pathway
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    /// Observability name for progress events and logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub body: PromptBody,
    /// Context-blob key the parsed result is written to after this prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_result_to: Option<String>,
    /// Opaque references to uploaded artifacts, resolved by the external
    /// file service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_hashes: Vec<String>,
}

impl Prompt {
    pub fn from_template(template: impl Into<String>) -> Self {
        Self {
            name: None,
            body: PromptBody::Template(template.into()),
            save_result_to: None,
            file_hashes: Vec::new(),
        }
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            name: None,
            body: PromptBody::Messages(messages),
            save_result_to: None,
            file_hashes: Vec::new(),
        }
    }

    fn mentions(&self, slot: &str) -> bool {
        match &self.body {
            PromptBody::Template(template) => template.contains(slot),
            PromptBody::Messages(messages) => {
                messages.iter().any(|m| m.content.contains(slot))
            }
        }
    }

    /// True iff the template mentions the text placeholder
    pub fn uses_text_input(&self) -> bool {
        self.mentions(TEXT_SLOT)
    }

    /// True iff the template mentions the previous-result placeholder
    pub fn uses_previous_result(&self) -> bool {
        self.mentions(PREVIOUS_RESULT_SLOT)
    }
}

/// Boolean pathway flags; all default off so stored documents only carry
/// the ones an author set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathwayFlags {
    pub use_input_chunking: bool,
    pub use_input_summarization: bool,
    pub use_parallel_chunk_processing: bool,
    pub use_parallel_prompt_processing: bool,
    pub enable_graphql_cache: bool,
    pub list: bool,
    pub json: bool,
    #[serde(rename = "emulateOpenAIChatModel")]
    pub emulate_open_ai_chat_model: bool,
    #[serde(rename = "emulateOpenAICompletionModel")]
    pub emulate_open_ai_completion_model: bool,
    pub use_single_token_stream: bool,
    pub enable_duplicate_requests: bool,
    pub request_logging_disabled: bool,
    pub disabled: bool,
    pub is_mutation: bool,
}

/// Declared type of an input parameter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    String,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParameter {
    #[serde(rename = "type", default)]
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Custom post-processing of the raw model text, overriding the declared
/// output shape
pub type CustomParser = Arc<dyn Fn(&str) -> GatewayResult<Value> + Send + Sync>;

/// A compiled pathway. Immutable after build; the engine borrows it
/// read-only for the lifetime of a request.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pathway {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
    /// Input-parameter schema merged into args before compilation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputParameter>,
    /// Target model identifier, resolved to a plugin at dispatch time
    pub model: String,
    #[serde(flatten)]
    pub flags: PathwayFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_chunk_size: Option<usize>,
    /// Whole-resolution timeout in seconds
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<InputFormat>,
    /// Space-separated field names turning a list result into records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// De-duplicated artifact references bubbled up from the prompts, for
    /// the external file-resolution collaborator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_hashes: Vec<String>,
    /// Bound custom resolver; pathways loaded from storage never carry one
    #[serde(skip)]
    pub resolver: Option<Arc<dyn crate::engine::CustomResolver>>,
    #[serde(skip)]
    pub parser: Option<CustomParser>,
}

impl std::fmt::Debug for Pathway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pathway")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("prompts", &self.prompts.len())
            .field("flags", &self.flags)
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

impl Pathway {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            prompts: Vec::new(),
            inputs: HashMap::new(),
            model: model.into(),
            flags: PathwayFlags::default(),
            input_chunk_size: None,
            timeout_secs: None,
            temperature: None,
            input_format: None,
            format: None,
            file_hashes: Vec::new(),
            resolver: None,
            parser: None,
        }
    }

    /// At least one prompt or a custom resolver must be present
    pub fn validate(&self) -> GatewayResult<()> {
        if self.prompts.is_empty() && self.resolver.is_none() {
            return Err(GatewayError::InvalidInput(format!(
                "pathway '{}' declares no prompts and no resolver",
                self.name
            )));
        }
        Ok(())
    }

    /// Record field names for list-of-records output, when declared
    pub fn format_fields(&self) -> Option<Vec<&str>> {
        self.format.as_deref().map(|format| {
            format
                .split([' ', ',', '|'])
                .filter(|f| !f.is_empty())
                .collect()
        })
    }
}
