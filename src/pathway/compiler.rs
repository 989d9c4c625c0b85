// Prompt compilation: placeholder interpolation against args ∪ context,
// message rendering, and the token accounting the engine budgets chunks
// with.

use crate::error::{GatewayError, GatewayResult};
use crate::pathway::{CHAT_HISTORY_SLOT, ChatMessage, Prompt, PromptBody};
use crate::tokens::TokenCodec;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Per-message formatting overhead, matching the estimate the rest of the
/// stack bills with
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static regex compiles"));

/// Render a template against the parameter map. Strings substitute
/// verbatim; other values substitute as compact JSON; unknown placeholders
/// render empty.
pub fn interpolate(template: &str, params: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            match params.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// A prompt rendered against concrete parameters
#[derive(Clone, Debug)]
pub struct CompiledPrompt {
    pub messages: Vec<ChatMessage>,
    pub token_length: usize,
    pub uses_text_input: bool,
    pub uses_previous_result: bool,
}

fn chat_history_messages(params: &Map<String, Value>) -> Vec<ChatMessage> {
    let Some(Value::Array(history)) = params.get("chatHistory") else {
        return Vec::new();
    };
    history
        .iter()
        .filter_map(|entry| {
            let role = entry.get("role")?.as_str()?.to_string();
            let content = entry.get("content")?.as_str()?.to_string();
            Some(ChatMessage { role, content })
        })
        .collect()
}

/// Compile one prompt against args ∪ context. Calling this with the empty
/// text slot yields the prompt's fixed token overhead.
pub fn compile_prompt(
    codec: &TokenCodec,
    prompt: &Prompt,
    params: &Map<String, Value>,
) -> CompiledPrompt {
    let messages: Vec<ChatMessage> = match &prompt.body {
        PromptBody::Template(template) => {
            vec![ChatMessage::user(interpolate(template, params))]
        }
        PromptBody::Messages(messages) => messages
            .iter()
            .flat_map(|message| {
                if message.content.trim() == CHAT_HISTORY_SLOT {
                    chat_history_messages(params)
                } else {
                    vec![ChatMessage {
                        role: message.role.clone(),
                        content: interpolate(&message.content, params),
                    }]
                }
            })
            .collect(),
    };

    let token_length = messages
        .iter()
        .map(|m| codec.count_or_estimate(&m.content) + MESSAGE_OVERHEAD_TOKENS)
        .sum();

    CompiledPrompt {
        messages,
        token_length,
        uses_text_input: prompt.uses_text_input(),
        uses_previous_result: prompt.uses_previous_result(),
    }
}

/// Per-chunk token budget derived from the plugin's context-window split
/// and the largest fixed prompt overhead. Halved when any prompt consumes
/// both the text and the previous result.
pub fn chunk_token_budget(
    prompt_ratio: f64,
    model_context: usize,
    max_prompt_overhead: usize,
    any_dual_slot: bool,
) -> GatewayResult<usize> {
    let budget = prompt_ratio * model_context as f64 - max_prompt_overhead as f64 - 1.0;
    let mut budget = budget.floor() as i64;
    if any_dual_slot {
        budget /= 2;
    }
    if budget < 1 {
        return Err(GatewayError::PromptTooLarge(format!(
            "prompt overhead of {} tokens leaves no room in a {}-token context window",
            max_prompt_overhead, model_context
        )));
    }
    Ok(budget as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathway::Prompt;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn codec() -> TokenCodec {
        TokenCodec::for_model("gpt-4").unwrap()
    }

    #[test]
    fn test_interpolate_substitutes_strings_verbatim() {
        let params = params(&[("lang", json!("fr")), ("count", json!(3))]);
        assert_eq!(
            interpolate("Say hi in {{lang}}, {{count}} times", &params),
            "Say hi in fr, 3 times"
        );
    }

    #[test]
    fn test_interpolate_unknown_placeholder_renders_empty() {
        let params = Map::new();
        assert_eq!(interpolate("before {{missing}} after", &params), "before  after");
    }

    #[test]
    fn test_interpolate_tolerates_inner_whitespace() {
        let params = params(&[("text", json!("hello"))]);
        assert_eq!(interpolate("{{ text }}", &params), "hello");
    }

    #[test]
    fn test_compile_template_prompt() {
        let prompt = Prompt::from_template("Translate: {{text}}");
        let params = params(&[("text", json!("bonjour"))]);
        let compiled = compile_prompt(&codec(), &prompt, &params);
        assert_eq!(compiled.messages.len(), 1);
        assert_eq!(compiled.messages[0].role, "user");
        assert_eq!(compiled.messages[0].content, "Translate: bonjour");
        assert!(compiled.uses_text_input);
        assert!(compiled.token_length > 0);
    }

    #[test]
    fn test_compile_expands_chat_history_placeholder() {
        let prompt = Prompt::from_messages(vec![
            ChatMessage::system("Be helpful."),
            ChatMessage::user("{{chatHistory}}"),
            ChatMessage::user("{{text}}"),
        ]);
        let params = params(&[
            ("text", json!("next question")),
            (
                "chatHistory",
                json!([
                    {"role": "user", "content": "earlier question"},
                    {"role": "assistant", "content": "earlier answer"}
                ]),
            ),
        ]);
        let compiled = compile_prompt(&codec(), &prompt, &params);
        let roles: Vec<&str> = compiled.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(compiled.messages[1].content, "earlier question");
    }

    #[test]
    fn test_compile_drops_history_placeholder_when_absent() {
        let prompt = Prompt::from_messages(vec![
            ChatMessage::system("Be helpful."),
            ChatMessage::user("{{chatHistory}}"),
            ChatMessage::user("hi"),
        ]);
        let compiled = compile_prompt(&codec(), &prompt, &Map::new());
        assert_eq!(compiled.messages.len(), 2);
    }

    #[test]
    fn test_empty_compile_measures_fixed_overhead() {
        let prompt = Prompt::from_template("A fixed preamble. {{text}}");
        let mut params = Map::new();
        params.insert("text".to_string(), json!(""));
        let compiled = compile_prompt(&codec(), &prompt, &params);
        assert!(compiled.token_length >= MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_budget_basic() {
        let budget = chunk_token_budget(0.5, 8000, 100, false).unwrap();
        assert_eq!(budget, 3899);
    }

    #[test]
    fn test_budget_halved_for_dual_slot_prompts() {
        let full = chunk_token_budget(0.5, 8000, 100, false).unwrap();
        let halved = chunk_token_budget(0.5, 8000, 100, true).unwrap();
        assert_eq!(halved, full / 2);
    }

    #[test]
    fn test_budget_overflow_is_input_error() {
        let err = chunk_token_budget(0.5, 1000, 600, false).unwrap_err();
        assert!(matches!(err, GatewayError::PromptTooLarge(_)));
    }
}
