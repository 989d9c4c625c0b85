pub mod html;
pub mod text;

use crate::error::{GatewayError, GatewayResult};
use crate::tokens::TokenCodec;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use html::chunk_html;
pub use text::chunk_text;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Text,
    Html,
}

static HTML_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(!doctype|html|head|body|div|p|span|br|table|ul|ol|li|h[1-6]|article|section|img|a)\b")
        .expect("static regex compiles")
});

/// Cheap tag scan used when a pathway declares no input format
pub fn detect_format(text: &str) -> InputFormat {
    if HTML_HINT.is_match(text) {
        InputFormat::Html
    } else {
        InputFormat::Text
    }
}

/// Split input into an ordered, permutation-free partition of chunks, each
/// encoding to at most `max_tokens` tokens. Empty input yields one empty
/// chunk, never an empty list.
pub fn semantic_chunk(
    codec: &TokenCodec,
    input: &str,
    max_tokens: usize,
    format: InputFormat,
) -> GatewayResult<Vec<String>> {
    if max_tokens == 0 {
        return Err(GatewayError::InvalidInput(
            "chunk size must be a positive token count".to_string(),
        ));
    }
    match format {
        InputFormat::Text => chunk_text(codec, input, max_tokens),
        InputFormat::Html => chunk_html(codec, input, max_tokens),
    }
}

fn decode_leading(codec: &TokenCodec, ids: &[u32], mut count: usize) -> String {
    // Back off token by token when the cut lands inside a multi-byte char
    while count > 0 {
        if let Ok(s) = codec.decode(ids[..count].to_vec()) {
            return s;
        }
        count -= 1;
    }
    String::new()
}

fn decode_trailing(codec: &TokenCodec, ids: &[u32], mut count: usize) -> String {
    while count > 0 {
        if let Ok(s) = codec.decode(ids[ids.len() - count..].to_vec()) {
            return s;
        }
        count -= 1;
    }
    String::new()
}

/// Keep the leading `max_tokens` tokens, backing off to the last whitespace
/// boundary when the cut would land mid-word
pub fn truncate_front(codec: &TokenCodec, input: &str, max_tokens: usize) -> GatewayResult<String> {
    if max_tokens == 0 {
        return Err(GatewayError::InvalidInput(
            "truncation budget must be a positive token count".to_string(),
        ));
    }
    let ids = codec.encode(input);
    if ids.len() <= max_tokens {
        return Ok(input.to_string());
    }

    let prefix = decode_leading(codec, &ids, max_tokens);
    let cut_on_boundary = prefix.ends_with(char::is_whitespace)
        || input[prefix.len()..].starts_with(char::is_whitespace);
    if cut_on_boundary {
        return Ok(prefix);
    }
    match prefix.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => {
            let ws_len = prefix[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
            Ok(prefix[..idx + ws_len].to_string())
        }
        _ => Ok(prefix),
    }
}

/// Keep the trailing `max_tokens` tokens, dropping the leading partial word
/// when the cut lands inside one
pub fn truncate_back(codec: &TokenCodec, input: &str, max_tokens: usize) -> GatewayResult<String> {
    if max_tokens == 0 {
        return Err(GatewayError::InvalidInput(
            "truncation budget must be a positive token count".to_string(),
        ));
    }
    let ids = codec.encode(input);
    if ids.len() <= max_tokens {
        return Ok(input.to_string());
    }

    let suffix = decode_trailing(codec, &ids, max_tokens);
    let boundary_byte = input.len() - suffix.len();
    let cut_on_boundary = suffix.starts_with(char::is_whitespace)
        || input[..boundary_byte].ends_with(char::is_whitespace);
    if cut_on_boundary {
        return Ok(suffix);
    }
    match suffix.find(char::is_whitespace) {
        Some(idx) => {
            let ws_len = suffix[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
            Ok(suffix[idx + ws_len..].to_string())
        }
        None => Ok(suffix),
    }
}

/// Character-bounded truncation ending at the last word boundary, with an
/// ellipsis appended when anything was dropped
pub fn semantic_truncate(input: &str, max_chars: usize) -> String {
    let total_chars = input.chars().count();
    if total_chars <= max_chars {
        return input.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let keep_bytes = input
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(input.len());
    let head = &input[..keep_bytes];

    let trimmed = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => head[..idx].trim_end(),
        _ => head,
    };
    format!("{}...", trimmed)
}

/// Lazy sequence rebuilding `text` one token at a time. Joining the yielded
/// pieces reproduces the input exactly; tokens that land inside a multi-byte
/// character are grouped into the piece that completes it.
pub struct SingleTokenChunks {
    codec: TokenCodec,
    text: String,
    ids: Vec<u32>,
    idx: usize,
    emitted: usize,
    pending: Vec<u32>,
    done: bool,
}

pub fn single_token_chunks(codec: &TokenCodec, text: &str) -> SingleTokenChunks {
    let ids = codec.encode(text).as_ref().clone();
    SingleTokenChunks {
        codec: codec.clone(),
        text: text.to_string(),
        ids,
        idx: 0,
        emitted: 0,
        pending: Vec::new(),
        done: false,
    }
}

impl Iterator for SingleTokenChunks {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        while self.idx < self.ids.len() {
            self.pending.push(self.ids[self.idx]);
            self.idx += 1;
            if let Ok(piece) = self.codec.decode(self.pending.clone()) {
                if self.text[self.emitted..].starts_with(&piece) {
                    self.emitted += piece.len();
                    self.pending.clear();
                    return Some(piece);
                }
                // Tokenizer normalization diverged from the source text;
                // flush the remainder verbatim to keep the join invariant
                break;
            }
        }
        self.done = true;
        if self.emitted < self.text.len() {
            let rest = self.text[self.emitted..].to_string();
            self.emitted = self.text.len();
            return Some(rest);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> TokenCodec {
        TokenCodec::for_model("gpt-4").unwrap()
    }

    #[test]
    fn test_zero_budget_is_an_error() {
        let err = semantic_chunk(&codec(), "hello", 0, InputFormat::Text).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_input_yields_single_empty_chunk() {
        let chunks = semantic_chunk(&codec(), "", 100, InputFormat::Text).unwrap();
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("plain prose, nothing else"), InputFormat::Text);
        assert_eq!(detect_format("<p>hello</p>"), InputFormat::Html);
        assert_eq!(detect_format("<!DOCTYPE html><html></html>"), InputFormat::Html);
        assert_eq!(detect_format("a < b and b > c"), InputFormat::Text);
    }

    #[test]
    fn test_truncate_front_keeps_leading_tokens() {
        let codec = codec();
        let input = "alpha beta gamma delta epsilon zeta eta theta".repeat(20);
        let out = truncate_front(&codec, &input, 12).unwrap();
        assert!(codec.count(&out) <= 12);
        assert!(input.starts_with(&out));
    }

    #[test]
    fn test_truncate_back_keeps_trailing_tokens() {
        let codec = codec();
        let input = "alpha beta gamma delta epsilon zeta eta theta ".repeat(20);
        let out = truncate_back(&codec, &input, 12).unwrap();
        assert!(codec.count(&out) <= 12);
        assert!(input.ends_with(&out));
    }

    #[test]
    fn test_truncate_noop_when_within_budget() {
        let codec = codec();
        assert_eq!(truncate_front(&codec, "short text", 100).unwrap(), "short text");
        assert_eq!(truncate_back(&codec, "short text", 100).unwrap(), "short text");
    }

    #[test]
    fn test_semantic_truncate_unchanged_when_fits() {
        assert_eq!(semantic_truncate("short", 10), "short");
        assert_eq!(semantic_truncate("exactly10!", 10), "exactly10!");
    }

    #[test]
    fn test_semantic_truncate_ends_at_word_boundary() {
        let out = semantic_truncate("the quick brown fox jumps over the lazy dog", 20);
        assert!(out.ends_with("..."));
        assert!(out.chars().count() <= 20);
        assert!(!out.trim_end_matches("...").ends_with(char::is_whitespace));
    }

    #[test]
    fn test_single_token_chunks_join_round_trips() {
        let codec = codec();
        for text in [
            "",
            "Hello, world!",
            "naïve café — résumé",
            "多语言文本 with mixed scripts و العربية",
        ] {
            let pieces: Vec<String> = single_token_chunks(&codec, text).collect();
            assert_eq!(pieces.concat(), text);
        }
    }

    #[test]
    fn test_single_token_chunks_are_fine_grained() {
        let codec = codec();
        let text = "one two three four five six seven eight";
        let pieces: Vec<String> = single_token_chunks(&codec, text).collect();
        assert!(pieces.len() >= 8);
    }
}
