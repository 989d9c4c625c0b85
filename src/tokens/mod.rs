// Token codec shared by the chunker, the prompt compiler, and the engine.
// Wraps tiktoken-rs with a per-model tokenizer table and a bounded LRU memo
// of recent encodings so chunking loops do not re-encode the same window.

use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use lru::LruCache;
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base};
use tracing::debug;

/// Most recent encodings memoized process-wide
const ENCODE_CACHE_ENTRIES: usize = 1000;

/// Texts longer than this skip the memo; they are one-shot inputs, not
/// chunker windows, and would evict everything useful
const ENCODE_CACHE_MAX_TEXT_LEN: usize = 8 * 1024;

/// Fallback chars-per-token ratio when the tokenizer is unavailable
pub const CHARS_PER_TOKEN_HEURISTIC: usize = 4;

static TOKENIZERS: Lazy<DashMap<String, Arc<CoreBPE>>> = Lazy::new(DashMap::new);

static ENCODE_CACHE: Lazy<Mutex<LruCache<(String, String), Arc<Vec<u32>>>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(
        NonZeroUsize::new(ENCODE_CACHE_ENTRIES).expect("cache size is non-zero"),
    ))
});

/// Resolve the tokenizer for a model, trying the model-specific encoding
/// first and falling back to cl100k_base
fn build_tokenizer(model: &str) -> Result<CoreBPE, anyhow::Error> {
    if let Ok(tokenizer) = get_bpe_from_model(model) {
        return Ok(tokenizer);
    }

    let model_lower = model.to_lowercase();
    if model_lower.starts_with("gpt-4o") || model_lower.starts_with("o1") {
        debug!("Using o200k_base for model '{}'", model);
        return o200k_base();
    }

    debug!("No tokenizer match for '{}', using cl100k_base fallback", model);
    cl100k_base()
}

fn tokenizer_for_model(model: &str) -> GatewayResult<Arc<CoreBPE>> {
    if let Some(entry) = TOKENIZERS.get(model) {
        return Ok(entry.value().clone());
    }
    let tokenizer = build_tokenizer(model)
        .map_err(|e| GatewayError::Internal(format!("Tokenizer init failed: {}", e)))?;
    let tokenizer = Arc::new(tokenizer);
    TOKENIZERS.insert(model.to_string(), tokenizer.clone());
    Ok(tokenizer)
}

/// Encode/decode handle bound to one model's tokenizer.
///
/// Cloning is cheap; all clones share the process-wide encode memo.
#[derive(Clone)]
pub struct TokenCodec {
    model: String,
    tokenizer: Arc<CoreBPE>,
}

impl TokenCodec {
    pub fn for_model(model: &str) -> GatewayResult<Self> {
        Ok(Self {
            model: model.to_string(),
            tokenizer: tokenizer_for_model(model)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Encode text to token ids, consulting the LRU memo for short texts
    pub fn encode(&self, text: &str) -> Arc<Vec<u32>> {
        if text.len() <= ENCODE_CACHE_MAX_TEXT_LEN {
            let key = (self.model.clone(), text.to_string());
            if let Ok(mut cache) = ENCODE_CACHE.lock() {
                if let Some(ids) = cache.get(&key) {
                    return ids.clone();
                }
            }
            let ids = Arc::new(self.tokenizer.encode_with_special_tokens(text));
            if let Ok(mut cache) = ENCODE_CACHE.lock() {
                cache.put(key, ids.clone());
            }
            return ids;
        }
        Arc::new(self.tokenizer.encode_with_special_tokens(text))
    }

    /// Decode token ids back to text. A slice ending inside a multi-byte
    /// character is a tokenizer error and propagates to the caller.
    pub fn decode(&self, ids: Vec<u32>) -> GatewayResult<String> {
        self.tokenizer
            .decode(ids)
            .map_err(|e| GatewayError::Internal(format!("Token decode failed: {}", e)))
    }

    /// Token count for a text
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.encode(text).len()
    }

    /// Token count with the chars/4 heuristic as a guard value for empty
    /// tokenizer output on non-empty text
    pub fn count_or_estimate(&self, text: &str) -> usize {
        let count = self.count(text);
        if count == 0 && !text.is_empty() {
            return estimate_tokens_heuristic(text);
        }
        count
    }
}

/// Character-based token estimate used when no tokenizer is available
pub fn estimate_tokens_heuristic(text: &str) -> usize {
    let char_count = text.chars().count();
    (char_count + CHARS_PER_TOKEN_HEURISTIC - 1) / CHARS_PER_TOKEN_HEURISTIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_empty() {
        let codec = TokenCodec::for_model("gpt-4").unwrap();
        assert_eq!(codec.count(""), 0);
    }

    #[test]
    fn test_count_short_text() {
        let codec = TokenCodec::for_model("gpt-4").unwrap();
        let tokens = codec.count("Hello, world!");
        assert!(tokens > 0);
        assert!(tokens < 20);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = TokenCodec::for_model("gpt-4").unwrap();
        let text = "The quick brown fox jumps over the lazy dog";
        let ids = codec.encode(text);
        let decoded = codec.decode(ids.as_ref().clone()).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_encode_memo_returns_same_result() {
        let codec = TokenCodec::for_model("gpt-4").unwrap();
        let first = codec.encode("memoized text");
        let second = codec.encode("memoized text");
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let codec = TokenCodec::for_model("totally-unknown-model").unwrap();
        assert!(codec.count("Hello") > 0);
    }

    #[test]
    fn test_heuristic_estimate() {
        assert_eq!(estimate_tokens_heuristic(""), 0);
        assert_eq!(estimate_tokens_heuristic("abcd"), 1);
        assert_eq!(estimate_tokens_heuristic("abcde"), 2);
    }
}
