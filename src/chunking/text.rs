// Windowed semantic splitter for plain text. Estimates a character window
// from the model's chars-per-token ratio, then searches the window backward
// for the best break point: paragraph > sentence > phrase > whitespace.

use crate::error::GatewayResult;
use crate::tokens::TokenCodec;
use tracing::trace;

/// Sample prefix length used to estimate the chars-per-token ratio
const RATIO_SAMPLE_CHARS: usize = 2048;

/// Sentence terminators across the scripts the gateway sees in practice:
/// Latin, CJK, Arabic/Urdu, Devanagari, Armenian, Ethiopic.
const SENTENCE_BREAKS: &[char] = &[
    '.', '!', '?', '…', '。', '！', '？', '؟', '۔', '।', '॥', '՞', '։', '።',
];

/// Phrase delimiters: comma/semicolon/colon/dash families per script.
/// Thai carries no sentence terminator; its phrase breaks land here and in
/// the whitespace tier.
const PHRASE_BREAKS: &[char] = &[
    ',', ';', ':', '–', '—', '、', '，', '；', '：', '،', '؛', '፣', '፤',
];

/// Byte index just past `max_chars` characters, clamped to the text length
fn byte_index_for_chars(text: &str, max_chars: usize) -> usize {
    text.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// Find the best break point inside `window`, returned as a byte offset to
/// split at (the delimiter stays with the leading chunk). Returns None when
/// the window contains no usable break.
fn find_break_point(window: &str) -> Option<usize> {
    // Paragraph delimiters first; a single newline is the paragraph
    // fallback before dropping to sentence search
    if let Some(idx) = window.rfind("\n\n") {
        if idx > 0 {
            return Some(idx + 2);
        }
    }
    if let Some(idx) = window.rfind('\n') {
        if idx > 0 {
            return Some(idx + 1);
        }
    }

    for breaks in [SENTENCE_BREAKS, PHRASE_BREAKS] {
        if let Some((idx, ch)) = window
            .char_indices()
            .rev()
            .find(|(idx, ch)| breaks.contains(ch) && *idx > 0)
        {
            return Some(idx + ch.len_utf8());
        }
    }

    if let Some((idx, ch)) = window
        .char_indices()
        .rev()
        .find(|(idx, ch)| ch.is_whitespace() && *idx > 0)
    {
        return Some(idx + ch.len_utf8());
    }

    None
}

/// Cut one chunk off the front of `text`, returning its byte length.
/// Shrinks the window proportionally while the candidate still exceeds the
/// token budget; falls back to a single character to guarantee progress.
fn take_chunk(codec: &TokenCodec, text: &str, max_tokens: usize, window_chars: usize) -> usize {
    let mut window_chars = window_chars.max(1);

    loop {
        let window_end = byte_index_for_chars(text, window_chars);
        let window = &text[..window_end];

        let split_at = if window_end == text.len() {
            window_end
        } else {
            find_break_point(window).unwrap_or(window_end)
        };

        let candidate = &text[..split_at];
        let tokens = codec.count_or_estimate(candidate);
        if tokens <= max_tokens || candidate.chars().count() <= 1 {
            return split_at;
        }

        // Shrink proportionally toward the budget; strictly decrease so the
        // loop terminates even when the estimate is off
        let shrunk = window_chars * max_tokens / tokens;
        window_chars = shrunk.clamp(1, window_chars - 1);
        trace!(
            tokens = tokens,
            max_tokens = max_tokens,
            window_chars = window_chars,
            "chunk window over budget, shrinking"
        );
    }
}

/// Estimate chars-per-token from a sample prefix, never below 1.0
fn chars_per_token(codec: &TokenCodec, text: &str) -> f64 {
    let sample_end = byte_index_for_chars(text, RATIO_SAMPLE_CHARS);
    let sample = &text[..sample_end];
    let sample_chars = sample.chars().count();
    let sample_tokens = codec.count_or_estimate(sample).max(1);
    (sample_chars as f64 / sample_tokens as f64).max(1.0)
}

/// Split `text` into an ordered partition where each piece encodes to at
/// most `max_tokens` tokens. Concatenating the pieces reproduces the input.
pub fn chunk_text(codec: &TokenCodec, text: &str, max_tokens: usize) -> GatewayResult<Vec<String>> {
    if text.is_empty() {
        return Ok(vec![String::new()]);
    }
    if codec.count_or_estimate(text) <= max_tokens {
        return Ok(vec![text.to_string()]);
    }

    let ratio = chars_per_token(codec, text);
    let window_chars = ((max_tokens as f64) * ratio).floor() as usize;

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if codec.count_or_estimate(rest) <= max_tokens {
            chunks.push(rest.to_string());
            break;
        }
        let cut = take_chunk(codec, rest, max_tokens, window_chars);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> TokenCodec {
        TokenCodec::for_model("gpt-4").unwrap()
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text(&codec(), "Hello world", 100).unwrap();
        assert_eq!(chunks, vec!["Hello world".to_string()]);
    }

    #[test]
    fn test_empty_text_yields_single_empty_chunk() {
        let chunks = chunk_text(&codec(), "", 100).unwrap();
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn test_join_preserves_input() {
        let text = "First paragraph about one topic.\n\nSecond paragraph, with a clause; and more. Third sentence here! A question? Yes.\n\nFinal paragraph with enough words to force several windows when the budget is small."
            .repeat(8);
        let chunks = chunk_text(&codec(), &text, 30).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_every_chunk_within_budget() {
        let codec = codec();
        let text = "One sentence. Another sentence follows it. And a third one, with commas, for flavor. ".repeat(40);
        let max_tokens = 25;
        let chunks = chunk_text(&codec, &text, max_tokens).unwrap();
        for chunk in &chunks {
            assert!(
                codec.count(chunk) <= max_tokens,
                "chunk over budget: {:?}",
                chunk
            );
        }
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let codec = codec();
        let text = format!("{}\n\n{}", "alpha beta gamma ".repeat(10), "delta ".repeat(200));
        let chunks = chunk_text(&codec, &text, 60).unwrap();
        assert!(chunks[0].ends_with("\n\n"));
    }

    #[test]
    fn test_breaks_on_cjk_sentence_terminator() {
        let codec = codec();
        let text = "这是第一句话。这是第二句话。".repeat(60);
        let chunks = chunk_text(&codec, &text, 40).unwrap();
        assert_eq!(chunks.concat(), text);
        assert!(chunks.len() > 1);
        assert!(chunks[0].ends_with('。'));
    }

    #[test]
    fn test_unbreakable_run_still_progresses() {
        let codec = codec();
        let text = "x".repeat(4000);
        let chunks = chunk_text(&codec, &text, 10).unwrap();
        assert_eq!(chunks.concat(), text);
        for chunk in &chunks {
            assert!(codec.count(chunk) <= 10);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_join_round_trips(text in "[ -~\\n]{0,400}", max_tokens in 1usize..40) {
            let codec = codec();
            let chunks = chunk_text(&codec, &text, max_tokens).unwrap();
            prop_assert_eq!(chunks.concat(), text);
        }

        #[test]
        fn prop_chunks_within_budget(text in "[ -~\\n]{1,400}", max_tokens in 1usize..40) {
            let codec = codec();
            let chunks = chunk_text(&codec, &text, max_tokens).unwrap();
            for chunk in chunks {
                prop_assert!(codec.count(&chunk) <= max_tokens);
            }
        }
    }
}
