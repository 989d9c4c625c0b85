// HTML splitter: parse into the flat list of body children and greedily
// pack whole children into chunks. Elements are never split; a single
// element over the budget is a hard error. Oversized bare text nodes are
// delegated to the plain-text splitter.

use crate::chunking::text::chunk_text;
use crate::error::{GatewayError, GatewayResult};
use crate::tokens::TokenCodec;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

static BODY_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("body").expect("static selector parses"));

pub fn chunk_html(codec: &TokenCodec, html: &str, max_tokens: usize) -> GatewayResult<Vec<String>> {
    if html.is_empty() {
        return Ok(vec![String::new()]);
    }

    // html5ever normalizes fragments into a full document, so body children
    // cover both bare fragments and complete pages
    let document = Html::parse_document(html);
    let body = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut chunks: Vec<String> = Vec::new();
    let mut buffer = String::new();

    for child in body.children() {
        let is_text_node = matches!(child.value(), Node::Text(_));
        let piece = match child.value() {
            Node::Element(_) => match ElementRef::wrap(child) {
                Some(element) => element.html(),
                None => continue,
            },
            Node::Text(text) => text.to_string(),
            Node::Comment(comment) => format!("<!--{}-->", &**comment),
            _ => continue,
        };
        if piece.is_empty() {
            continue;
        }

        let piece_tokens = codec.count_or_estimate(&piece);
        if piece_tokens > max_tokens {
            if !is_text_node {
                return Err(GatewayError::ChunkTooLarge(format!(
                    "HTML element of {} tokens exceeds the {}-token chunk budget and cannot be split",
                    piece_tokens, max_tokens
                )));
            }
            if !buffer.is_empty() {
                chunks.push(std::mem::take(&mut buffer));
            }
            chunks.extend(chunk_text(codec, &piece, max_tokens)?);
            continue;
        }

        if buffer.is_empty() {
            buffer = piece;
            continue;
        }

        // Re-count the joined candidate rather than summing per-piece
        // counts; BPE boundaries shift when strings are concatenated
        let mut candidate = buffer.clone();
        candidate.push_str(&piece);
        if codec.count_or_estimate(&candidate) > max_tokens {
            chunks.push(std::mem::take(&mut buffer));
            buffer = piece;
        } else {
            buffer = candidate;
        }
    }

    if !buffer.is_empty() {
        chunks.push(buffer);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    Ok(chunks)
}
