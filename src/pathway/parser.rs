// Response parsing: convert raw model text into the pathway's declared
// output shape. Dispatch order: custom parser, list shapes, permissive
// JSON, raw string.

use crate::error::{GatewayError, GatewayResult};
use crate::pathway::Pathway;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+[.)]\s+(.*)$").expect("static regex compiles"));

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n(.*?)\n?```\s*$").expect("static regex compiles")
});

/// Items of a numbered list, when at least one line carries `N.` or `N)`
/// numbering
fn numbered_list_items(raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = raw
        .lines()
        .filter_map(|line| {
            NUMBERED_LINE
                .captures(line)
                .map(|caps| caps[1].trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

/// Parse one numbered item into a record using the declared field names.
/// Labels are matched case-insensitively; each value runs to the next label
/// or the end of the item.
fn item_to_record(item: &str, fields: &[&str]) -> Option<Value> {
    let lower = item.to_lowercase();
    let mut label_spans: Vec<(usize, usize, &str)> = Vec::new();
    for field in fields {
        let needle = format!("{}:", field.to_lowercase());
        if let Some(start) = lower.find(&needle) {
            label_spans.push((start, start + needle.len(), field));
        }
    }
    if label_spans.is_empty() {
        return None;
    }
    label_spans.sort_by_key(|(start, _, _)| *start);

    let mut record = Map::new();
    for (i, (_, value_start, field)) in label_spans.iter().enumerate() {
        let value_end = label_spans
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(item.len());
        let value = item[*value_start..value_end]
            .trim()
            .trim_end_matches([',', ';'])
            .trim();
        record.insert(field.to_string(), Value::String(value.to_string()));
    }
    Some(Value::Object(record))
}

/// List-shaped parsing: numbered list, then numbered records when the
/// pathway declares `format` fields, then comma separation, then a
/// singleton wrapper. The result is always an array.
fn parse_list(pathway: &Pathway, raw: &str) -> Value {
    if let Some(items) = numbered_list_items(raw) {
        if let Some(fields) = pathway.format_fields() {
            let records: Vec<Value> = items
                .iter()
                .filter_map(|item| item_to_record(item, &fields))
                .collect();
            if records.len() == items.len() {
                return Value::Array(records);
            }
        }
        return Value::Array(items.into_iter().map(Value::String).collect());
    }

    let trimmed = raw.trim();
    if !trimmed.contains('\n') && trimmed.contains(',') {
        return Value::Array(
            trimmed
                .split(',')
                .map(|part| Value::String(part.trim().to_string()))
                .collect(),
        );
    }

    Value::Array(vec![Value::String(trimmed.to_string())])
}

/// Permissive JSON extraction: trim, unwrap a fenced code block, then fall
/// back to the outermost brace/bracket span
pub fn parse_json_permissive(raw: &str) -> GatewayResult<Value> {
    let trimmed = raw.trim();
    let candidate = CODE_FENCE
        .captures(trimmed)
        .map(|caps| caps[1].trim().to_string())
        .unwrap_or_else(|| trimmed.to_string());

    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Ok(value);
    }

    let open = candidate.find(['{', '[']);
    let close = candidate.rfind(['}', ']']);
    if let (Some(open), Some(close)) = (open, close) {
        if close > open {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate[open..=close]) {
                return Ok(value);
            }
        }
    }

    Err(GatewayError::ParseRejected(format!(
        "response is not valid JSON: {}",
        crate::chunking::semantic_truncate(trimmed, 120)
    )))
}

/// Parse the final model output according to the pathway's output contract
pub fn parse_response(pathway: &Pathway, raw: &str) -> GatewayResult<Value> {
    if let Some(parser) = &pathway.parser {
        return parser(raw);
    }
    if pathway.flags.list {
        return Ok(parse_list(pathway, raw));
    }
    if pathway.flags.json {
        return parse_json_permissive(raw);
    }
    Ok(Value::String(raw.to_string()))
}
