// Custom resolvers: pathway-owned control flow layered over the standard
// prompt pipeline. Each carries its own iteration bound; nested engine
// invocations share the caller's request id and context.

use crate::engine::{CustomResolver, PathwayEngine};
use crate::error::{GatewayError, GatewayResult};
use crate::pathway::Pathway;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

fn usize_arg(args: &Map<String, Value>, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

/// Re-prompts until enough candidate lines fit under the target length, or
/// the iteration bound is spent. Returns the first `count` fitting lines.
pub struct HeadlineResolver {
    pub max_iterations: usize,
}

impl Default for HeadlineResolver {
    fn default() -> Self {
        Self { max_iterations: 3 }
    }
}

fn candidate_lines(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::String(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl CustomResolver for HeadlineResolver {
    async fn resolve(
        &self,
        engine: &PathwayEngine,
        pathway: &Pathway,
        args: &Map<String, Value>,
        request_id: &str,
    ) -> GatewayResult<Value> {
        let count = usize_arg(args, "count", 5);
        let target_length = usize_arg(args, "targetLength", 65);

        let mut accepted: Vec<String> = Vec::new();
        for iteration in 0..self.max_iterations {
            if engine.registry().is_canceled(request_id) {
                return Err(GatewayError::Canceled(format!(
                    "request {} canceled during re-prompt",
                    request_id
                )));
            }

            let value = engine.execute_prompts(pathway, args, request_id).await?;
            for line in candidate_lines(value) {
                if line.chars().count() < target_length && !accepted.contains(&line) {
                    accepted.push(line);
                }
            }
            debug!(
                iteration = iteration + 1,
                accepted = accepted.len(),
                wanted = count,
                "headline_reprompt_round"
            );
            if accepted.len() >= count {
                break;
            }
        }

        accepted.truncate(count);
        Ok(Value::Array(accepted.into_iter().map(Value::String).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_lines_from_array() {
        let lines = candidate_lines(json!(["one", "two", 3]));
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_candidate_lines_from_text() {
        let lines = candidate_lines(json!("first\n\n  second  \n"));
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }
}
