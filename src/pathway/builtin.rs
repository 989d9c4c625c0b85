// Pathways shipped with the server. `summary` backs input summarization
// (the engine recurses into it), and `headline_custom` demonstrates the
// bounded re-prompt custom-resolver path.

use crate::engine::resolvers::HeadlineResolver;
use crate::pathway::{ChatMessage, InputKind, InputParameter, Pathway, Prompt};
use serde_json::json;
use std::sync::Arc;

fn chat(model: &str) -> Pathway {
    let mut pathway = Pathway::new("chat", model);
    pathway.display_name = Some("Chat".to_string());
    pathway.prompts.push(Prompt::from_template("{{text}}"));
    pathway
}

fn summary(model: &str) -> Pathway {
    let mut pathway = Pathway::new("summary", model);
    pathway.display_name = Some("Summary".to_string());
    pathway.flags.use_input_chunking = true;
    pathway.inputs.insert(
        "targetLength".to_string(),
        InputParameter {
            kind: InputKind::Number,
            default: Some(json!(0)),
        },
    );
    pathway.prompts.push(Prompt::from_messages(vec![
        ChatMessage::system(
            "You condense text while preserving its key facts, names and tone. \
             When the target length is greater than zero, aim for roughly that \
             many characters; otherwise be as brief as accuracy allows.",
        ),
        ChatMessage::user("Target length: {{targetLength}}\n\n{{text}}"),
    ]));
    pathway
}

fn headline(model: &str) -> Pathway {
    let mut pathway = Pathway::new("headline_custom", model);
    pathway.display_name = Some("Headlines".to_string());
    pathway.flags.list = true;
    pathway.inputs.insert(
        "count".to_string(),
        InputParameter {
            kind: InputKind::Number,
            default: Some(json!(5)),
        },
    );
    pathway.inputs.insert(
        "targetLength".to_string(),
        InputParameter {
            kind: InputKind::Number,
            default: Some(json!(65)),
        },
    );
    pathway.prompts.push(Prompt::from_template(
        "Write {{count}} distinct headline options for the following article. \
         Each headline must be under {{targetLength}} characters.\n\n\
         Article:\n{{text}}\n\nReturn a numbered list.",
    ));
    pathway.resolver = Some(Arc::new(HeadlineResolver::default()));
    pathway
}

/// The pathway set installed at startup, all targeting the default model
pub fn builtin_pathways(model: &str) -> Vec<Pathway> {
    vec![chat(model), summary(model), headline(model)]
}
