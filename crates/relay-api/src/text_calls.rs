//! Tool calls written into plain text by models without native tool calling.
//!
//! The model is prompted to answer with
//!
//! ```text
//! TOOL_CALL: {"tool": "add", "arguments": {"x": 2, "y": 3}}
//! ```
//!
//! and everything before the marker is kept as the reply text.

use serde_json::Value;

const MARKER: &str = "TOOL_CALL:";

/// A tool call recovered from reply text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextToolCall {
    pub name: String,
    pub arguments: Value,
    /// Text before the marker, trimmed.
    pub preamble: String,
}

/// Find the first `TOOL_CALL:` object in `text`.
///
/// Accepts `tool` or `name` for the tool name, tolerates a Markdown code
/// fence around the object, and returns `None` when no well-formed object
/// follows the marker.
pub fn parse_text_tool_call(text: &str) -> Option<TextToolCall> {
    let start = text.find(MARKER)?;
    let mut rest = text[start + MARKER.len()..].trim_start();
    if let Some(stripped) = rest.strip_prefix("```") {
        rest = stripped.trim_start_matches("json").trim_start();
    }

    let value = serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .next()?
        .ok()?;
    let object = value.as_object()?;
    let name = object
        .get("tool")
        .or_else(|| object.get("name"))?
        .as_str()?
        .to_string();
    let arguments = match object.get("arguments") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(other) => other.clone(),
    };

    Some(TextToolCall {
        name,
        arguments,
        preamble: text[..start].trim().to_string(),
    })
}
