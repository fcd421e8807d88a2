//! Wire types for the `/api/chat` endpoint and conversions to Relay's types.

use crate::text_calls::parse_text_tool_call;
use relay_types::{ConversationContext, ModelReply, ToolCall, ToolDeclaration, Turn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /api/chat`.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool<'a>>,
    pub stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub fn new(model: &'a str, context: &ConversationContext, tools: &'a [ToolDeclaration]) -> Self {
        Self {
            model,
            messages: messages_from_context(context),
            tools: tools.iter().map(ChatTool::function).collect(),
            stream: false,
        }
    }
}

/// A tool declaration wrapped as `{"type": "function", "function": ...}`.
#[derive(Debug, Serialize)]
pub struct ChatTool<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: &'a ToolDeclaration,
}

impl<'a> ChatTool<'a> {
    fn function(declaration: &'a ToolDeclaration) -> Self {
        Self {
            kind: "function",
            function: declaration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub function: WireFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Response body for a non-streaming chat request.
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done_reason: Option<String>,
}

/// Flatten the context into chat messages.
///
/// A tool call joins the assistant message directly before it; otherwise it
/// opens a new assistant message with empty content.
pub fn messages_from_context(context: &ConversationContext) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    if let Some(system) = context.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(ChatMessage::new("system", system));
    }

    for turn in context.turns() {
        match turn {
            Turn::User { text } => messages.push(ChatMessage::new("user", text.as_str())),
            Turn::Model { text } => messages.push(ChatMessage::new("assistant", text.as_str())),
            Turn::ToolCall(call) => {
                let wire = WireToolCall {
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                };
                match messages.last_mut() {
                    Some(last) if last.role == "assistant" => last.tool_calls.push(wire),
                    _ => {
                        let mut message = ChatMessage::new("assistant", "");
                        message.tool_calls.push(wire);
                        messages.push(message);
                    }
                }
            }
            Turn::ToolResult { name, text, .. } => {
                let mut message = ChatMessage::new("tool", text.as_str());
                message.tool_name = Some(name.clone());
                messages.push(message);
            }
        }
    }
    messages
}

/// Turn the assistant message into a reply, assigning tool-call ids.
pub fn reply_from_message(message: ChatMessage) -> ModelReply {
    if message.tool_calls.is_empty() {
        if let Some(call) = parse_text_tool_call(&message.content) {
            tracing::debug!("Recovered text tool call '{}'", call.name);
            return ModelReply {
                text: call.preamble,
                tool_calls: vec![ToolCall {
                    id: new_call_id(),
                    name: call.name,
                    arguments: call.arguments,
                }],
            };
        }
    }

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|wire| ToolCall {
            id: new_call_id(),
            name: wire.function.name,
            arguments: normalize_arguments(wire.function.arguments),
        })
        .collect();
    ModelReply {
        text: message.content,
        tool_calls,
    }
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Tool arguments are not valid JSON: {e}");
                Value::String(raw)
            }
        },
        other => other,
    }
}
