//! Conversation types exchanged between the orchestration loop and the model.

use serde::{Deserialize, Serialize};

/// A structured request from the model to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Model {
        text: String,
    },
    ToolCall(ToolCall),
    ToolResult {
        call_id: String,
        name: String,
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Ordered turns accumulated while resolving one user query.
///
/// Created per query and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    turns: Vec<Turn>,
}

impl ConversationContext {
    /// Start a context from the user's query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            system: None,
            turns: vec![Turn::User { text: query.into() }],
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Most recent non-empty model text.
    pub fn last_model_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::Model { text } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
    }

    /// Most recent non-error, non-empty tool result text.
    pub fn last_tool_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::ToolResult {
                text,
                is_error: false,
                ..
            } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
    }
}

/// What the model answered for one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    /// Free text (may be empty when the model only requests tools).
    pub text: String,
    /// Tool calls in the order the model listed them.
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// A function declaration in the shape the model consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}
