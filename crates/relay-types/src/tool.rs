//! Seam for out-of-process tool execution.

use crate::{ToolDeclaration, ToolError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Result of executing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolOutputContent>,
    /// The tool ran but reported failure.
    pub is_error: bool,
}

/// A single piece of tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutputContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolOutputContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolOutputContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// All text parts joined by newlines; images are summarized.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolOutputContent::Text { text } => text.clone(),
                ToolOutputContent::Image { mime_type, .. } => format!("[image: {mime_type}]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A boxed tool execution future.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// Something that can advertise and run tools by name.
pub trait ToolExecutor: Send + Sync {
    /// Declarations for every tool currently available.
    fn declarations(&self) -> Vec<ToolDeclaration>;

    /// Run the named tool with JSON arguments.
    fn execute<'a>(&'a self, name: &'a str, arguments: serde_json::Value) -> ToolFuture<'a>;
}
