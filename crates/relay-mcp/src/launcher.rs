//! Choosing an interpreter for a server script.

use crate::error::ConnectError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_python() -> String {
    "python3".to_string()
}

fn default_node() -> String {
    "node".to_string()
}

/// Script languages a server may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Python,
    JavaScript,
}

impl ScriptKind {
    /// Detect the language from the file extension, ignoring case.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(ScriptKind::Python),
            "js" | "mjs" | "cjs" => Some(ScriptKind::JavaScript),
            _ => None,
        }
    }
}

/// Interpreter commands per script language.
///
/// A launcher may include leading arguments, e.g. `"uv run python"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Launchers {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_node")]
    pub node: String,
}

impl Default for Launchers {
    fn default() -> Self {
        Self {
            python: default_python(),
            node: default_node(),
        }
    }
}

impl Launchers {
    /// The command and arguments that run `script`.
    pub fn command_for(&self, script: &Path) -> Result<(String, Vec<String>), ConnectError> {
        let kind = ScriptKind::detect(script).ok_or_else(|| ConnectError::UnsupportedScriptType {
            path: script.display().to_string(),
        })?;
        let launcher = match kind {
            ScriptKind::Python => &self.python,
            ScriptKind::JavaScript => &self.node,
        };

        let mut parts = launcher.split_whitespace().map(str::to_string);
        let command = parts.next().unwrap_or_else(|| match kind {
            ScriptKind::Python => default_python(),
            ScriptKind::JavaScript => default_node(),
        });
        let mut args: Vec<String> = parts.collect();
        args.push(script.display().to_string());
        Ok((command, args))
    }
}
