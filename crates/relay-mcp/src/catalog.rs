//! Tools advertised by one server, and their model-facing declarations.

use relay_types::ToolDeclaration;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Schema keys that describe the document rather than the arguments.
const IMPLEMENTATION_KEYS: &[&str] = &["$schema", "$id", "$comment", "additionalProperties"];

/// A tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ToolDescriptor {
    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: model_schema(&self.input_schema),
        }
    }
}

/// One page of a `tools/list` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The immutable tool list of one connection, in server order.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Build a catalog, keeping the first of any duplicate names.
    pub fn new(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut catalog = Self::default();
        for tool in descriptors {
            if catalog.index.contains_key(&tool.name) {
                tracing::warn!("Ignoring duplicate tool '{}'", tool.name);
                continue;
            }
            catalog.index.insert(tool.name.clone(), catalog.tools.len());
            catalog.tools.push(tool);
        }
        catalog
    }

    pub fn list(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations for the model, built from the cached list.
    pub fn describe_for_model(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(ToolDescriptor::declaration).collect()
    }
}

/// Strip implementation-only metadata from a JSON schema.
///
/// Recurses through `properties`, `items`, `anyOf`, `oneOf` and `allOf`.
/// Property names are left alone, so a property called `$id` survives.
pub fn model_schema(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let mut out = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        if IMPLEMENTATION_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = match key.as_str() {
            "properties" => match value {
                Value::Object(props) => Value::Object(
                    props
                        .iter()
                        .map(|(name, sub)| (name.clone(), model_schema(sub)))
                        .collect(),
                ),
                other => other.clone(),
            },
            "items" => match value {
                Value::Array(list) => Value::Array(list.iter().map(model_schema).collect()),
                other => model_schema(other),
            },
            "anyOf" | "oneOf" | "allOf" => match value {
                Value::Array(list) => Value::Array(list.iter().map(model_schema).collect()),
                other => other.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), value);
    }
    Value::Object(out)
}
