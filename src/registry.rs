//! Tool registry: the set of named operations clients may call.
//!
//! Handlers take a [`ToolContext`], which only the scheduler can build, so a
//! handler can only ever run on the host thread.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::ToolError;
use crate::scheduler::ToolContext;

/// Parameters passed to a handler.
pub type ToolParams = Map<String, Value>;

/// What a handler returns on success.
pub type ToolOutput = Map<String, Value>;

/// Signature of a tool handler.
pub type ToolHandler =
    dyn Fn(&mut ToolContext<'_>, ToolParams) -> Result<ToolOutput, ToolError> + Send + Sync;

/// A registered tool.
pub struct ToolDescriptor {
    name: String,
    description: String,
    schema: Value,
    handler: Box<ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// Tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Parameter schema.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    /// Runs the handler. Reachable only with a scheduler-built context.
    pub(crate) fn invoke(
        &self,
        ctx: &mut ToolContext<'_>,
        params: ToolParams,
    ) -> Result<ToolOutput, ToolError> {
        (self.handler)(ctx, params)
    }

    /// Checks `params` against the declared schema.
    ///
    /// Only `required` keys and the primitive `type` of each declared property
    /// are checked. Undeclared keys pass through.
    ///
    /// # Errors
    ///
    /// A message naming the first offending key.
    pub fn validate_params(&self, params: &ToolParams) -> Result<(), String> {
        validate_against(&self.schema, params)
    }

    /// The `listTools` view of this tool.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameter_schema: self.schema.clone(),
        }
    }
}

/// A tool as reported by `listTools`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameter_schema: Value,
}

fn validate_against(schema: &Value, params: &ToolParams) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !params.contains_key(key) {
                return Err(format!("missing required parameter '{key}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in params {
        let Some(expected) = properties.get(key).and_then(|p| p.get("type")) else {
            continue;
        };
        let accepted = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !accepted {
            return Err(format!(
                "parameter '{key}' must be of type {expected}, got {}",
                json_type_name(value)
            ));
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Thread-safe map of tool name to descriptor.
///
/// Shared as an `Arc` between the protocol server (lookup, list) and the
/// scheduler (invoke). Registering a name twice replaces the earlier entry.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<IndexMap<String, Arc<ToolDescriptor>>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, returning the descriptor it replaced, if any.
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: F,
    ) -> Option<Arc<ToolDescriptor>>
    where
        F: Fn(&mut ToolContext<'_>, ToolParams) -> Result<ToolOutput, ToolError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let descriptor = Arc::new(ToolDescriptor {
            name: name.clone(),
            description: description.into(),
            schema,
            handler: Box::new(handler),
        });
        let replaced = self.tools.write().insert(name.clone(), descriptor);
        if replaced.is_some() {
            info!(tool = %name, "tool re-registered, previous handler replaced");
        } else {
            debug!(tool = %name, "tool registered");
        }
        replaced
    }

    /// Finds a tool by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.read().get(name).cloned()
    }

    /// The current tool list.
    #[must_use]
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.read().values().map(|t| t.definition()).collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Writes the tool list, sorted by name, to `path` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_manifest(&self, path: &Path) -> std::io::Result<()> {
        let mut tools = self.list();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        let manifest = serde_json::json!({ "tools": tools });
        let body = serde_json::to_string_pretty(&manifest).map_err(std::io::Error::other)?;
        std::fs::write(path, body)?;
        info!(path = %path.display(), count = tools.len(), "wrote tools manifest");
        Ok(())
    }
}
