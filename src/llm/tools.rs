//! Tools the model may call in the middle of a response.
//!
//! The reader answers every tool call with a tool message and reopens the
//! stream. A failing or unknown tool does not fail the turn; the error text
//! is handed back to the model instead.

use super::{ToolCall, ToolSpec};
use crate::error::{KgError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A function the model can invoke.
pub trait Tool: Send + Sync {
    /// Name the model uses to call the tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn schema(&self) -> serde_json::Value;

    /// Run the tool with parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Tool`] for invalid arguments or execution failures.
    fn execute(&self, args: serde_json::Value) -> Result<String>;
}

/// Name-indexed set of tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TimeTool));
        registry
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Schemas advertised in chat requests, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Execute `call` and return the text handed back to the model.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Tool`] when the tool is unknown, the arguments are
    /// not JSON, or the tool itself fails.
    pub fn execute(&self, call: &ToolCall) -> Result<String> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| KgError::Tool(format!("unknown tool '{}'", call.name)))?;
        let args = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| {
                KgError::Tool(format!("invalid arguments for '{}': {e}", call.name))
            })?
        };
        tool.execute(args)
    }
}

/// Reports the current local date and time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeTool;

impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Get the current local date and time. Use this whenever the user asks what time or day it is."
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    fn execute(&self, _args: serde_json::Value) -> Result<String> {
        let now = chrono::Local::now();
        Ok(now.format("The current time is %H:%M on %A, %B %-d, %Y.").to_string())
    }
}
