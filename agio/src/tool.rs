//! Tool trait and registry.
//!
//! Tools are named functions the LLM may request, each with a declared
//! JSON-Schema argument shape. Typed arguments are the validation contract:
//! the dispatcher deserializes the JSON argument string into the tool's
//! `Args` type before the body runs, so a schema mismatch becomes an
//! `invalid arguments` result rather than a tool invocation.
//!
//! A registry entry may also be a [`Runnable`] (an agent or workflow), which
//! executes as a nested child run when invoked.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::workflow::Runnable;

/// Definition of a tool for LLM function calling.
///
/// Serializes to the chat-completions function-calling format:
/// `{"type": "function", "function": {"name", "description", "parameters"}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool, snake_case.
    pub name: String,
    /// What the tool does; guides the model's selection.
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Serialize for ToolDefinition {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut function = serde_json::Map::new();
        function.insert("name".to_owned(), Value::String(self.name.clone()));
        function.insert(
            "description".to_owned(),
            Value::String(self.description.clone()),
        );
        function.insert("parameters".to_owned(), self.parameters.clone());

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &function)?;
        map.end()
    }
}

/// The core trait for tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type; its serde shape is the enforced schema.
    type Args: for<'de> Deserialize<'de> + Send;

    /// Output type of the tool.
    type Output: Serialize + Send;

    /// Error type for tool execution.
    type Error: Into<ToolError> + Send;

    /// Get the name of the tool.
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with typed arguments.
    async fn call(&self, args: Self::Args) -> std::result::Result<Self::Output, Self::Error>;

    /// Get the tool definition for LLM function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }

    /// Call the tool with an already-parsed JSON argument value.
    ///
    /// Deserialization into [`Args`](Self::Args) is the schema-validation
    /// boundary; a mismatch returns [`ToolError::InvalidArguments`] without
    /// invoking the tool body.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] on invalid arguments or execution failure.
    async fn call_json(&self, args: Value) -> std::result::Result<Value, ToolError>
    where
        Self::Output: 'static,
    {
        let typed: Self::Args = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let output = self.call(typed).await.map_err(Into::into)?;
        serde_json::to_value(output).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// A boxed dynamic tool.
pub type BoxedTool = Box<dyn DynTool>;

/// Object-safe version of [`Tool`] for dynamic dispatch.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Get the name of the tool.
    fn name(&self) -> &str;

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Call the tool with a parsed JSON argument value.
    async fn call_json(&self, args: Value) -> std::result::Result<Value, ToolError>;
}

#[async_trait]
impl<T: Tool + 'static> DynTool for T
where
    T::Output: 'static,
{
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn description(&self) -> String {
        Tool::description(self)
    }

    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    async fn call_json(&self, args: Value) -> std::result::Result<Value, ToolError> {
        Tool::call_json(self, args).await
    }
}

/// Arguments accepted by a runnable exposed as a tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnableArgs {
    /// The query to hand to the nested agent or workflow.
    pub query: String,
}

/// A registry entry: a plain function tool or a nested runnable.
pub enum ToolHandle {
    /// An ordinary tool.
    Function(BoxedTool),
    /// An agent or workflow invoked as a nested child run.
    Runnable(Arc<dyn Runnable>),
}

impl ToolHandle {
    /// The entry's tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Function(tool) => tool.name(),
            Self::Runnable(runnable) => runnable.id(),
        }
    }

    /// The entry's definition for LLM function calling.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        match self {
            Self::Function(tool) => tool.definition(),
            Self::Runnable(runnable) => runnable_definition(runnable.as_ref()),
        }
    }
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(tool) => f.debug_tuple("Function").field(&tool.name()).finish(),
            Self::Runnable(runnable) => f.debug_tuple("Runnable").field(&runnable.id()).finish(),
        }
    }
}

/// Build the function-calling definition for a runnable.
#[must_use]
pub fn runnable_definition(runnable: &dyn Runnable) -> ToolDefinition {
    let description = format!(
        "Delegate a task to a sub-agent.\n\nAgent name: {}\nAgent description: {}",
        runnable.id(),
        runnable.description(),
    );
    let parameters = serde_json::to_value(schemars::schema_for!(RunnableArgs))
        .expect("converting JSON schema to JSON value should never fail");
    ToolDefinition::new(runnable.id(), description, parameters)
}

/// A per-run collection of invocable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolHandle>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool.
    pub fn add<T: Tool + 'static>(&mut self, tool: T)
    where
        T::Output: 'static,
    {
        self.tools
            .insert(tool.name().to_owned(), ToolHandle::Function(Box::new(tool)));
    }

    /// Add a boxed tool.
    pub fn add_boxed(&mut self, tool: BoxedTool) {
        self.tools
            .insert(tool.name().to_owned(), ToolHandle::Function(tool));
    }

    /// Register a runnable (agent or workflow) as a tool.
    pub fn add_runnable(&mut self, runnable: Arc<dyn Runnable>) {
        self.tools
            .insert(runnable.id().to_owned(), ToolHandle::Runnable(runnable));
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.get(name)
    }

    /// All tool definitions, for the chat request.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(ToolHandle::definition).collect()
    }

    /// The names of all registered tools.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.values().map(ToolHandle::name).collect()
    }

    /// Whether a tool with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
