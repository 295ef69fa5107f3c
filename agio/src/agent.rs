//! Agents: a provider, a toolset, and run configuration under one name.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::provider::SharedProvider;
use crate::run::RunOutcome;
use crate::runner::{RunConfig, Runner};
use crate::tool::{Tool, ToolRegistry};
use crate::workflow::Runnable;

/// An executable agent.
///
/// An agent binds an LLM provider, a tool registry, an optional system
/// prompt, and runner configuration. Running it produces [`Run`]s against a
/// session; it can also be registered as a tool of another agent, which
/// nests its runs under the caller's.
///
/// [`Run`]: crate::run::Run
pub struct Agent {
    id: String,
    description: String,
    system_prompt: Option<String>,
    model: String,
    provider: SharedProvider,
    tools: ToolRegistry,
    config: RunnerConfig,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("tools", &self.tools.names())
            .field("max_steps", &self.config.max_steps)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a new agent builder.
    #[inline]
    #[must_use]
    pub fn builder(id: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(id)
    }

    /// The agent's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The agent's description.
    #[inline]
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The system prompt, if configured.
    #[inline]
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// The model identifier sent to the provider.
    #[inline]
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The provider used for LLM calls.
    #[inline]
    #[must_use]
    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    /// The agent's tool registry.
    #[inline]
    #[must_use]
    pub const fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The agent's runner configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// A JSON descriptor of this agent's configuration, recorded in
    /// checkpoints.
    #[must_use]
    pub fn config_descriptor(&self) -> serde_json::Value {
        serde_json::json!({
            "agent_id": self.id,
            "model": self.model,
            "max_steps": self.config.max_steps,
            "parallel_tool_calls": self.config.parallel_tool_calls,
            "tools": self.tools.names(),
        })
    }
}

#[async_trait]
impl Runnable for Agent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, query: &str, config: RunConfig) -> Result<RunOutcome> {
        Runner::run(self, query, config).await
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    id: String,
    description: String,
    system_prompt: Option<String>,
    model: String,
    provider: Option<SharedProvider>,
    tools: ToolRegistry,
    config: RunnerConfig,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("id", &self.id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Start building an agent with the given identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            system_prompt: None,
            model: String::new(),
            provider: None,
            tools: ToolRegistry::new(),
            config: RunnerConfig::new(),
        }
    }

    /// Set the description shown when the agent is used as a tool.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the model identifier.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the provider.
    #[must_use]
    pub fn provider(mut self, provider: SharedProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self
    where
        T::Output: 'static,
    {
        self.tools.add(tool);
        self
    }

    /// Register a runnable (sub-agent or workflow) as a tool.
    #[must_use]
    pub fn runnable_tool(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.tools.add_runnable(runnable);
        self
    }

    /// Replace the whole tool registry.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Set the runner configuration.
    #[must_use]
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no provider is set or the runner
    /// configuration fails validation.
    pub fn build(self) -> Result<Agent> {
        let provider = self.provider.ok_or_else(|| {
            Error::config(format!(
                "agent '{}' has no provider configured; call .provider() before building",
                self.id
            ))
        })?;
        self.config.validate()?;

        Ok(Agent {
            id: self.id,
            description: self.description,
            system_prompt: self.system_prompt,
            model: if self.model.is_empty() {
                "default".to_owned()
            } else {
                self.model
            },
            provider,
            tools: self.tools,
            config: self.config,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::mock::{ScriptedProvider, ScriptedTurn};

    #[test]
    fn builder_requires_a_provider() {
        let err = Agent::builder("helper").build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn builder_validates_config() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("hi")]));
        let err = Agent::builder("helper")
            .provider(provider)
            .config(RunnerConfig::new().with_max_steps(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn builder_assembles_the_agent() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("hi")]));
        let agent = Agent::builder("helper")
            .description("a test agent")
            .system_prompt("be terse")
            .model("mock-1")
            .provider(provider)
            .build()
            .unwrap();

        assert_eq!(agent.id(), "helper");
        assert_eq!(agent.model(), "mock-1");
        assert_eq!(agent.system_prompt(), Some("be terse"));
        assert_eq!(agent.config_descriptor()["model"], "mock-1");
    }
}
