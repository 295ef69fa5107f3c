//! Runner configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::step::Step;

/// When the coordinator creates checkpoints automatically.
#[derive(Clone, Default)]
pub enum CheckpointStrategy {
    /// Only explicit `create_checkpoint` calls (the default).
    #[default]
    Manual,
    /// After every persisted assistant step.
    EveryStep,
    /// After assistant steps that carry tool calls.
    OnToolCall,
    /// After a tool step with `is_error=true`.
    OnError,
    /// Caller-provided predicate over the just-persisted step.
    Custom(Arc<dyn Fn(&Step) -> bool + Send + Sync>),
}

impl CheckpointStrategy {
    /// Whether a checkpoint should be taken after persisting `step`.
    #[must_use]
    pub fn should_checkpoint(&self, step: &Step) -> bool {
        match self {
            Self::Manual => false,
            Self::EveryStep => true,
            Self::OnToolCall => step.has_tool_calls(),
            Self::OnError => step.is_error,
            Self::Custom(predicate) => predicate(step),
        }
    }
}

impl fmt::Debug for CheckpointStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("Manual"),
            Self::EveryStep => f.write_str("EveryStep"),
            Self::OnToolCall => f.write_str("OnToolCall"),
            Self::OnError => f.write_str("OnError"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration for run execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum loop iterations per run (default 30).
    pub max_steps: usize,
    /// Whether a batch of tool calls runs concurrently (default true).
    pub parallel_tool_calls: bool,
    /// Concurrency bound for one tool batch (default 8).
    pub max_parallel_tool_calls: usize,
    /// Deadline for one tool call (default 60s).
    pub timeout_per_tool: Duration,
    /// Deadline for one loop iteration: LLM call plus its tool batch
    /// (default 120s).
    pub timeout_per_step: Duration,
    /// Deadline for the whole run (default none).
    pub timeout_per_run: Option<Duration>,
    /// Whether LLM output is streamed (default true).
    pub stream: bool,
    /// Automatic checkpointing policy (default manual).
    pub checkpoint_strategy: CheckpointStrategy,
    /// Per-subscriber event queue depth, applied when constructing the run
    /// tree's [`EventBus`](crate::event::EventBus) (default 1024).
    pub event_queue_size: usize,
    /// LLM call retries on provider error (default 0).
    pub max_retries: u32,
    /// Soft cap on context messages sent to the model (default none).
    pub context_window_messages: Option<usize>,
}

impl RunnerConfig {
    /// Default step budget.
    pub const DEFAULT_MAX_STEPS: usize = 30;
    /// Default tool-batch concurrency bound.
    pub const DEFAULT_MAX_PARALLEL_TOOL_CALLS: usize = 8;
    /// Default per-subscriber event queue depth.
    pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1024;

    /// Create a config with the documented defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_steps: Self::DEFAULT_MAX_STEPS,
            parallel_tool_calls: true,
            max_parallel_tool_calls: Self::DEFAULT_MAX_PARALLEL_TOOL_CALLS,
            timeout_per_tool: Duration::from_millis(60_000),
            timeout_per_step: Duration::from_millis(120_000),
            timeout_per_run: None,
            stream: true,
            checkpoint_strategy: CheckpointStrategy::Manual,
            event_queue_size: Self::DEFAULT_EVENT_QUEUE_SIZE,
            max_retries: 0,
            context_window_messages: None,
        }
    }

    /// Set the step budget.
    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Enable or disable parallel tool calls.
    #[must_use]
    pub const fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    /// Set the tool-batch concurrency bound.
    #[must_use]
    pub const fn with_max_parallel_tool_calls(mut self, bound: usize) -> Self {
        self.max_parallel_tool_calls = bound;
        self
    }

    /// Set the per-tool deadline.
    #[must_use]
    pub const fn with_timeout_per_tool(mut self, timeout: Duration) -> Self {
        self.timeout_per_tool = timeout;
        self
    }

    /// Set the per-step deadline.
    #[must_use]
    pub const fn with_timeout_per_step(mut self, timeout: Duration) -> Self {
        self.timeout_per_step = timeout;
        self
    }

    /// Set the run-wide deadline.
    #[must_use]
    pub const fn with_timeout_per_run(mut self, timeout: Duration) -> Self {
        self.timeout_per_run = Some(timeout);
        self
    }

    /// Set the automatic checkpointing policy.
    #[must_use]
    pub fn with_checkpoint_strategy(mut self, strategy: CheckpointStrategy) -> Self {
        self.checkpoint_strategy = strategy;
        self
    }

    /// Set the per-subscriber event queue depth.
    #[must_use]
    pub const fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// Set the LLM retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the soft context-window cap.
    #[must_use]
    pub const fn with_context_window_messages(mut self, cap: usize) -> Self {
        self.context_window_messages = Some(cap);
        self
    }

    /// Validate option ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a bound is zero or a deadline is empty.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(Error::config("max_steps must be at least 1"));
        }
        if self.max_parallel_tool_calls == 0 {
            return Err(Error::config("max_parallel_tool_calls must be at least 1"));
        }
        if self.event_queue_size == 0 {
            return Err(Error::config("event_queue_size must be at least 1"));
        }
        if self.timeout_per_tool.is_zero() || self.timeout_per_step.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.timeout_per_run.is_some_and(|d| d.is_zero()) {
            return Err(Error::config("timeout_per_run must be non-zero when set"));
        }
        if self.context_window_messages == Some(0) {
            return Err(Error::config(
                "context_window_messages must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::step::NewStep;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = RunnerConfig::new();
        assert_eq!(config.max_steps, 30);
        assert!(config.parallel_tool_calls);
        assert_eq!(config.max_parallel_tool_calls, 8);
        assert_eq!(config.timeout_per_tool, Duration::from_millis(60_000));
        assert_eq!(config.timeout_per_step, Duration::from_millis(120_000));
        assert!(config.timeout_per_run.is_none());
        assert!(config.stream);
        assert_eq!(config.event_queue_size, 1024);
        assert_eq!(config.max_retries, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_bounds_are_rejected() {
        assert!(RunnerConfig::new().with_max_steps(0).validate().is_err());
        assert!(
            RunnerConfig::new()
                .with_max_parallel_tool_calls(0)
                .validate()
                .is_err()
        );
        assert!(
            RunnerConfig::new()
                .with_timeout_per_run(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn checkpoint_strategies_fire_at_their_points() {
        let plain = NewStep::assistant("done").into_step("s", 1);
        let with_tools = NewStep::assistant_with_tool_calls(
            "",
            vec![crate::step::StepToolCall::new("c1", "t", "{}")],
        )
        .into_step("s", 2);
        let failed_tool = NewStep::tool("c1", "t", "boom", true).into_step("s", 3);

        assert!(!CheckpointStrategy::Manual.should_checkpoint(&with_tools));
        assert!(CheckpointStrategy::EveryStep.should_checkpoint(&plain));
        assert!(CheckpointStrategy::OnToolCall.should_checkpoint(&with_tools));
        assert!(!CheckpointStrategy::OnToolCall.should_checkpoint(&plain));
        assert!(CheckpointStrategy::OnError.should_checkpoint(&failed_tool));

        let custom = CheckpointStrategy::Custom(Arc::new(|step: &Step| step.sequence == 2));
        assert!(custom.should_checkpoint(&with_tools));
        assert!(!custom.should_checkpoint(&plain));
    }
}
