//! Batch tool execution.
//!
//! [`execute_batch`] resolves each requested tool, validates its arguments,
//! runs it under an individual timeout, and returns one outcome per call in
//! the input order regardless of finish order. Nothing escapes: unknown
//! tools, argument failures, timeouts, and cancellations all materialize as
//! `is_error=true` outcomes. Concurrency within a batch is bounded by a
//! semaphore; a cancel signal skips calls that have not started and aborts
//! those in flight.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{EventPayload, RunEmitter};
use crate::run::RunStatus;
use crate::runner::RunConfig;
use crate::step::NewStep;
use crate::tool::{RunnableArgs, ToolHandle, ToolRegistry};

/// One tool invocation requested by an assistant step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    /// Call identifier from the assistant step.
    pub id: String,
    /// Requested tool name.
    pub name: String,
    /// JSON-encoded argument string, verbatim.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// The materialized result of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// The call this outcome answers.
    pub call_id: String,
    /// The tool name.
    pub name: String,
    /// Result content (or diagnostic text on error).
    pub content: String,
    /// Whether the call failed.
    pub is_error: bool,
    /// Execution time in milliseconds.
    pub duration_ms: u64,
}

impl ToolOutcome {
    /// Convert into the tool step to persist.
    #[must_use]
    pub fn into_new_step(self) -> NewStep {
        NewStep::tool(self.call_id, self.name, self.content, self.is_error)
    }
}

/// Execution options for one batch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Run the batch concurrently.
    pub parallel: bool,
    /// Concurrency bound when parallel.
    pub max_parallel: usize,
    /// Individual deadline per call.
    pub timeout: Duration,
}

/// Everything a batch needs: the registry, options, the run's cancel token,
/// the event emitter, and the base config for nested child runs.
pub struct DispatchContext<'a> {
    /// Tool lookup for this run.
    pub registry: &'a ToolRegistry,
    /// Batch options.
    pub options: DispatchOptions,
    /// The run's cancellation token.
    pub token: CancellationToken,
    /// Event emitter stamped with the run's identity.
    pub emitter: &'a RunEmitter,
    /// Base config for child runs opened by runnable tools; carries the
    /// parent linkage and incremented depth.
    pub child_config: RunConfig,
}

/// Execute a batch of tool calls, returning outcomes in input order.
pub async fn execute_batch(ctx: &DispatchContext<'_>, calls: &[ToolCall]) -> Vec<ToolOutcome> {
    if calls.is_empty() {
        return Vec::new();
    }

    if ctx.options.parallel && calls.len() > 1 {
        let semaphore = Arc::new(Semaphore::new(ctx.options.max_parallel.max(1)));
        let futures = calls.iter().map(|call| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok();
                execute_single(ctx, call).await
            }
        });
        join_all(futures).await
    } else {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(execute_single(ctx, call).await);
        }
        outcomes
    }
}

async fn execute_single(ctx: &DispatchContext<'_>, call: &ToolCall) -> ToolOutcome {
    // Calls that have not started when cancellation lands are skipped.
    if ctx.token.is_cancelled() {
        return cancelled_outcome(call, 0);
    }

    ctx.emitter.emit(EventPayload::ToolCallStarted {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
    });

    let started = Instant::now();
    let executed = run_call(ctx, call).await;
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (content, is_error, duration_ms) = match executed {
        CallResult::Value(content) => (content, false, elapsed_ms),
        CallResult::Failed(content) => (content, true, elapsed_ms),
        CallResult::TimedOut => {
            #[allow(clippy::cast_possible_truncation)]
            let timeout_ms = ctx.options.timeout.as_millis() as u64;
            (
                format!("tool {} timed out after {timeout_ms} ms", call.name),
                true,
                timeout_ms,
            )
        }
        CallResult::Cancelled => {
            return cancelled_outcome(call, elapsed_ms);
        }
    };

    if is_error {
        warn!(tool = %call.name, call_id = %call.id, error = %content, "tool call failed");
        ctx.emitter.emit(EventPayload::ToolCallFailed {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            error: content.clone(),
        });
    } else {
        debug!(tool = %call.name, call_id = %call.id, duration_ms, "tool call completed");
    }

    ctx.emitter.emit(EventPayload::ToolCallCompleted {
        tool_call_id: call.id.clone(),
        result: content.clone(),
        is_success: !is_error,
        duration: duration_ms,
    });

    ToolOutcome {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content,
        is_error,
        duration_ms,
    }
}

enum CallResult {
    Value(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

async fn run_call(ctx: &DispatchContext<'_>, call: &ToolCall) -> CallResult {
    let Some(handle) = ctx.registry.get(&call.name) else {
        return CallResult::Failed(format!("Tool '{}' not found", call.name));
    };

    // Arguments are parsed exactly once, before dispatch.
    let parsed: Value = match serde_json::from_str(&call.arguments) {
        Ok(value) => value,
        Err(err) => {
            return CallResult::Failed(format!(
                "invalid arguments for tool '{}': {err}",
                call.name
            ));
        }
    };

    match handle {
        ToolHandle::Function(tool) => {
            tokio::select! {
                () = ctx.token.cancelled() => CallResult::Cancelled,
                result = tokio::time::timeout(ctx.options.timeout, tool.call_json(parsed)) => {
                    match result {
                        Err(_elapsed) => CallResult::TimedOut,
                        Ok(Ok(value)) => CallResult::Value(
                            serde_json::to_string(&value).unwrap_or_else(|_| value.to_string()),
                        ),
                        Ok(Err(err)) => CallResult::Failed(format!("Tool error: {err}")),
                    }
                }
            }
        }
        ToolHandle::Runnable(runnable) => {
            let args: RunnableArgs = match serde_json::from_value(parsed) {
                Ok(args) => args,
                Err(err) => {
                    return CallResult::Failed(format!(
                        "invalid arguments for tool '{}': {err}",
                        call.name
                    ));
                }
            };
            // Nested runnables are bounded by their own run-level limits
            // and the parent's cancellation, not the per-tool deadline.
            match runnable.run(&args.query, ctx.child_config.clone()).await {
                Ok(outcome) if outcome.status == RunStatus::Completed => {
                    CallResult::Value(outcome.output)
                }
                Ok(outcome) => CallResult::Failed(format!(
                    "sub-run '{}' ended with status {}",
                    call.name, outcome.status
                )),
                Err(err) => {
                    CallResult::Failed(format!("Runnable '{}' failed: {err}", call.name))
                }
            }
        }
    }
}

fn cancelled_outcome(call: &ToolCall, duration_ms: u64) -> ToolOutcome {
    ToolOutcome {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content: format!("tool '{}' cancelled", call.name),
        is_error: true,
        duration_ms,
    }
}
