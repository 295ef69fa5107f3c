//! The step executor: one LLM call, streamed.
//!
//! Drives a single streaming provider call, forwarding `step_delta` events
//! as chunks arrive, assembling the canonical assistant step from the
//! fragments, recording first-token latency, and logging the call to the
//! session store. Replaying the emitted deltas reproduces exactly the
//! `step_completed` snapshot.

use chrono::Utc;
use futures::StreamExt as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{EventPayload, FunctionDelta, RunEmitter, StepDelta, ToolCallDelta};
use crate::provider::{ChatProvider, ChatRequest};
use crate::step::{NewStep, StepMetrics, StepToolCall};
use crate::store::{LlmCallLog, LlmCallStatus, SessionStore};
use crate::stream::{StepAggregator, StreamChunk};
use crate::usage::Usage;

/// The assembled assistant step before persistence.
#[derive(Debug, Clone)]
pub struct AssistantDraft {
    /// Accumulated text content.
    pub content: String,
    /// Assembled tool calls, in index order.
    pub tool_calls: Vec<StepToolCall>,
    /// Usage reported by the provider, if any.
    pub usage: Option<Usage>,
    /// Latency to the first non-empty token.
    pub first_token_ms: Option<u64>,
    /// Total call duration.
    pub duration_ms: u64,
}

impl AssistantDraft {
    /// Convert into the step to persist.
    #[must_use]
    pub fn into_new_step(self) -> NewStep {
        let usage = self.usage.unwrap_or_default();
        let metrics = StepMetrics {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            duration_ms: self.duration_ms,
            first_token_ms: self.first_token_ms,
        };
        if self.tool_calls.is_empty() {
            NewStep::assistant(self.content).with_metrics(metrics)
        } else {
            NewStep::assistant_with_tool_calls(self.content, self.tool_calls)
                .with_metrics(metrics)
        }
    }

    /// Returns `true` if the draft carries tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Execution inputs for one streamed step.
pub struct StepExecution<'a> {
    /// The LLM provider.
    pub provider: &'a dyn ChatProvider,
    /// The assembled request for this step.
    pub request: ChatRequest,
    /// Event emitter stamped with the run's identity.
    pub emitter: &'a RunEmitter,
    /// Store for the LLM call log.
    pub store: &'a dyn SessionStore,
    /// The session being appended to.
    pub session_id: &'a str,
    /// Sequence the assistant step will take.
    pub step_id: u64,
    /// Retry budget for provider errors.
    pub max_retries: u32,
    /// The run's cancellation token.
    pub token: &'a CancellationToken,
}

/// Drive one LLM call to a canonical assistant draft.
///
/// Emits a `step_delta` per displayable fragment and one `step_completed`
/// carrying the snapshot. A provider failure emits an `error` event and is
/// retried up to `max_retries` times before becoming fatal.
///
/// # Errors
///
/// Returns [`Error::Model`] when the provider fails beyond the retry
/// budget, [`Error::Cancelled`] when the run is cancelled mid-stream, and
/// store errors from call logging.
pub async fn execute_step(exec: &StepExecution<'_>) -> Result<AssistantDraft> {
    let mut attempt = 0;
    loop {
        match stream_once(exec).await {
            Ok(draft) => return Ok(draft),
            Err(err @ Error::Model { .. }) if attempt < exec.max_retries => {
                attempt += 1;
                warn!(
                    run_id = exec.emitter.run_id(),
                    attempt,
                    max_retries = exec.max_retries,
                    error = %err,
                    "retrying LLM call after provider error"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

async fn stream_once(exec: &StepExecution<'_>) -> Result<AssistantDraft> {
    let started = Instant::now();

    let mut stream = match exec.provider.chat_stream(&exec.request).await {
        Ok(stream) => stream,
        Err(err) => {
            return Err(provider_failure(exec, started, err).await?);
        }
    };

    let mut agg = StepAggregator::new();
    let mut first_token_ms: Option<u64> = None;

    loop {
        let chunk = tokio::select! {
            () = exec.token.cancelled() => return Err(Error::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                return Err(provider_failure(exec, started, err).await?);
            }
        };

        if let StreamChunk::Error { message } = &chunk {
            let err = Error::model(message.clone());
            return Err(provider_failure(exec, started, err).await?);
        }

        if first_token_ms.is_none() && is_first_token(&chunk) {
            #[allow(clippy::cast_possible_truncation)]
            {
                first_token_ms = Some(started.elapsed().as_millis() as u64);
            }
        }

        if let Some(delta) = chunk_to_delta(&chunk) {
            exec.emitter.emit(EventPayload::StepDelta {
                step_id: exec.step_id,
                delta,
            });
        }

        agg.apply(&chunk);
    }

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = started.elapsed().as_millis() as u64;
    let usage = agg.usage();
    let (content, tool_calls) = agg.into_parts();

    log_call(exec, usage, duration_ms, LlmCallStatus::Ok, None).await?;

    let draft = AssistantDraft {
        content,
        tool_calls,
        usage,
        first_token_ms,
        duration_ms,
    };

    let snapshot = draft.clone().into_new_step().into_step(exec.session_id, exec.step_id);
    debug!(
        run_id = exec.emitter.run_id(),
        step_id = exec.step_id,
        tool_calls = draft.tool_calls.len(),
        first_token_ms,
        "assistant step assembled"
    );
    exec.emitter.emit(EventPayload::StepCompleted {
        step_id: exec.step_id,
        snapshot,
    });

    Ok(draft)
}

/// Record a provider failure: `error` event plus an error call log.
///
/// Returns the error to propagate (wrapped in `Ok` so callers can `?` the
/// logging failure separately from the provider failure).
async fn provider_failure(
    exec: &StepExecution<'_>,
    started: Instant,
    err: Error,
) -> Result<Error> {
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = started.elapsed().as_millis() as u64;
    exec.emitter.emit(EventPayload::Error {
        error: err.to_string(),
    });
    log_call(
        exec,
        None,
        duration_ms,
        LlmCallStatus::Error,
        Some(err.to_string()),
    )
    .await?;
    Ok(err)
}

async fn log_call(
    exec: &StepExecution<'_>,
    usage: Option<Usage>,
    duration_ms: u64,
    status: LlmCallStatus,
    error: Option<String>,
) -> Result<()> {
    exec.store
        .save_llm_call_log(&LlmCallLog {
            log_id: Uuid::new_v4().to_string(),
            run_id: exec.emitter.run_id().to_owned(),
            session_id: exec.session_id.to_owned(),
            model: exec.request.model.clone(),
            message_count: exec.request.messages.len(),
            usage,
            duration_ms,
            status,
            error,
            created_at: Utc::now(),
        })
        .await
}

const fn is_first_token(chunk: &StreamChunk) -> bool {
    match chunk {
        StreamChunk::Text(text) => !text.is_empty(),
        StreamChunk::ToolUseStart { .. } => true,
        _ => false,
    }
}

fn chunk_to_delta(chunk: &StreamChunk) -> Option<StepDelta> {
    match chunk {
        StreamChunk::Text(text) if !text.is_empty() => Some(StepDelta {
            content: Some(text.clone()),
            tool_calls: None,
        }),
        StreamChunk::ToolUseStart { index, id, name } => Some(StepDelta {
            content: None,
            tool_calls: Some(vec![ToolCallDelta {
                index: *index,
                id: id.clone(),
                function: FunctionDelta {
                    name: Some(name.clone()),
                    arguments: None,
                },
            }]),
        }),
        StreamChunk::ToolUseDelta {
            index,
            id,
            partial_json,
        } => Some(StepDelta {
            content: None,
            tool_calls: Some(vec![ToolCallDelta {
                index: *index,
                id: id.clone(),
                function: FunctionDelta {
                    name: None,
                    arguments: Some(partial_json.clone()),
                },
            }]),
        }),
        _ => None,
    }
}
