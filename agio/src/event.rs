//! The typed event pipeline.
//!
//! The coordinator and step executor emit [`Event`]s; any number of
//! subscribers (SSE transport, trace collector, hooks) consume them through
//! the [`EventBus`]. The bus is a lossy, derived channel: the canonical
//! record of a run is always the session store, and a slow subscriber is
//! dropped rather than allowed to block the producer.
//!
//! Serialized events match the SSE payload table: the payload fields of each
//! kind, plus the envelope fields (`run_id`, `parent_run_id`, `depth`,
//! `timestamp`) carried by every event.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::run::{RunMetrics, TerminationReason};
use crate::step::Step;

/// Extra run-start payload carried under `data`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStartedData {
    /// The session the run writes to.
    pub session_id: String,
    /// Workflow kind ("pipeline", "parallel", "loop") for composite runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    /// Stage count, for pipelines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_stages: Option<usize>,
    /// Branch identifiers, for parallel workflows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_ids: Option<Vec<String>>,
}

/// Terminal payload carried under `data` by `run_completed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunCompletedData {
    /// Final aggregated metrics.
    pub metrics: RunMetrics,
    /// Why the run terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

/// Terminal payload carried under `data` by `run_failed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailedData {
    /// The failure text.
    pub error: String,
}

/// A streamed fragment of one tool call, indexed by position.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallDelta {
    /// Position of the tool call within the step.
    pub index: usize,
    /// Call id, once it has surfaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Partial function name/arguments.
    pub function: FunctionDelta,
}

/// The function part of a tool-call fragment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionDelta {
    /// Function name (first fragment only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Partial JSON argument text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// The incremental content of one `step_delta`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepDelta {
    /// Appended text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool-call fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Kind-specific event payloads.
///
/// Serialization is untagged: the variant's fields merge into the event's
/// data object, with the kind carried out-of-band by [`Event::kind`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum EventPayload {
    /// A run began.
    RunStarted {
        /// The session the run writes to.
        session_id: String,
        /// The executing agent or workflow.
        agent_id: String,
        /// The query that started the run.
        input_query: String,
        /// Extra start payload.
        data: RunStartedData,
    },
    /// Incremental assistant output for a step.
    StepDelta {
        /// Sequence of the step being streamed.
        step_id: u64,
        /// The fragment.
        delta: StepDelta,
    },
    /// The canonical snapshot of a completed step.
    StepCompleted {
        /// Sequence of the completed step.
        step_id: u64,
        /// The full step as persisted.
        snapshot: Step,
    },
    /// A tool call is about to execute.
    ToolCallStarted {
        /// The call id.
        tool_call_id: String,
        /// The tool name.
        tool_name: String,
        /// The JSON-encoded argument string.
        arguments: String,
    },
    /// A tool call finished (successfully or not).
    ToolCallCompleted {
        /// The call id.
        tool_call_id: String,
        /// The result content.
        result: String,
        /// Whether the call succeeded.
        is_success: bool,
        /// Execution time in milliseconds.
        duration: u64,
    },
    /// A tool call failed; a `tool_call_completed` with
    /// `is_success=false` follows.
    ToolCallFailed {
        /// The call id.
        tool_call_id: String,
        /// The tool name.
        tool_name: String,
        /// The failure text.
        error: String,
    },
    /// A pipeline stage began.
    StageStarted {
        /// Zero-based stage index.
        stage: usize,
        /// Stage name.
        name: String,
    },
    /// A pipeline stage completed.
    StageCompleted {
        /// Zero-based stage index.
        stage: usize,
        /// Stage name.
        name: String,
        /// The stage's final output.
        output: String,
    },
    /// A pipeline stage was skipped after an earlier failure.
    StageSkipped {
        /// Zero-based stage index.
        stage: usize,
        /// Stage name.
        name: String,
        /// Why it was skipped.
        reason: String,
    },
    /// A parallel branch began.
    BranchStarted {
        /// The branch identifier.
        branch_id: String,
    },
    /// A parallel branch completed.
    BranchCompleted {
        /// The branch identifier.
        branch_id: String,
        /// Whether the branch run succeeded.
        is_success: bool,
    },
    /// A loop iteration began.
    IterationStarted {
        /// One-based iteration number.
        iteration: usize,
    },
    /// A loop iteration completed.
    IterationCompleted {
        /// One-based iteration number.
        iteration: usize,
        /// Whether the loop predicate was satisfied.
        satisfied: bool,
    },
    /// A run reached a normal terminal.
    RunCompleted {
        /// Terminal payload.
        data: RunCompletedData,
    },
    /// A run aborted on an error.
    RunFailed {
        /// Terminal payload.
        data: RunFailedData,
        /// The failure text, duplicated at the top level.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An error outside a terminal transition (e.g. mid-stream provider
    /// failure before the coordinator reacts).
    Error {
        /// The error text.
        error: String,
    },
}

impl EventPayload {
    /// The wire name of this event kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepDelta { .. } => "step_delta",
            Self::StepCompleted { .. } => "step_completed",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::ToolCallFailed { .. } => "tool_call_failed",
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageSkipped { .. } => "stage_skipped",
            Self::BranchStarted { .. } => "branch_started",
            Self::BranchCompleted { .. } => "branch_completed",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::Error { .. } => "error",
        }
    }
}

/// An event in transit: envelope plus kind-specific payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// The emitting run. Absent only for detached errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// The parent run, for nested runnables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Nesting depth (0 = top-level run).
    pub depth: usize,
    /// Emission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// The wire name of this event's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

struct BusSubscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Fan-out channel from one producer to many subscribers.
///
/// One bus serves one top-level run tree; nested runs publish to their
/// parent's bus. Queues are bounded per subscriber; a subscriber whose queue
/// overflows is dropped with a local diagnostic, never blocking the
/// producer.
pub struct EventBus {
    subscribers: Mutex<Vec<BusSubscriber>>,
    queue_size: usize,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given per-subscriber queue depth.
    #[must_use]
    pub const fn new(queue_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_size,
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach a new subscriber.
    ///
    /// The subscriber sees every event published after this call, in
    /// publication order.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.queue_size.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(BusSubscriber { id, tx });
        }
        EventStream { rx }
    }

    /// Publish an event to all live subscribers.
    ///
    /// Non-blocking: a full queue evicts that subscriber.
    pub fn publish(&self, event: &Event) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber = sub.id,
                    kind = event.kind(),
                    "event subscriber queue overflow, dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "event subscriber disconnected");
                false
            }
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_size", &self.queue_size)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A subscriber's view of the bus.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event, or `None` when the bus side is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Stamps events with one run's identity before publication.
#[derive(Debug, Clone)]
pub struct RunEmitter {
    bus: std::sync::Arc<EventBus>,
    run_id: String,
    parent_run_id: Option<String>,
    depth: usize,
}

impl RunEmitter {
    /// Create an emitter for a run.
    #[must_use]
    pub const fn new(
        bus: std::sync::Arc<EventBus>,
        run_id: String,
        parent_run_id: Option<String>,
        depth: usize,
    ) -> Self {
        Self {
            bus,
            run_id,
            parent_run_id,
            depth,
        }
    }

    /// The run this emitter stamps.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Build the enveloped event without publishing it.
    #[must_use]
    pub fn event(&self, payload: EventPayload) -> Event {
        Event {
            run_id: Some(self.run_id.clone()),
            parent_run_id: self.parent_run_id.clone(),
            depth: self.depth,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Stamp and publish an event.
    pub fn emit(&self, payload: EventPayload) {
        self.bus.publish(&self.event(payload));
    }
}
