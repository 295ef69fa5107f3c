//! Convenience re-exports of the commonly used types.

pub use crate::agent::{Agent, AgentBuilder};
pub use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointOptions, ForkModifications};
pub use crate::config::{CheckpointStrategy, RunnerConfig};
pub use crate::context::ContextBuilder;
pub use crate::controller::{ControlState, ExecutionController};
pub use crate::dispatch::{ToolCall, ToolOutcome};
pub use crate::error::{Error, Result, ToolError};
pub use crate::event::{Event, EventBus, EventPayload, EventStream};
pub use crate::message::{WireMessage, WireRole, message_to_step, step_to_message};
pub use crate::provider::{ChatProvider, ChatRequest, ChatResponse, SharedProvider};
pub use crate::run::{Run, RunMetrics, RunOutcome, RunStatus, TerminationReason};
pub use crate::runner::{RunConfig, Runner, StartedRun};
pub use crate::step::{NewStep, Step, StepMetrics, StepRole, StepToolCall};
pub use crate::store::memory::MemoryStore;
pub use crate::store::sqlite::SqliteStore;
pub use crate::store::{
    LlmCallLog, LogFilter, RunFilter, Session, SessionStore, SharedStore, StoreStats,
};
pub use crate::stream::{StepAggregator, StopReason, StreamChunk};
pub use crate::tool::{Tool, ToolDefinition, ToolRegistry};
pub use crate::trace::{NoopExporter, Span, SpanKind, Trace, TraceCollector, TraceExporter};
pub use crate::usage::Usage;
pub use crate::workflow::{LoopWorkflow, ParallelWorkflow, Pipeline, Runnable};
