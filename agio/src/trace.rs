//! The trace collector: a span tree built from the event stream.
//!
//! The collector subscribes to a run tree's event bus and opens/closes
//! spans as lifecycle events arrive: runs become AGENT spans (linked via
//! `parent_run_id`), each LLM call and tool call gets its own span, and
//! workflow wrappers become stage/branch spans. Durations derive from event
//! timestamps. When the root run terminates, the trace is flushed to the
//! session store and through the configured exporter.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::store::{SessionStore as _, SharedStore};

/// The kind of work a span covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A whole run of an agent or workflow.
    Agent,
    /// One LLM call within a step.
    LlmCall,
    /// One tool call.
    ToolCall,
    /// A pipeline stage or loop iteration wrapper.
    WorkflowStage,
    /// A parallel branch wrapper.
    WorkflowBranch,
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    /// Still open, or closed without an explicit status.
    #[default]
    Unset,
    /// Completed normally.
    Ok,
    /// Completed with an error.
    Error,
}

/// One node of the span tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Unique span identifier.
    pub span_id: String,
    /// The run the span belongs to.
    pub run_id: String,
    /// Parent span, absent for the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// What the span covers.
    pub kind: SpanKind,
    /// Display name.
    pub name: String,
    /// Start time, ms since the Unix epoch.
    pub start_ms: i64,
    /// End time, once closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<i64>,
    /// Terminal status.
    #[serde(default)]
    pub status: SpanStatus,
    /// Free-form attributes.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Span {
    /// Duration in milliseconds, when the span is closed.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_ms.map(|end| end - self.start_ms)
    }
}

/// One row of the waterfall view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterfallRow {
    /// Span display name.
    pub name: String,
    /// Span kind.
    pub kind: SpanKind,
    /// Tree depth (root = 0).
    pub depth: usize,
    /// Start offset from the trace root, ms.
    pub offset_ms: i64,
    /// Duration, ms (0 for spans that never closed).
    pub duration_ms: i64,
}

/// A persisted span tree for one run tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace identifier; equals the root run id.
    pub trace_id: String,
    /// The root run of the tree.
    pub root_run_id: String,
    /// All spans, in creation order.
    pub spans: Vec<Span>,
}

impl Trace {
    /// The root span, when present.
    #[must_use]
    pub fn root_span(&self) -> Option<&Span> {
        self.spans
            .iter()
            .find(|s| s.run_id == self.root_run_id && s.kind == SpanKind::Agent)
    }

    /// Direct children of a span.
    #[must_use]
    pub fn children_of(&self, span_id: &str) -> Vec<&Span> {
        self.spans
            .iter()
            .filter(|s| s.parent_span_id.as_deref() == Some(span_id))
            .collect()
    }

    /// Flatten the tree into waterfall rows ordered by start time.
    #[must_use]
    pub fn waterfall(&self) -> Vec<WaterfallRow> {
        let by_id: HashMap<&str, &Span> =
            self.spans.iter().map(|s| (s.span_id.as_str(), s)).collect();
        let origin = self
            .root_span()
            .map_or_else(|| self.spans.first().map_or(0, |s| s.start_ms), |s| s.start_ms);

        let mut rows: Vec<WaterfallRow> = self
            .spans
            .iter()
            .map(|span| {
                let mut depth = 0;
                let mut cursor = span.parent_span_id.as_deref();
                while let Some(parent_id) = cursor {
                    depth += 1;
                    cursor = by_id
                        .get(parent_id)
                        .and_then(|p| p.parent_span_id.as_deref());
                }
                WaterfallRow {
                    name: span.name.clone(),
                    kind: span.kind,
                    depth,
                    offset_ms: span.start_ms - origin,
                    duration_ms: span.duration_ms().unwrap_or(0),
                }
            })
            .collect();
        rows.sort_by_key(|row| row.offset_ms);
        rows
    }
}

/// Export seam for trace backends. The backend choice (OTLP collector,
/// vendor SDK) lives outside this crate.
#[async_trait]
pub trait TraceExporter: Send + Sync {
    /// Export one finished trace.
    async fn export(&self, trace: &Trace) -> Result<()>;
}

/// An exporter that discards traces.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExporter;

#[async_trait]
impl TraceExporter for NoopExporter {
    async fn export(&self, _trace: &Trace) -> Result<()> {
        Ok(())
    }
}

/// Builds a span tree from one run tree's events.
///
/// Feed events with [`observe`](Self::observe) (or [`drive`](Self::drive)
/// over a bus subscription). The collector flushes automatically when the
/// root run reaches a terminal event.
pub struct TraceCollector {
    store: Option<SharedStore>,
    exporter: Option<std::sync::Arc<dyn TraceExporter>>,
    spans: Vec<Span>,
    index: HashMap<String, usize>,
    run_spans: HashMap<String, String>,
    llm_spans: HashMap<(String, u64), String>,
    tool_spans: HashMap<(String, String), String>,
    wrapper_spans: HashMap<(String, String), String>,
    root_run_id: Option<String>,
    finished: Option<Trace>,
}

impl std::fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCollector")
            .field("spans", &self.spans.len())
            .field("root_run_id", &self.root_run_id)
            .finish_non_exhaustive()
    }
}

impl TraceCollector {
    /// Create a collector with no persistence or export.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            exporter: None,
            spans: Vec::new(),
            index: HashMap::new(),
            run_spans: HashMap::new(),
            llm_spans: HashMap::new(),
            tool_spans: HashMap::new(),
            wrapper_spans: HashMap::new(),
            root_run_id: None,
            finished: None,
        }
    }

    /// Flush finished traces to this store.
    #[must_use]
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Export finished traces through this exporter.
    #[must_use]
    pub fn with_exporter(mut self, exporter: std::sync::Arc<dyn TraceExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// The finished trace, once the root run has terminated.
    #[must_use]
    pub const fn finished_trace(&self) -> Option<&Trace> {
        self.finished.as_ref()
    }

    /// Consume a bus subscription until it closes.
    ///
    /// # Errors
    ///
    /// Propagates store/export failures from terminal flushes.
    pub async fn drive(&mut self, mut events: crate::event::EventStream) -> Result<()> {
        while let Some(event) = events.recv().await {
            self.observe(&event).await?;
        }
        Ok(())
    }

    /// Apply one event to the span tree.
    ///
    /// # Errors
    ///
    /// Propagates store/export failures when a root terminal flushes.
    pub async fn observe(&mut self, event: &Event) -> Result<()> {
        let Some(run_id) = event.run_id.clone() else {
            return Ok(());
        };

        match &event.payload {
            EventPayload::RunStarted {
                agent_id,
                input_query,
                data,
                ..
            } => {
                if event.depth == 0 && self.root_run_id.is_none() {
                    self.root_run_id = Some(run_id.clone());
                }
                let parent_span = event
                    .parent_run_id
                    .as_ref()
                    .and_then(|parent| self.run_spans.get(parent).cloned());
                let mut attributes = HashMap::new();
                attributes.insert("input_query".to_owned(), Value::String(input_query.clone()));
                attributes.insert(
                    "session_id".to_owned(),
                    Value::String(data.session_id.clone()),
                );
                if let Some(kind) = &data.workflow_type {
                    attributes.insert("workflow_type".to_owned(), Value::String(kind.clone()));
                }
                let span_id = self.open(
                    &run_id,
                    parent_span,
                    SpanKind::Agent,
                    agent_id.clone(),
                    event.timestamp,
                    attributes,
                );
                self.run_spans.insert(run_id, span_id);
            }

            EventPayload::StepDelta { step_id, .. } => {
                let key = (run_id.clone(), *step_id);
                if !self.llm_spans.contains_key(&key) {
                    let parent = self.run_spans.get(&run_id).cloned();
                    let span_id = self.open(
                        &run_id,
                        parent,
                        SpanKind::LlmCall,
                        format!("llm step {step_id}"),
                        event.timestamp,
                        HashMap::new(),
                    );
                    self.llm_spans.insert(key, span_id);
                }
            }

            EventPayload::StepCompleted { step_id, snapshot } => {
                let key = (run_id.clone(), *step_id);
                let span_id = self.llm_spans.remove(&key).unwrap_or_else(|| {
                    // Completed-only path: open retroactively.
                    let parent = self.run_spans.get(&run_id).cloned();
                    self.open(
                        &run_id,
                        parent,
                        SpanKind::LlmCall,
                        format!("llm step {step_id}"),
                        event.timestamp,
                        HashMap::new(),
                    )
                });
                if let Some(span) = self.get_mut(&span_id) {
                    span.attributes.insert(
                        "tool_calls".to_owned(),
                        Value::from(
                            snapshot
                                .tool_calls
                                .as_ref()
                                .map_or(0, std::vec::Vec::len),
                        ),
                    );
                }
                self.close(&span_id, event.timestamp, SpanStatus::Ok);
            }

            EventPayload::ToolCallStarted {
                tool_call_id,
                tool_name,
                arguments,
            } => {
                let parent = self.run_spans.get(&run_id).cloned();
                let mut attributes = HashMap::new();
                attributes.insert("arguments".to_owned(), Value::String(arguments.clone()));
                let span_id = self.open(
                    &run_id,
                    parent,
                    SpanKind::ToolCall,
                    tool_name.clone(),
                    event.timestamp,
                    attributes,
                );
                self.tool_spans.insert((run_id, tool_call_id.clone()), span_id);
            }

            EventPayload::ToolCallFailed { tool_call_id, error, .. } => {
                if let Some(span_id) = self.tool_spans.get(&(run_id, tool_call_id.clone()))
                    && let Some(span) = self.index.get(span_id).copied()
                    && let Some(span) = self.spans.get_mut(span)
                {
                    span.status = SpanStatus::Error;
                    span.attributes
                        .insert("error".to_owned(), Value::String(error.clone()));
                }
            }

            EventPayload::ToolCallCompleted {
                tool_call_id,
                is_success,
                duration,
                ..
            } => {
                if let Some(span_id) = self.tool_spans.remove(&(run_id, tool_call_id.clone())) {
                    if let Some(span) = self.get_mut(&span_id) {
                        span.attributes
                            .insert("duration_ms".to_owned(), Value::from(*duration));
                    }
                    let status = if *is_success {
                        SpanStatus::Ok
                    } else {
                        SpanStatus::Error
                    };
                    self.close(&span_id, event.timestamp, status);
                }
            }

            EventPayload::StageStarted { stage, name } => {
                self.open_wrapper(
                    &run_id,
                    SpanKind::WorkflowStage,
                    format!("stage:{stage}"),
                    format!("stage {stage}: {name}"),
                    event.timestamp,
                );
            }
            EventPayload::StageCompleted { stage, .. } => {
                self.close_wrapper(&run_id, &format!("stage:{stage}"), event.timestamp, SpanStatus::Ok);
            }
            EventPayload::StageSkipped { stage, name, .. } => {
                // A skipped stage gets a zero-length span for visibility.
                let key = format!("stage:{stage}");
                self.open_wrapper(
                    &run_id,
                    SpanKind::WorkflowStage,
                    key.clone(),
                    format!("stage {stage}: {name} (skipped)"),
                    event.timestamp,
                );
                self.close_wrapper(&run_id, &key, event.timestamp, SpanStatus::Unset);
            }

            EventPayload::BranchStarted { branch_id } => {
                self.open_wrapper(
                    &run_id,
                    SpanKind::WorkflowBranch,
                    format!("branch:{branch_id}"),
                    format!("branch {branch_id}"),
                    event.timestamp,
                );
            }
            EventPayload::BranchCompleted { branch_id, is_success } => {
                let status = if *is_success {
                    SpanStatus::Ok
                } else {
                    SpanStatus::Error
                };
                self.close_wrapper(&run_id, &format!("branch:{branch_id}"), event.timestamp, status);
            }

            EventPayload::IterationStarted { iteration } => {
                self.open_wrapper(
                    &run_id,
                    SpanKind::WorkflowStage,
                    format!("iteration:{iteration}"),
                    format!("iteration {iteration}"),
                    event.timestamp,
                );
            }
            EventPayload::IterationCompleted { iteration, .. } => {
                self.close_wrapper(
                    &run_id,
                    &format!("iteration:{iteration}"),
                    event.timestamp,
                    SpanStatus::Ok,
                );
            }

            EventPayload::RunCompleted { .. } => {
                if let Some(span_id) = self.run_spans.get(&run_id).cloned() {
                    self.close(&span_id, event.timestamp, SpanStatus::Ok);
                }
                if self.root_run_id.as_deref() == Some(run_id.as_str()) {
                    self.flush(&run_id).await?;
                }
            }
            EventPayload::RunFailed { data, .. } => {
                if let Some(span_id) = self.run_spans.get(&run_id).cloned() {
                    if let Some(span) = self.get_mut(&span_id) {
                        span.attributes
                            .insert("error".to_owned(), Value::String(data.error.clone()));
                    }
                    self.close(&span_id, event.timestamp, SpanStatus::Error);
                }
                if self.root_run_id.as_deref() == Some(run_id.as_str()) {
                    self.flush(&run_id).await?;
                }
            }

            EventPayload::Error { error } => {
                debug!(run_id, error, "error event observed by trace collector");
            }
        }

        Ok(())
    }

    fn open(
        &mut self,
        run_id: &str,
        parent_span_id: Option<String>,
        kind: SpanKind,
        name: String,
        start_ms: i64,
        attributes: HashMap<String, Value>,
    ) -> String {
        let span_id = Uuid::new_v4().simple().to_string();
        let span = Span {
            span_id: span_id.clone(),
            run_id: run_id.to_owned(),
            parent_span_id,
            kind,
            name,
            start_ms,
            end_ms: None,
            status: SpanStatus::Unset,
            attributes,
        };
        self.index.insert(span_id.clone(), self.spans.len());
        self.spans.push(span);
        span_id
    }

    fn open_wrapper(&mut self, run_id: &str, kind: SpanKind, key: String, name: String, ts: i64) {
        let parent = self.run_spans.get(run_id).cloned();
        let span_id = self.open(run_id, parent, kind, name, ts, HashMap::new());
        self.wrapper_spans.insert((run_id.to_owned(), key), span_id);
    }

    fn close_wrapper(&mut self, run_id: &str, key: &str, ts: i64, status: SpanStatus) {
        if let Some(span_id) = self
            .wrapper_spans
            .remove(&(run_id.to_owned(), key.to_owned()))
        {
            self.close(&span_id, ts, status);
        }
    }

    fn get_mut(&mut self, span_id: &str) -> Option<&mut Span> {
        self.index.get(span_id).copied().and_then(|i| self.spans.get_mut(i))
    }

    fn close(&mut self, span_id: &str, end_ms: i64, status: SpanStatus) {
        if let Some(span) = self.get_mut(span_id) {
            span.end_ms = Some(end_ms);
            span.status = status;
        }
    }

    async fn flush(&mut self, root_run_id: &str) -> Result<()> {
        // Any span still open at flush (e.g. tools in flight at cancel)
        // closes with unset status at the terminal timestamp.
        let terminal_ts = self
            .spans
            .iter()
            .filter_map(|s| s.end_ms)
            .max()
            .unwrap_or_default();
        for span in &mut self.spans {
            if span.end_ms.is_none() {
                span.end_ms = Some(terminal_ts.max(span.start_ms));
            }
        }

        let trace = Trace {
            trace_id: root_run_id.to_owned(),
            root_run_id: root_run_id.to_owned(),
            spans: self.spans.clone(),
        };

        if let Some(store) = &self.store
            && let Err(err) = store.save_trace(&trace).await
        {
            warn!(trace_id = root_run_id, error = %err, "failed to persist trace");
        }
        if let Some(exporter) = &self.exporter {
            exporter.export(&trace).await?;
        }

        debug!(trace_id = root_run_id, spans = trace.spans.len(), "trace flushed");
        self.finished = Some(trace);
        Ok(())
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}
