//! Run records and outcomes.
//!
//! A run is one user-query-to-terminal-response execution. The coordinator
//! owns the [`Run`] record while executing and freezes it in the store on
//! terminal; [`RunOutcome`] is the in-process result handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::Usage;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is executing.
    Running,
    /// The run reached a normal terminal (done, max steps, or timeout).
    Completed,
    /// The run aborted on a model or invariant error.
    Failed,
    /// The run was cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Get the string representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if the run has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model produced a final answer with no further tool calls.
    Done,
    /// The step budget was exhausted.
    MaxSteps,
    /// A step or run deadline elapsed.
    Timeout,
    /// The caller cancelled the run.
    Cancelled,
    /// A model or invariant error aborted the run.
    Error,
}

impl TerminationReason {
    /// Get the string representation of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::MaxSteps => "max_steps",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// CLI exit code for this terminal: 0 success, 3 run failed,
    /// 4 cancelled, 5 timeout.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Done | Self::MaxSteps => 0,
            Self::Error => 3,
            Self::Cancelled => 4,
            Self::Timeout => 5,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics aggregated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Number of loop iterations executed.
    #[serde(default)]
    pub steps: usize,
    /// Number of tool calls dispatched.
    #[serde(default)]
    pub tool_calls: usize,
    /// Accumulated token usage.
    #[serde(default)]
    pub usage: Usage,
    /// Total wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

/// The persisted record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub run_id: String,
    /// The session this run appended to.
    pub session_id: String,
    /// Parent run, for nested runnables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// The agent or workflow that executed.
    pub agent_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// The query that started the run.
    pub input_query: String,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run reached terminal, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Aggregated metrics.
    pub metrics: RunMetrics,
    /// Why the run terminated, once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

impl Run {
    /// Create a new running record.
    #[must_use]
    pub fn started(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        parent_run_id: Option<String>,
        agent_id: impl Into<String>,
        input_query: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            parent_run_id,
            agent_id: agent_id.into(),
            status: RunStatus::Running,
            input_query: input_query.into(),
            start_time: Utc::now(),
            end_time: None,
            metrics: RunMetrics::default(),
            termination_reason: None,
        }
    }

    /// Freeze the record into its terminal state.
    pub fn finish(
        &mut self,
        status: RunStatus,
        reason: TerminationReason,
        metrics: RunMetrics,
    ) {
        self.status = status;
        self.termination_reason = Some(reason);
        self.metrics = metrics;
        self.end_time = Some(Utc::now());
    }
}

/// The in-process result of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The run identifier.
    pub run_id: String,
    /// The session the run appended to.
    pub session_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Why the run terminated.
    pub termination_reason: TerminationReason,
    /// The final assistant output (empty when the run did not produce one).
    pub output: String,
    /// Aggregated metrics.
    pub metrics: RunMetrics,
}

impl RunOutcome {
    /// Returns `true` if the run reached `done`.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.termination_reason, TerminationReason::Done)
    }
}
