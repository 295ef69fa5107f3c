//! The session store: canonical, ordered persistence.
//!
//! Sessions, steps, runs, checkpoints, LLM call logs, and traces all live
//! here. Appends to a single session are serialized and assign dense
//! sequences; the only permitted suffix mutation is
//! [`SessionStore::truncate_suffix`], used by retry. The event bus is a
//! derived, lossy projection of this store — late subscribers reconstruct
//! from here.

pub mod memory;
pub mod sqlite;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::run::{Run, RunStatus};
use crate::step::{NewStep, Step, StepRole};
use crate::trace::Trace;
use crate::usage::Usage;

/// A durable transcript container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Stable session identifier.
    pub session_id: String,
    /// Optional owner label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Outcome status of one LLM provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmCallStatus {
    /// The call returned a response.
    Ok,
    /// The call failed.
    Error,
}

/// A log row for one LLM provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallLog {
    /// Unique log identifier.
    pub log_id: String,
    /// The run that made the call.
    pub run_id: String,
    /// The session the run writes to.
    pub session_id: String,
    /// Model identifier used.
    pub model: String,
    /// Number of messages in the request context.
    pub message_count: usize,
    /// Token usage, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Call duration in milliseconds.
    pub duration_ms: u64,
    /// Outcome status.
    pub status: LlmCallStatus,
    /// Error text when the call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the call was made.
    pub created_at: DateTime<Utc>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of sessions.
    pub sessions: u64,
    /// Number of steps across all sessions.
    pub steps: u64,
    /// Number of runs.
    pub runs: u64,
    /// Number of checkpoints.
    pub checkpoints: u64,
    /// Number of LLM call logs.
    pub llm_calls: u64,
    /// Total input tokens across logged calls.
    pub total_input_tokens: u64,
    /// Total output tokens across logged calls.
    pub total_output_tokens: u64,
}

/// Filter for [`SessionStore::list_runs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Restrict to one session.
    pub session_id: Option<String>,
    /// Restrict to one status.
    pub status: Option<RunStatus>,
    /// Restrict to one agent.
    pub agent_id: Option<String>,
}

impl RunFilter {
    /// Matches every run.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one session.
    #[must_use]
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Whether a run passes this filter.
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        self.session_id
            .as_ref()
            .is_none_or(|s| *s == run.session_id)
            && self.status.is_none_or(|s| s == run.status)
            && self.agent_id.as_ref().is_none_or(|a| *a == run.agent_id)
    }
}

/// Filter for [`SessionStore::list_llm_call_logs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Restrict to one run.
    pub run_id: Option<String>,
    /// Restrict to one session.
    pub session_id: Option<String>,
}

impl LogFilter {
    /// Matches every log.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one run.
    #[must_use]
    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    /// Whether a log passes this filter.
    #[must_use]
    pub fn matches(&self, log: &LlmCallLog) -> bool {
        self.run_id.as_ref().is_none_or(|r| *r == log.run_id)
            && self
                .session_id
                .as_ref()
                .is_none_or(|s| *s == log.session_id)
    }
}

/// Inclusive sequence range `[start, end?]` for [`SessionStore::list_steps`].
pub type StepRange = (u64, Option<u64>);

/// Ordered persistence of sessions, steps, runs, checkpoints, call logs,
/// and traces. All methods are async and atomic per call.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session.
    async fn create_session(
        &self,
        owner: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<Session>;

    /// Fetch a session by id.
    async fn get_session(&self, session_id: &str) -> Result<Session>;

    /// Append a step, assigning the next dense sequence atomically.
    ///
    /// Enforces tool pairing: an assistant step's call ids must be unique
    /// within the step, and a tool step's `tool_call_id` must match a call
    /// of an earlier assistant step in the same session.
    async fn append_step(&self, session_id: &str, step: NewStep) -> Result<Step>;

    /// List steps in ascending sequence order, optionally restricted to an
    /// inclusive range.
    async fn list_steps(&self, session_id: &str, range: Option<StepRange>) -> Result<Vec<Step>>;

    /// The step with the highest sequence, if any.
    async fn get_last_step(&self, session_id: &str) -> Result<Option<Step>>;

    /// Delete all steps with `sequence >= from_sequence`, returning the
    /// number removed. The only permitted suffix mutation.
    async fn truncate_suffix(&self, session_id: &str, from_sequence: u64) -> Result<u64>;

    /// Insert or update a run record.
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// List runs matching a filter, ascending by start time.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Persist an LLM call log row.
    async fn save_llm_call_log(&self, log: &LlmCallLog) -> Result<()>;

    /// List call logs matching a filter, ascending by creation time.
    async fn list_llm_call_logs(&self, filter: &LogFilter) -> Result<Vec<LlmCallLog>>;

    /// Aggregate statistics.
    async fn stats(&self) -> Result<StoreStats>;

    /// Persist a checkpoint. Checkpoints are immutable once created.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Fetch a checkpoint by id.
    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint>;

    /// List checkpoints, optionally restricted to one run.
    async fn list_checkpoints(&self, run_id: Option<&str>) -> Result<Vec<Checkpoint>>;

    /// Delete a checkpoint.
    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()>;

    /// Persist a trace (flushed by the trace collector on run terminal).
    async fn save_trace(&self, trace: &Trace) -> Result<()>;

    /// Fetch a trace by id (the root run id).
    async fn get_trace(&self, trace_id: &str) -> Result<Trace>;
}

/// Type alias for an Arc-wrapped store.
pub type SharedStore = std::sync::Arc<dyn SessionStore>;

/// Validate a step against the tool-pairing invariant before append.
///
/// `prior_call_ids` holds every call id declared by earlier assistant steps
/// in the session.
///
/// # Errors
///
/// Returns [`Error::Invariant`] on duplicate call ids within an assistant
/// step, a tool step without `tool_call_id`, or a tool step whose
/// `tool_call_id` matches no earlier assistant call.
pub(crate) fn validate_new_step(step: &NewStep, prior_call_ids: &HashSet<String>) -> Result<()> {
    match step.role {
        StepRole::Assistant => {
            if let Some(calls) = &step.tool_calls {
                let mut seen = HashSet::with_capacity(calls.len());
                for call in calls {
                    if !seen.insert(call.id.as_str()) {
                        return Err(Error::invariant(format!(
                            "duplicate tool_call id '{}' within assistant step",
                            call.id
                        )));
                    }
                }
            }
        }
        StepRole::Tool => {
            let Some(call_id) = &step.tool_call_id else {
                return Err(Error::invariant("tool step lacks tool_call_id"));
            };
            if !prior_call_ids.contains(call_id) {
                return Err(Error::invariant(format!(
                    "tool step references unknown tool_call id '{call_id}'"
                )));
            }
        }
        StepRole::User => {}
    }
    Ok(())
}

/// Collect the call ids declared by assistant steps.
pub(crate) fn collect_call_ids<'a>(steps: impl Iterator<Item = &'a Step>) -> HashSet<String> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.role == StepRole::Assistant
            && let Some(calls) = &step.tool_calls
        {
            for call in calls {
                ids.insert(call.id.clone());
            }
        }
    }
    ids
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::step::StepToolCall;

    #[test]
    fn duplicate_call_ids_are_rejected() {
        let step = NewStep::assistant_with_tool_calls(
            "",
            vec![
                StepToolCall::new("c1", "a", "{}"),
                StepToolCall::new("c1", "b", "{}"),
            ],
        );
        let err = validate_new_step(&step, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::Invariant { .. }));
    }

    #[test]
    fn tool_step_must_pair_with_a_prior_call() {
        let step = NewStep::tool("c9", "add", "3", false);
        assert!(validate_new_step(&step, &HashSet::new()).is_err());

        let mut prior = HashSet::new();
        prior.insert("c9".to_owned());
        assert!(validate_new_step(&step, &prior).is_ok());
    }

    #[test]
    fn collect_call_ids_only_reads_assistant_steps() {
        let steps = vec![
            NewStep::user("q").into_step("s", 1),
            NewStep::assistant_with_tool_calls("", vec![StepToolCall::new("c1", "a", "{}")])
                .into_step("s", 2),
            NewStep::tool("c1", "a", "ok", false).into_step("s", 3),
        ];
        let ids = collect_call_ids(steps.iter());
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("c1"));
    }

    #[test]
    fn filters_match_expected_rows() {
        let run = Run::started("r-1", "s-1", None, "helper", "q");
        assert!(RunFilter::any().matches(&run));
        assert!(RunFilter::session("s-1").matches(&run));
        assert!(!RunFilter::session("s-2").matches(&run));

        let filter = RunFilter {
            status: Some(RunStatus::Completed),
            ..RunFilter::default()
        };
        assert!(!filter.matches(&run));
    }
}
