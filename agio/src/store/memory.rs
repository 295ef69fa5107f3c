//! In-memory session store.
//!
//! [`MemoryStore`] keeps everything behind one mutex. It backs tests and
//! ephemeral runs; the sqlite store provides the same contract durably.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{
    LlmCallLog, LogFilter, RunFilter, Session, SessionStore, StepRange, StoreStats,
    collect_call_ids, validate_new_step,
};
use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::run::Run;
use crate::step::{NewStep, Step};
use crate::trace::Trace;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    steps: HashMap<String, Vec<Step>>,
    runs: HashMap<String, Run>,
    checkpoints: HashMap<String, Checkpoint>,
    logs: Vec<LlmCallLog>,
    traces: HashMap<String, Trace>,
}

/// A mutex-guarded, fully in-memory [`SessionStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| Error::store(format!("store mutex poisoned: {e}")))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        owner: Option<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<Session> {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            owner,
            metadata,
            created_at: Utc::now(),
        };
        let mut inner = self.lock()?;
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        inner.steps.insert(session.session_id.clone(), Vec::new());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.lock()?
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    async fn append_step(&self, session_id: &str, step: NewStep) -> Result<Step> {
        let mut inner = self.lock()?;
        if !inner.sessions.contains_key(session_id) {
            return Err(Error::not_found("session", session_id));
        }
        let steps = inner.steps.entry(session_id.to_owned()).or_default();

        validate_new_step(&step, &collect_call_ids(steps.iter()))?;

        let sequence = steps.last().map_or(0, |s| s.sequence) + 1;
        let step = step.into_step(session_id, sequence);
        steps.push(step.clone());
        Ok(step)
    }

    async fn list_steps(&self, session_id: &str, range: Option<StepRange>) -> Result<Vec<Step>> {
        let inner = self.lock()?;
        let steps = inner
            .steps
            .get(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        let (start, end) = range.unwrap_or((1, None));
        Ok(steps
            .iter()
            .filter(|s| s.sequence >= start && end.is_none_or(|e| s.sequence <= e))
            .cloned()
            .collect())
    }

    async fn get_last_step(&self, session_id: &str) -> Result<Option<Step>> {
        let inner = self.lock()?;
        let steps = inner
            .steps
            .get(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        Ok(steps.last().cloned())
    }

    async fn truncate_suffix(&self, session_id: &str, from_sequence: u64) -> Result<u64> {
        let mut inner = self.lock()?;
        let steps = inner
            .steps
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        let before = steps.len();
        steps.retain(|s| s.sequence < from_sequence);
        Ok((before - steps.len()) as u64)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        self.lock()?.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.lock()?
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::not_found("run", run_id))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let inner = self.lock()?;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.start_time);
        Ok(runs)
    }

    async fn save_llm_call_log(&self, log: &LlmCallLog) -> Result<()> {
        self.lock()?.logs.push(log.clone());
        Ok(())
    }

    async fn list_llm_call_logs(&self, filter: &LogFilter) -> Result<Vec<LlmCallLog>> {
        let inner = self.lock()?;
        let mut logs: Vec<LlmCallLog> = inner
            .logs
            .iter()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock()?;
        let (input, output) = inner
            .logs
            .iter()
            .filter_map(|l| l.usage)
            .fold((0_u64, 0_u64), |(i, o), usage| {
                (i + u64::from(usage.input_tokens), o + u64::from(usage.output_tokens))
            });
        Ok(StoreStats {
            sessions: inner.sessions.len() as u64,
            steps: inner.steps.values().map(|s| s.len() as u64).sum(),
            runs: inner.runs.len() as u64,
            checkpoints: inner.checkpoints.len() as u64,
            llm_calls: inner.logs.len() as u64,
            total_input_tokens: input,
            total_output_tokens: output,
        })
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()?
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.lock()?
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| Error::not_found("checkpoint", checkpoint_id))
    }

    async fn list_checkpoints(&self, run_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        let inner = self.lock()?;
        let mut checkpoints: Vec<Checkpoint> = inner
            .checkpoints
            .values()
            .filter(|c| run_id.is_none_or(|r| c.run_id == r))
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        self.lock()?
            .checkpoints
            .remove(checkpoint_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("checkpoint", checkpoint_id))
    }

    async fn save_trace(&self, trace: &Trace) -> Result<()> {
        self.lock()?
            .traces
            .insert(trace.trace_id.clone(), trace.clone());
        Ok(())
    }

    async fn get_trace(&self, trace_id: &str) -> Result<Trace> {
        self.lock()?
            .traces
            .get(trace_id)
            .cloned()
            .ok_or_else(|| Error::not_found("trace", trace_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::step::StepToolCall;

    async fn fresh() -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let session = store.create_session(None, HashMap::new()).await.unwrap();
        let id = session.session_id.clone();
        (store, id)
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn create_and_get() {
            let store = MemoryStore::new();
            let mut metadata = HashMap::new();
            metadata.insert("project".to_owned(), Value::String("demo".into()));
            let session = store
                .create_session(Some("alice".into()), metadata)
                .await
                .unwrap();

            let fetched = store.get_session(&session.session_id).await.unwrap();
            assert_eq!(fetched.owner.as_deref(), Some("alice"));
            assert_eq!(fetched.metadata["project"], "demo");
        }

        #[tokio::test]
        async fn unknown_session_is_not_found() {
            let store = MemoryStore::new();
            assert!(store.get_session("nope").await.unwrap_err().is_not_found());
            assert!(
                store
                    .append_step("nope", NewStep::user("hi"))
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
        }
    }

    mod steps {
        use super::*;

        #[tokio::test]
        async fn sequences_are_dense_from_one() {
            let (store, sid) = fresh().await;
            for i in 0..4 {
                let step = store
                    .append_step(&sid, NewStep::user(format!("u{i}")))
                    .await
                    .unwrap();
                assert_eq!(step.sequence, i + 1);
            }
            let steps = store.list_steps(&sid, None).await.unwrap();
            let sequences: Vec<u64> = steps.iter().map(|s| s.sequence).collect();
            assert_eq!(sequences, vec![1, 2, 3, 4]);
        }

        #[tokio::test]
        async fn range_listing_is_inclusive() {
            let (store, sid) = fresh().await;
            for i in 0..5 {
                store
                    .append_step(&sid, NewStep::user(format!("u{i}")))
                    .await
                    .unwrap();
            }
            let steps = store.list_steps(&sid, Some((2, Some(4)))).await.unwrap();
            assert_eq!(
                steps.iter().map(|s| s.sequence).collect::<Vec<_>>(),
                vec![2, 3, 4]
            );
            let tail = store.list_steps(&sid, Some((4, None))).await.unwrap();
            assert_eq!(tail.len(), 2);
        }

        #[tokio::test]
        async fn tool_pairing_is_enforced() {
            let (store, sid) = fresh().await;
            // Tool step with no matching call is rejected.
            let err = store
                .append_step(&sid, NewStep::tool("c1", "add", "3", false))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Invariant { .. }));

            store
                .append_step(
                    &sid,
                    NewStep::assistant_with_tool_calls(
                        "",
                        vec![StepToolCall::new("c1", "add", "{}")],
                    ),
                )
                .await
                .unwrap();
            assert!(
                store
                    .append_step(&sid, NewStep::tool("c1", "add", "3", false))
                    .await
                    .is_ok()
            );
        }

        #[tokio::test]
        async fn truncate_suffix_deletes_and_reports() {
            let (store, sid) = fresh().await;
            for i in 0..5 {
                store
                    .append_step(&sid, NewStep::user(format!("u{i}")))
                    .await
                    .unwrap();
            }
            assert_eq!(store.truncate_suffix(&sid, 3).await.unwrap(), 3);
            assert_eq!(store.truncate_suffix(&sid, 3).await.unwrap(), 0);

            let last = store.get_last_step(&sid).await.unwrap().unwrap();
            assert_eq!(last.sequence, 2);
        }
    }

    mod runs_and_logs {
        use super::*;
        use crate::run::{RunStatus, TerminationReason};
        use crate::usage::Usage;

        #[tokio::test]
        async fn save_get_and_filter_runs() {
            let (store, sid) = fresh().await;
            let mut run = Run::started("r-1", &sid, None, "helper", "q");
            store.save_run(&run).await.unwrap();

            run.finish(
                RunStatus::Completed,
                TerminationReason::Done,
                crate::run::RunMetrics::default(),
            );
            store.save_run(&run).await.unwrap();

            let fetched = store.get_run("r-1").await.unwrap();
            assert_eq!(fetched.status, RunStatus::Completed);

            assert_eq!(store.list_runs(&RunFilter::session(&sid)).await.unwrap().len(), 1);
            assert!(
                store
                    .list_runs(&RunFilter::session("other"))
                    .await
                    .unwrap()
                    .is_empty()
            );
        }

        #[tokio::test]
        async fn logs_aggregate_into_stats() {
            let (store, sid) = fresh().await;
            for i in 0..2 {
                store
                    .save_llm_call_log(&LlmCallLog {
                        log_id: format!("l-{i}"),
                        run_id: "r-1".into(),
                        session_id: sid.clone(),
                        model: "mock".into(),
                        message_count: 3,
                        usage: Some(Usage::new(10, 5)),
                        duration_ms: 7,
                        status: crate::store::LlmCallStatus::Ok,
                        error: None,
                        created_at: Utc::now(),
                    })
                    .await
                    .unwrap();
            }

            let stats = store.stats().await.unwrap();
            assert_eq!(stats.sessions, 1);
            assert_eq!(stats.llm_calls, 2);
            assert_eq!(stats.total_input_tokens, 20);
            assert_eq!(stats.total_output_tokens, 10);

            let logs = store
                .list_llm_call_logs(&LogFilter::run("r-1"))
                .await
                .unwrap();
            assert_eq!(logs.len(), 2);
        }
    }
}
