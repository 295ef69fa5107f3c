//! Checkpoints, forking, and retry.
//!
//! A checkpoint is an immutable snapshot of a session prefix plus run
//! metrics and an agent-config descriptor. Forking physically copies a step
//! prefix into a fresh session so the two transcripts can diverge; retry is
//! the store's single permitted suffix deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::run::RunMetrics;
use crate::step::{NewStep, Step, StepRole};
use crate::store::{Session, SessionStore as _, SharedStore};

/// An immutable snapshot sufficient to restart or fork a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub checkpoint_id: String,
    /// The run that was snapshotted.
    pub run_id: String,
    /// The session the run writes to.
    pub session_id: String,
    /// The snapshot covers steps `1..=at_sequence`.
    pub at_sequence: u64,
    /// The captured step prefix.
    pub captured_steps: Vec<Step>,
    /// Run metrics at capture time.
    pub captured_metrics: RunMetrics,
    /// Descriptor of the agent configuration in effect.
    pub agent_config: Value,
    /// Caller-supplied modifications, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_modifications: Option<Value>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Options for [`CheckpointManager::create_checkpoint`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Descriptor of the agent configuration in effect.
    pub agent_config: Value,
    /// Caller-supplied modifications to record.
    pub user_modifications: Option<Value>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Human-readable description.
    pub description: Option<String>,
}

/// Modifications applied while forking a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkModifications {
    /// Replaces the content of the last user step in the copied prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_query: Option<String>,
}

/// Store-backed checkpoint and fork operations.
#[derive(Clone)]
pub struct CheckpointManager {
    store: SharedStore,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Create a manager over the given store.
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Snapshot a run's session up to `at_sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run and [`Error::Config`]
    /// when `at_sequence` lies beyond the last persisted step.
    pub async fn create_checkpoint(
        &self,
        run_id: &str,
        at_sequence: u64,
        options: CheckpointOptions,
    ) -> Result<Checkpoint> {
        let run = self.store.get_run(run_id).await?;
        let tip = self.tip_sequence(&run.session_id).await?;
        if at_sequence > tip {
            return Err(Error::config(format!(
                "checkpoint at_sequence {at_sequence} is beyond the last persisted step {tip}"
            )));
        }

        let captured_steps = self
            .store
            .list_steps(&run.session_id, Some((1, Some(at_sequence))))
            .await?;

        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            at_sequence,
            captured_steps,
            captured_metrics: run.metrics,
            agent_config: options.agent_config,
            user_modifications: options.user_modifications,
            tags: options.tags,
            description: options.description,
            created_at: Utc::now(),
        };

        self.store.save_checkpoint(&checkpoint).await?;
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            run_id,
            at_sequence,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Fork a session at `fork_at_sequence` into a fresh session.
    ///
    /// Steps `1..=fork_at_sequence` are copied with their relative order
    /// preserved; `modifications.modified_query` replaces the content of the
    /// last user step in the copied prefix. The source session is never
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `fork_at_sequence` is zero or beyond
    /// the last persisted step of the source session.
    pub async fn fork(
        &self,
        source_session_id: &str,
        fork_at_sequence: u64,
        modifications: Option<ForkModifications>,
    ) -> Result<Session> {
        let tip = self.tip_sequence(source_session_id).await?;
        if fork_at_sequence == 0 || fork_at_sequence > tip {
            return Err(Error::config(format!(
                "fork_at_sequence {fork_at_sequence} must be within 1..={tip}"
            )));
        }

        let prefix = self
            .store
            .list_steps(source_session_id, Some((1, Some(fork_at_sequence))))
            .await?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            "forked_from".to_owned(),
            Value::String(source_session_id.to_owned()),
        );
        metadata.insert("fork_at_sequence".to_owned(), Value::from(fork_at_sequence));
        let session = self.store.create_session(None, metadata).await?;

        self.copy_prefix(&session.session_id, prefix, modifications.unwrap_or_default())
            .await?;

        info!(
            source = source_session_id,
            fork_at_sequence,
            new_session = %session.session_id,
            "Session forked"
        );
        Ok(session)
    }

    /// Seed a fresh session from a checkpoint's captured steps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown checkpoint.
    pub async fn fork_from_checkpoint(
        &self,
        checkpoint_id: &str,
        modifications: Option<ForkModifications>,
    ) -> Result<Session> {
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            "forked_from_checkpoint".to_owned(),
            Value::String(checkpoint.checkpoint_id.clone()),
        );
        let session = self.store.create_session(None, metadata).await?;

        self.copy_prefix(
            &session.session_id,
            checkpoint.captured_steps,
            modifications.unwrap_or_default(),
        )
        .await?;
        Ok(session)
    }

    /// Truncate steps with `sequence >= from_sequence` so the next run
    /// continues from there. Returns the number of deleted steps.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn retry(&self, session_id: &str, from_sequence: u64) -> Result<u64> {
        let deleted = self.store.truncate_suffix(session_id, from_sequence).await?;
        info!(session_id, from_sequence, deleted, "Session suffix truncated for retry");
        Ok(deleted)
    }

    async fn tip_sequence(&self, session_id: &str) -> Result<u64> {
        Ok(self
            .store
            .get_last_step(session_id)
            .await?
            .map_or(0, |step| step.sequence))
    }

    async fn copy_prefix(
        &self,
        target_session_id: &str,
        prefix: Vec<Step>,
        modifications: ForkModifications,
    ) -> Result<()> {
        let last_user_seq = modifications.modified_query.as_ref().and_then(|_| {
            prefix
                .iter()
                .rev()
                .find(|s| s.role == StepRole::User)
                .map(|s| s.sequence)
        });

        for step in prefix {
            let mut draft = NewStep {
                role: step.role,
                content: step.content,
                tool_calls: step.tool_calls,
                tool_call_id: step.tool_call_id,
                tool_name: step.tool_name,
                is_error: step.is_error,
                metrics: step.metrics,
            };
            if Some(step.sequence) == last_user_seq
                && let Some(query) = &modifications.modified_query
            {
                draft.content.clone_from(query);
            }
            self.store.append_step(target_session_id, draft).await?;
        }
        Ok(())
    }
}
