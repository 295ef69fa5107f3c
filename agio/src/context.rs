//! Context assembly for LLM calls.
//!
//! [`ContextBuilder`] reads a session's persisted steps in ascending
//! sequence order and produces the wire message sequence for the next model
//! call, optionally prepending a synthetic system message (never persisted)
//! and applying a soft message cap.

use crate::error::Result;
use crate::message::{WireMessage, step_to_message};
use crate::store::{SessionStore, StepRange};

/// Builds the ordered message sequence for one LLM call.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    system_prompt: Option<String>,
    range: Option<StepRange>,
    max_messages: Option<usize>,
}

impl ContextBuilder {
    /// Create a builder covering the full session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a system message.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.is_empty()).then_some(prompt);
        self
    }

    /// Restrict to an inclusive sequence range.
    #[must_use]
    pub const fn with_range(mut self, start_seq: u64, end_seq: Option<u64>) -> Self {
        self.range = Some((start_seq, end_seq));
        self
    }

    /// Soft-cap the number of messages, keeping the most recent ones (the
    /// system message always survives).
    #[must_use]
    pub const fn with_max_messages(mut self, cap: usize) -> Self {
        self.max_messages = Some(cap);
        self
    }

    /// Assemble the message sequence from the store.
    ///
    /// Tolerates a range that cuts between an assistant step and its tool
    /// replies: the resulting sequence simply carries the assistant message
    /// with unanswered tool calls, which the coordinator's resume path
    /// handles by dispatching the missing calls instead of calling the LLM.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] when the session does not exist.
    /// Never fails on an empty session.
    pub async fn build(
        &self,
        store: &dyn SessionStore,
        session_id: &str,
    ) -> Result<Vec<WireMessage>> {
        let steps = store.list_steps(session_id, self.range).await?;

        let mut messages = Vec::with_capacity(steps.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(WireMessage::system(prompt));
        }
        messages.extend(steps.iter().map(step_to_message));

        if let Some(cap) = self.max_messages
            && messages.len() > cap
        {
            let has_system = self.system_prompt.is_some();
            let keep_tail = cap.saturating_sub(usize::from(has_system)).max(1);
            let mut capped = Vec::with_capacity(cap);
            if has_system {
                capped.push(messages[0].clone());
            }
            capped.extend(messages[messages.len() - keep_tail..].iter().cloned());
            messages = capped;
        }

        Ok(messages)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::message::WireRole;
    use crate::step::{NewStep, StepToolCall};
    use crate::store::SessionStore;
    use crate::store::memory::MemoryStore;
    use std::collections::HashMap;

    async fn seeded() -> (MemoryStore, String) {
        let store = MemoryStore::new();
        let session = store.create_session(None, HashMap::new()).await.unwrap();
        let sid = session.session_id.clone();
        store.append_step(&sid, NewStep::user("2+2?")).await.unwrap();
        store
            .append_step(
                &sid,
                NewStep::assistant_with_tool_calls(
                    "",
                    vec![StepToolCall::new("c1", "add", r#"{"a":2,"b":2}"#)],
                ),
            )
            .await
            .unwrap();
        store
            .append_step(&sid, NewStep::tool("c1", "add", "4", false))
            .await
            .unwrap();
        store.append_step(&sid, NewStep::assistant("4")).await.unwrap();
        (store, sid)
    }

    #[tokio::test]
    async fn full_session_in_sequence_order() {
        let (store, sid) = seeded().await;
        let messages = ContextBuilder::new().build(&store, &sid).await.unwrap();

        let roles: Vec<WireRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                WireRole::User,
                WireRole::Assistant,
                WireRole::Tool,
                WireRole::Assistant
            ]
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn system_prompt_is_prepended_not_persisted() {
        let (store, sid) = seeded().await;
        let messages = ContextBuilder::new()
            .with_system_prompt("be terse")
            .build(&store, &sid)
            .await
            .unwrap();

        assert_eq!(messages[0].role, WireRole::System);
        assert_eq!(messages.len(), 5);
        // Store is untouched.
        assert_eq!(store.list_steps(&sid, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn empty_session_yields_system_only() {
        let store = MemoryStore::new();
        let session = store.create_session(None, HashMap::new()).await.unwrap();

        let bare = ContextBuilder::new()
            .build(&store, &session.session_id)
            .await
            .unwrap();
        assert!(bare.is_empty());

        let with_system = ContextBuilder::new()
            .with_system_prompt("hi")
            .build(&store, &session.session_id)
            .await
            .unwrap();
        assert_eq!(with_system.len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let store = MemoryStore::new();
        let err = ContextBuilder::new().build(&store, "ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn range_may_cut_tool_replies() {
        let (store, sid) = seeded().await;
        // Range stops at the assistant step; its tool reply is absent.
        let messages = ContextBuilder::new()
            .with_range(1, Some(2))
            .build(&store, &sid)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].has_tool_calls());
    }

    #[tokio::test]
    async fn cap_keeps_system_and_tail() {
        let (store, sid) = seeded().await;
        let messages = ContextBuilder::new()
            .with_system_prompt("sys")
            .with_max_messages(3)
            .build(&store, &sid)
            .await
            .unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, WireRole::System);
        // The most recent two survive.
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[2].content, "4");
    }
}
