//! Scriptable provider implementation for testing.
//!
//! [`ScriptedProvider`] replays a fixed sequence of [`ScriptedTurn`]s,
//! cycling when exhausted, and counts how many times it was called — which
//! lets tests assert that a resumed run does *not* re-query the model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use super::{ChatProvider, ChatRequest, ChatResponse, ChunkStream};
use crate::error::{Error, Result};
use crate::message::{WireMessage, WireToolCall};
use crate::stream::{StepAggregator, StopReason, StreamChunk};
use crate::usage::Usage;

/// One scripted model turn: the chunks to stream, and an optional trailing
/// failure.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    chunks: Vec<StreamChunk>,
    fail_with: Option<String>,
}

impl ScriptedTurn {
    /// A plain text turn, split into two deltas when long enough so that
    /// consumers exercise real accumulation.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        let mut chunks = Vec::new();
        if content.chars().count() > 1 {
            let mid = content.len() / 2;
            let mut split = mid;
            while !content.is_char_boundary(split) {
                split += 1;
            }
            chunks.push(StreamChunk::text(&content[..split]));
            chunks.push(StreamChunk::text(&content[split..]));
        } else if !content.is_empty() {
            chunks.push(StreamChunk::text(content));
        }
        chunks.push(StreamChunk::done(Some(StopReason::Stop)));
        Self {
            chunks,
            fail_with: None,
        }
    }

    /// A turn that requests a single tool call, with the arguments split
    /// across two fragments.
    #[must_use]
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::tool_calls(vec![(id.into(), name.into(), arguments.into())])
    }

    /// A turn that requests several tool calls.
    #[must_use]
    pub fn tool_calls(calls: Vec<(String, String, String)>) -> Self {
        let mut chunks = Vec::new();
        for (index, (id, name, arguments)) in calls.into_iter().enumerate() {
            chunks.push(StreamChunk::tool_use_start(index, Some(id), name));
            let mid = arguments.len() / 2;
            let mut split = mid;
            while !arguments.is_char_boundary(split) {
                split += 1;
            }
            chunks.push(StreamChunk::tool_use_delta(index, None, &arguments[..split]));
            chunks.push(StreamChunk::tool_use_delta(index, None, &arguments[split..]));
            chunks.push(StreamChunk::ToolUseComplete { index });
        }
        chunks.push(StreamChunk::done(Some(StopReason::ToolCalls)));
        Self {
            chunks,
            fail_with: None,
        }
    }

    /// A turn that fails mid-stream with a provider error.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            fail_with: Some(message.into()),
        }
    }

    /// Attaches usage statistics, reported just before the final chunk.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        let at = self.chunks.len().saturating_sub(1);
        self.chunks.insert(at, StreamChunk::Usage(usage));
        self
    }
}

/// A provider that replays scripted turns.
///
/// Turns cycle once exhausted, mirroring how a scripted model double keeps
/// answering in long loops (e.g. max-steps tests).
#[derive(Debug)]
pub struct ScriptedProvider {
    turns: Vec<ScriptedTurn>,
    calls: AtomicUsize,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Creates a provider from a turn script.
    #[must_use]
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns,
            calls: AtomicUsize::new(0),
            chunk_delay: None,
        }
    }

    /// Sleeps between chunks, for tests that need an open stream.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Number of chat calls made so far (streaming or not).
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> Result<ScriptedTurn> {
        if self.turns.is_empty() {
            return Err(Error::model("scripted provider has no turns"));
        }
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.turns[index % self.turns.len()].clone())
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        let turn = self.next_turn()?;
        if let Some(message) = turn.fail_with {
            return Err(Error::model(message));
        }

        let mut agg = StepAggregator::new();
        for chunk in &turn.chunks {
            agg.apply(chunk);
        }
        let usage = agg.usage();
        let stop_reason = agg.stop_reason();
        let (content, calls) = agg.into_parts();

        let message = if calls.is_empty() {
            WireMessage::assistant(content)
        } else {
            WireMessage::assistant_with_tool_calls(
                content,
                calls
                    .iter()
                    .map(|c| WireToolCall::function(&c.id, &c.name, &c.arguments))
                    .collect(),
            )
        };

        let mut response = ChatResponse::new(message);
        if let Some(usage) = usage {
            response = response.with_usage(usage);
        }
        if let Some(reason) = stop_reason {
            response = response.with_stop_reason(reason);
        }
        Ok(response)
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
        let turn = self.next_turn()?;
        let delay = self.chunk_delay;

        Ok(Box::pin(stream! {
            for chunk in turn.chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(message) = turn.fail_with {
                yield Err(Error::model(message));
            }
        }))
    }
}
