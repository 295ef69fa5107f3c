//! The LLM provider seam.
//!
//! [`ChatProvider`] is the trait concrete model clients implement. The
//! runtime only depends on this interface; actual HTTP clients live outside
//! the crate. [`provider::mock`](mock) ships a scriptable implementation for
//! tests.

pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{WireMessage, WireToolCall};
use crate::stream::{StopReason, StreamChunk};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// A chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (e.g. "gpt-4o").
    #[serde(default)]
    pub model: String,

    /// Conversation messages.
    #[serde(default)]
    pub messages: Vec<WireMessage>,

    /// Tools available for the model to call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Whether the model may emit several tool calls per turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response.
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Creates a request with the given model and messages.
    #[must_use]
    pub fn with_messages(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Sets the available tools.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Enables or disables parallel tool calls.
    #[must_use]
    pub const fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = Some(enabled);
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the max token budget.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Marks the request as streaming.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A complete chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated assistant message.
    pub message: WireMessage,
    /// Token usage, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Why generation stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ChatResponse {
    /// Creates a new response wrapping a message.
    #[must_use]
    pub const fn new(message: WireMessage) -> Self {
        Self {
            message,
            usage: None,
            stop_reason: None,
        }
    }

    /// Attaches usage statistics.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attaches a stop reason.
    #[must_use]
    pub const fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    /// Returns the text content of the response.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.message.content
    }

    /// Returns the tool calls of the response, if any.
    #[must_use]
    pub const fn tool_calls(&self) -> Option<&Vec<WireToolCall>> {
        self.message.tool_calls.as_ref()
    }
}

/// Stream of chunks from a streaming chat call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// The trait all LLM providers implement.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Name of this provider, for logs and error messages.
    fn provider_name(&self) -> &'static str;

    /// Send a chat completion request and receive a complete response.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Model`] if the provider call fails.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and receive a chunk stream.
    ///
    /// The default implementation performs a blocking [`chat`](Self::chat)
    /// call and replays the response as synthetic chunks, so non-streaming
    /// providers still satisfy the executor's streaming contract.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Model`] if the provider call fails.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let response = self.chat(request).await?;
        let mut chunks: Vec<Result<StreamChunk>> = Vec::new();

        if !response.message.content.is_empty() {
            chunks.push(Ok(StreamChunk::text(&response.message.content)));
        }
        if let Some(calls) = &response.message.tool_calls {
            for (index, call) in calls.iter().enumerate() {
                chunks.push(Ok(StreamChunk::tool_use_start(
                    index,
                    Some(call.id.clone()),
                    &call.function.name,
                )));
                chunks.push(Ok(StreamChunk::tool_use_delta(
                    index,
                    None,
                    &call.function.arguments,
                )));
                chunks.push(Ok(StreamChunk::ToolUseComplete { index }));
            }
        }
        if let Some(usage) = response.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        chunks.push(Ok(StreamChunk::done(response.stop_reason)));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Type alias for an Arc-wrapped provider.
pub type SharedProvider = std::sync::Arc<dyn ChatProvider>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    struct OneShot;

    #[async_trait]
    impl ChatProvider for OneShot {
        fn provider_name(&self) -> &'static str {
            "one-shot"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse::new(WireMessage::assistant_with_tool_calls(
                "calling",
                vec![WireToolCall::function("c1", "add", r#"{"a":1}"#)],
            ))
            .with_usage(Usage::new(3, 2))
            .with_stop_reason(StopReason::ToolCalls))
        }
    }

    #[tokio::test]
    async fn default_chat_stream_replays_response() {
        let provider = OneShot;
        let request = ChatRequest::with_messages("m", vec![WireMessage::user("hi")]);
        let mut stream = provider.chat_stream(&request).await.unwrap();

        let mut agg = crate::stream::StepAggregator::new();
        while let Some(chunk) = stream.next().await {
            agg.apply(&chunk.unwrap());
        }

        assert_eq!(agg.text(), "calling");
        assert_eq!(agg.usage(), Some(Usage::new(3, 2)));
        let calls = agg.build_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].arguments, r#"{"a":1}"#);
    }

    #[test]
    fn request_builder_sets_fields() {
        let request = ChatRequest::with_messages("gpt-4o", vec![])
            .parallel_tool_calls(true)
            .temperature(0.2)
            .streaming();
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.parallel_tool_calls, Some(true));
        assert!(request.stream);
    }
}
