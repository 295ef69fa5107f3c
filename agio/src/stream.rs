//! Streaming response types for LLM operations.
//!
//! Providers deliver assistant output as a sequence of [`StreamChunk`]s.
//! Tool-call pieces arrive indexed: the name comes with the first fragment,
//! arguments accrue across fragments, and the call id may surface in any
//! fragment. [`StepAggregator`] folds the chunks back into the canonical
//! assistant content and tool-call list.

use serde::{Deserialize, Serialize};

use crate::step::StepToolCall;
use crate::usage::Usage;

/// A chunk of streaming response from an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Text content chunk.
    Text(String),

    /// Start of a tool call at the given index.
    ToolUseStart {
        /// Index of this tool call in the response.
        index: usize,
        /// Call identifier, if already known.
        id: Option<String>,
        /// Name of the function being called.
        name: String,
    },

    /// Partial arguments for an in-progress tool call.
    ToolUseDelta {
        /// Index of the tool call being updated.
        index: usize,
        /// Call identifier, when it first surfaces in a later fragment.
        id: Option<String>,
        /// Partial JSON arguments.
        partial_json: String,
    },

    /// Tool call at the given index is complete.
    ToolUseComplete {
        /// Index of the completed tool call.
        index: usize,
    },

    /// Token usage information (usually the final data chunk).
    Usage(Usage),

    /// Stream is complete.
    Done {
        /// Stop reason from the model.
        stop_reason: Option<StopReason>,
    },

    /// Error during streaming.
    Error {
        /// Error message.
        message: String,
    },
}

impl StreamChunk {
    /// Creates a text chunk.
    #[inline]
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Creates a tool use start chunk.
    #[must_use]
    pub fn tool_use_start(
        index: usize,
        id: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::ToolUseStart {
            index,
            id,
            name: name.into(),
        }
    }

    /// Creates a tool use delta chunk.
    #[must_use]
    pub fn tool_use_delta(
        index: usize,
        id: Option<String>,
        partial_json: impl Into<String>,
    ) -> Self {
        Self::ToolUseDelta {
            index,
            id,
            partial_json: partial_json.into(),
        }
    }

    /// Creates a done chunk.
    #[must_use]
    pub const fn done(stop_reason: Option<StopReason>) -> Self {
        Self::Done { stop_reason }
    }

    /// Creates an error chunk.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns the text content if this is a text chunk.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns `true` if this is a done chunk.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Reason why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StopReason {
    /// Natural stop (end of response).
    #[default]
    Stop,
    /// Maximum token limit reached.
    Length,
    /// Model decided to call tools.
    ToolCalls,
    /// Content was filtered by safety systems.
    ContentFilter,
}

impl StopReason {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }

    /// Parse from a provider finish-reason string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    /// Returns `true` if the model called tools.
    #[must_use]
    pub const fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCalls)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Aggregator for building a canonical assistant step from stream chunks.
///
/// Per-index state tracks `{id, name, arguments}`. The id becomes stable the
/// first time it is seen; fragments without an id attach to their index
/// slot. The final tool-call order is index order regardless of arrival
/// interleaving.
#[derive(Debug, Clone, Default)]
pub struct StepAggregator {
    text: String,
    tool_calls: std::collections::BTreeMap<usize, ToolCallBuilder>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
}

impl StepAggregator {
    /// Creates a new aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a stream chunk to the aggregator.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => {
                self.text.push_str(text);
            }
            StreamChunk::ToolUseStart { index, id, name } => {
                let entry = self.tool_calls.entry(*index).or_default();
                if let Some(id) = id {
                    entry.id.clone_from(id);
                }
                entry.name.clone_from(name);
            }
            StreamChunk::ToolUseDelta {
                index,
                id,
                partial_json,
            } => {
                let entry = self.tool_calls.entry(*index).or_default();
                if entry.id.is_empty()
                    && let Some(id) = id
                {
                    entry.id.clone_from(id);
                }
                entry.arguments.push_str(partial_json);
            }
            StreamChunk::Usage(usage) => {
                self.usage = Some(*usage);
            }
            StreamChunk::Done { stop_reason } => {
                self.stop_reason = *stop_reason;
            }
            StreamChunk::ToolUseComplete { .. } | StreamChunk::Error { .. } => {}
        }
    }

    /// Returns the accumulated text so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the accumulated usage, if any chunk reported it.
    #[must_use]
    pub const fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Returns the stop reason, if the stream reported one.
    #[must_use]
    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Returns `true` if any tool calls have been started.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Builds the final tool-call list in index order.
    #[must_use]
    pub fn build_tool_calls(&self) -> Vec<StepToolCall> {
        self.tool_calls
            .values()
            .map(|tc| StepToolCall::new(&tc.id, &tc.name, &tc.arguments))
            .collect()
    }

    /// Consumes the aggregator into `(content, tool_calls)`.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<StepToolCall>) {
        let calls = self.build_tool_calls();
        (self.text, calls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod stop_reason {
        use super::*;

        #[test]
        fn parse_provider_strings() {
            assert_eq!(StopReason::parse("stop"), StopReason::Stop);
            assert_eq!(StopReason::parse("end_turn"), StopReason::Stop);
            assert_eq!(StopReason::parse("max_tokens"), StopReason::Length);
            assert_eq!(StopReason::parse("tool_use"), StopReason::ToolCalls);
            assert_eq!(StopReason::parse("TOOL_CALLS"), StopReason::ToolCalls);
        }

        #[test]
        fn display_matches_as_str() {
            assert_eq!(StopReason::ToolCalls.to_string(), "tool_calls");
            assert!(StopReason::ToolCalls.is_tool_call());
        }
    }

    mod aggregator {
        use super::*;

        #[test]
        fn text_accumulates_in_order() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::text("Hel"));
            agg.apply(&StreamChunk::text("lo!"));
            assert_eq!(agg.text(), "Hello!");
            assert!(!agg.has_tool_calls());
        }

        #[test]
        fn tool_call_assembles_across_fragments() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::tool_use_start(0, Some("c1".into()), "add"));
            agg.apply(&StreamChunk::tool_use_delta(0, None, r#"{"a":"#));
            agg.apply(&StreamChunk::tool_use_delta(0, None, r#"1,"b":2}"#));
            agg.apply(&StreamChunk::ToolUseComplete { index: 0 });

            let calls = agg.build_tool_calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "c1");
            assert_eq!(calls[0].name, "add");
            assert_eq!(calls[0].arguments, r#"{"a":1,"b":2}"#);
        }

        #[test]
        fn call_id_may_arrive_in_a_later_fragment() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::tool_use_start(0, None, "search"));
            agg.apply(&StreamChunk::tool_use_delta(0, Some("c7".into()), r#"{"q":"#));
            // A second id for the same index never displaces the first.
            agg.apply(&StreamChunk::tool_use_delta(0, Some("bogus".into()), r#""x"}"#));

            let calls = agg.build_tool_calls();
            assert_eq!(calls[0].id, "c7");
            assert_eq!(calls[0].arguments, r#"{"q":"x"}"#);
        }

        #[test]
        fn interleaved_indices_come_out_in_index_order() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::tool_use_start(1, Some("c2".into()), "fast"));
            agg.apply(&StreamChunk::tool_use_start(0, Some("c1".into()), "slow"));
            agg.apply(&StreamChunk::tool_use_delta(1, None, "{}"));
            agg.apply(&StreamChunk::tool_use_delta(0, None, "{}"));

            let calls = agg.build_tool_calls();
            assert_eq!(calls[0].id, "c1");
            assert_eq!(calls[1].id, "c2");
        }

        #[test]
        fn usage_and_stop_reason_are_captured() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::text("hi"));
            agg.apply(&StreamChunk::Usage(Usage::new(5, 2)));
            agg.apply(&StreamChunk::done(Some(StopReason::Stop)));

            assert_eq!(agg.usage(), Some(Usage::new(5, 2)));
            assert_eq!(agg.stop_reason(), Some(StopReason::Stop));

            let (content, calls) = agg.into_parts();
            assert_eq!(content, "hi");
            assert!(calls.is_empty());
        }

        #[test]
        fn mixed_text_and_tool_calls() {
            let mut agg = StepAggregator::new();
            agg.apply(&StreamChunk::text("Let me check."));
            agg.apply(&StreamChunk::tool_use_start(0, Some("c1".into()), "lookup"));
            agg.apply(&StreamChunk::tool_use_delta(0, None, r#"{"k":"v"}"#));

            let (content, calls) = agg.into_parts();
            assert_eq!(content, "Let me check.");
            assert_eq!(calls.len(), 1);
        }
    }
}
