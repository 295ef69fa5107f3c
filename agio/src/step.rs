//! The canonical transcript data model.
//!
//! A session is an ordered, append-only list of [`Step`]s with dense
//! sequences starting at 1. Steps are created by the run coordinator and
//! owned by the session store; the only permitted mutation is the store's
//! truncate-suffix operation used for retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a transcript step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    /// A user query.
    User,
    /// A model response, possibly carrying tool calls.
    Assistant,
    /// A tool result paired with an earlier assistant tool call.
    Tool,
}

impl StepRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call recorded on an assistant step.
///
/// `arguments` is the original JSON-encoded string exactly as the provider
/// produced it; it is never re-encoded or pretty-printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepToolCall {
    /// Call identifier, stable within the step.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// JSON-encoded argument string.
    pub arguments: String,
}

impl StepToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Per-step execution metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Tokens in the prompt sent to the model.
    #[serde(default)]
    pub input_tokens: u32,
    /// Tokens generated by the model.
    #[serde(default)]
    pub output_tokens: u32,
    /// Total token count.
    #[serde(default)]
    pub total_tokens: u32,
    /// Wall-clock duration of the step in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Latency to the first non-empty token, when streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<u64>,
}

/// The atomic transcript unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// The owning session.
    pub session_id: String,
    /// Dense 1-based position within the session.
    pub sequence: u64,
    /// Role of the step.
    pub role: StepRole,
    /// Text content. May be empty for assistant steps that only carry tool
    /// calls and for tool steps that only carry structured results.
    pub content: String,
    /// Tool calls requested by an assistant step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StepToolCall>>,
    /// For tool steps: the call id this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool steps: the originating tool name.
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// For tool steps: whether the tool failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Execution metrics, when measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Returns `true` if this step carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }

    /// Returns the call ids of this step's tool calls, in order.
    #[must_use]
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(|c| c.id.as_str()).collect())
            .unwrap_or_default()
    }
}

/// A step before the store assigns its identity.
///
/// [`crate::store::SessionStore::append_step`] consumes a `NewStep`, assigns
/// the next dense sequence atomically, stamps `created_at`, and returns the
/// persisted [`Step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStep {
    /// Role of the step.
    pub role: StepRole,
    /// Text content.
    pub content: String,
    /// Tool calls (assistant steps only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StepToolCall>>,
    /// Answered call id (tool steps only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Originating tool name (tool steps only).
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Whether the tool failed (tool steps only).
    #[serde(default)]
    pub is_error: bool,
    /// Execution metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

impl NewStep {
    /// Create a user step.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: StepRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            metrics: None,
        }
    }

    /// Create a plain assistant step.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: StepRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            metrics: None,
        }
    }

    /// Create an assistant step carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<StepToolCall>,
    ) -> Self {
        Self {
            role: StepRole::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            metrics: None,
        }
    }

    /// Create a tool-result step.
    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: StepRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            is_error,
            metrics: None,
        }
    }

    /// Attach execution metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Materialize into a [`Step`] with the given identity.
    #[must_use]
    pub fn into_step(self, session_id: impl Into<String>, sequence: u64) -> Step {
        Step {
            session_id: session_id.into(),
            sequence,
            role: self.role,
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: self.tool_call_id,
            tool_name: self.tool_name,
            is_error: self.is_error,
            metrics: self.metrics,
            created_at: Utc::now(),
        }
    }

    /// Returns `true` if this step carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_serde() {
        for role in [StepRole::User, StepRole::Assistant, StepRole::Tool] {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
            let parsed: StepRole = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn constructors_set_roles() {
        assert_eq!(NewStep::user("hi").role, StepRole::User);
        assert_eq!(NewStep::assistant("hello").role, StepRole::Assistant);

        let tool = NewStep::tool("c1", "add", "3", false);
        assert_eq!(tool.role, StepRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool.tool_name.as_deref(), Some("add"));
        assert!(!tool.is_error);
    }

    #[test]
    fn into_step_assigns_identity() {
        let step = NewStep::assistant_with_tool_calls(
            "",
            vec![StepToolCall::new("c1", "add", r#"{"a":1,"b":2}"#)],
        )
        .into_step("s-1", 2);

        assert_eq!(step.session_id, "s-1");
        assert_eq!(step.sequence, 2);
        assert!(step.has_tool_calls());
        assert_eq!(step.tool_call_ids(), vec!["c1"]);
    }

    #[test]
    fn tool_name_serializes_as_name() {
        let step = NewStep::tool("c1", "add", "3", true).into_step("s", 3);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["name"], "add");
        assert_eq!(json["is_error"], true);
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn is_error_false_is_omitted() {
        let step = NewStep::assistant("ok").into_step("s", 1);
        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("is_error").is_none());
    }

    #[test]
    fn arguments_are_kept_verbatim() {
        // Deliberately odd spacing must survive untouched.
        let call = StepToolCall::new("c9", "search", r#"{ "q" :"rust"}"#);
        assert_eq!(call.arguments, r#"{ "q" :"rust"}"#);
    }
}
