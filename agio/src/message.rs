//! Wire message types and the step adapter.
//!
//! [`WireMessage`] is the chat-completions message shape sent to LLM
//! providers. [`step_to_message`] and [`message_to_step`] are the pure
//! conversion functions between persisted [`Step`]s and wire messages; they
//! perform no I/O and keep tool-call arguments as the original JSON-encoded
//! strings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::step::{NewStep, Step, StepRole, StepToolCall};

/// Role of a wire message.
///
/// Unlike [`StepRole`], this includes `system`: system prompts exist only on
/// the wire and are never persisted as steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    /// System instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool response message.
    Tool,
}

impl WireRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// The function part of a wire tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFunction {
    /// Function name.
    pub name: String,
    /// JSON-encoded argument string, carried verbatim.
    pub arguments: String,
}

/// A tool call as it appears in an assistant wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Call identifier.
    pub id: String,
    /// Call type (always "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: WireFunction,
}

impl WireToolCall {
    /// Create a new function tool call.
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_owned(),
            function: WireFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A message in the provider wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Role of the message.
    pub role: WireRole,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool calls (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    /// The call id this message answers (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Originating tool name (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl WireMessage {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: WireRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: WireRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a plain assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: WireRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<WireToolCall>,
    ) -> Self {
        Self {
            role: WireRole::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a tool response message.
    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: WireRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Returns `true` if this message has tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

/// Convert a persisted step to the provider wire format.
#[must_use]
pub fn step_to_message(step: &Step) -> WireMessage {
    let role = match step.role {
        StepRole::User => WireRole::User,
        StepRole::Assistant => WireRole::Assistant,
        StepRole::Tool => WireRole::Tool,
    };

    WireMessage {
        role,
        content: step.content.clone(),
        tool_calls: step.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| WireToolCall::function(&c.id, &c.name, &c.arguments))
                .collect()
        }),
        tool_call_id: step.tool_call_id.clone(),
        name: step.tool_name.clone(),
    }
}

/// Convert a wire message back into a step for the given session position.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] when the role is `system` (not a
/// transcript role) or a tool message lacks `tool_call_id`.
pub fn message_to_step(
    message: &WireMessage,
    session_id: impl Into<String>,
    sequence: u64,
) -> Result<Step> {
    let role = match message.role {
        WireRole::User => StepRole::User,
        WireRole::Assistant => StepRole::Assistant,
        WireRole::Tool => StepRole::Tool,
        WireRole::System => {
            return Err(Error::malformed("system messages are not transcript steps"));
        }
    };

    if role == StepRole::Tool && message.tool_call_id.is_none() {
        return Err(Error::malformed("tool message lacks tool_call_id"));
    }

    let draft = NewStep {
        role,
        content: message.content.clone(),
        tool_calls: message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| StepToolCall::new(&c.id, &c.function.name, &c.function.arguments))
                .collect()
        }),
        tool_call_id: message.tool_call_id.clone(),
        tool_name: message.name.clone(),
        is_error: false,
        metrics: None,
    };

    Ok(draft.into_step(session_id, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::NewStep;

    fn assert_semantic_eq(a: &Step, b: &Step) {
        assert_eq!(a.role, b.role);
        assert_eq!(a.content, b.content);
        assert_eq!(a.tool_calls, b.tool_calls);
        assert_eq!(a.tool_call_id, b.tool_call_id);
        assert_eq!(a.tool_name, b.tool_name);
    }

    #[test]
    fn user_step_round_trips() {
        let step = NewStep::user("what is 2+2?").into_step("s-1", 1);
        let restored = message_to_step(&step_to_message(&step), "s-1", 1).unwrap();
        assert_semantic_eq(&step, &restored);
        assert_eq!(restored.sequence, 1);
        assert_eq!(restored.session_id, "s-1");
    }

    #[test]
    fn assistant_with_tool_calls_round_trips() {
        let step = NewStep::assistant_with_tool_calls(
            "",
            vec![
                StepToolCall::new("c1", "add", r#"{"a":1,"b":2}"#),
                StepToolCall::new("c2", "mul", r#"{"a":3,"b":4}"#),
            ],
        )
        .into_step("s-1", 2);

        let wire = step_to_message(&step);
        assert_eq!(wire.role, WireRole::Assistant);
        let calls = wire.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.arguments, r#"{"a":1,"b":2}"#);

        let restored = message_to_step(&wire, "s-1", 2).unwrap();
        assert_semantic_eq(&step, &restored);
    }

    #[test]
    fn tool_step_round_trips() {
        let step = NewStep::tool("c1", "add", "3", false).into_step("s-1", 3);
        let wire = step_to_message(&step);
        assert_eq!(wire.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(wire.name.as_deref(), Some("add"));

        let restored = message_to_step(&wire, "s-1", 3).unwrap();
        assert_semantic_eq(&step, &restored);
    }

    #[test]
    fn system_message_is_rejected() {
        let err = message_to_step(&WireMessage::system("be nice"), "s-1", 1).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage { .. }));
    }

    #[test]
    fn tool_message_without_call_id_is_rejected() {
        let message = WireMessage {
            role: WireRole::Tool,
            content: "3".into(),
            tool_calls: None,
            tool_call_id: None,
            name: Some("add".into()),
        };
        let err = message_to_step(&message, "s-1", 1).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage { .. }));
    }

    #[test]
    fn wire_serialization_shape() {
        let wire = WireMessage::assistant_with_tool_calls(
            "",
            vec![WireToolCall::function("c1", "add", r#"{"a":1}"#)],
        );
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(json["tool_calls"][0]["function"]["arguments"], r#"{"a":1}"#);
        assert!(json.get("tool_call_id").is_none());
    }
}
