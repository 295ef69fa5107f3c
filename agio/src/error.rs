//! Error types for the agio runtime.
//!
//! [`Error`] is the crate-wide error enum; [`ToolError`] is the tool-level
//! failure type that the dispatcher always catches and materializes into a
//! tool step, so it never aborts a run on its own.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration or caller misuse.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration issue.
        message: String,
    },

    /// A session, run, checkpoint, or trace was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind ("session", "run", "checkpoint", ...).
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A wire message could not be converted into a transcript step.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// What made the message unusable.
        message: String,
    },

    /// An internal invariant was violated. Always carries a diagnostic.
    #[error("invariant violation: {message}")]
    Invariant {
        /// Diagnostic text describing the broken invariant.
        message: String,
    },

    /// The LLM provider failed. Fatal to the current run.
    #[error("model error: {message}")]
    Model {
        /// The underlying provider error message.
        message: String,
    },

    /// The run was cancelled by the caller.
    #[error("run cancelled")]
    Cancelled,

    /// A step or run exceeded its configured deadline.
    #[error("{scope} timed out after {ms} ms")]
    Timeout {
        /// What timed out ("step", "run").
        scope: &'static str,
        /// The deadline in milliseconds.
        ms: u64,
    },

    /// The run exhausted its step budget.
    #[error("maximum steps reached ({max_steps})")]
    MaxSteps {
        /// The configured step budget.
        max_steps: usize,
    },

    /// The session store failed.
    #[error("store error: {message}")]
    Store {
        /// The underlying storage error message.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new not-found error for the given entity kind.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a new malformed-message error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create a new invariant-violation error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Create a new model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    #[must_use]
    pub const fn timeout(scope: &'static str, ms: u64) -> Self {
        Self::Timeout { scope, ms }
    }

    /// Create a new max-steps error.
    #[must_use]
    pub const fn max_steps(max_steps: usize) -> Self {
        Self::MaxSteps { max_steps }
    }

    /// Create a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Returns `true` if this error denotes a missing entity.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Errors produced by individual tools.
///
/// These are caught inside the tool dispatcher and recorded as
/// `is_error=true` tool steps; they never propagate out of a batch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool with the requested name is registered.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// The arguments did not match the tool's declared schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool body failed.
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Create a new execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_diagnostics() {
        let err = Error::config("max_steps must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: max_steps must be positive"
        );

        let err = Error::not_found("session", "s-42");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "session not found: s-42");

        let err = Error::timeout("step", 120_000);
        assert_eq!(err.to_string(), "step timed out after 120000 ms");
    }

    #[test]
    fn json_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn tool_error_display() {
        assert_eq!(
            ToolError::NotFound("adder".into()).to_string(),
            "tool 'adder' not found"
        );
        assert_eq!(
            ToolError::InvalidArguments("missing field `a`".into()).to_string(),
            "invalid arguments: missing field `a`"
        );
    }
}
