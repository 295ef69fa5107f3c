//! Token usage tracking for LLM operations.
//!
//! [`Usage`] follows the chat-completions usage object and supports
//! accumulation across steps via `Add`/`AddAssign`.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage statistics from an LLM operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input/prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u32,

    /// Number of tokens in the output/completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u32,

    /// Total tokens used (input + output).
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Returns `true` if no tokens were recorded.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_computes_total() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.total_tokens, 150);
        assert!(!usage.is_zero());
    }

    #[test]
    fn accumulation() {
        let mut total = Usage::zero();
        assert!(total.is_zero());

        total += Usage::new(100, 50);
        total += Usage::new(10, 5);
        assert_eq!(total, Usage::new(110, 55));
        assert_eq!((total + Usage::new(1, 1)).total_tokens, 167);
    }

    #[test]
    fn deserializes_provider_aliases() {
        let usage: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}"#)
                .unwrap();
        assert_eq!(usage, Usage::new(7, 3));
    }
}
